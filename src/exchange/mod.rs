//! Exchange collaborator boundary
//!
//! The REST/WebSocket client itself lives outside this crate; the engine
//! only depends on this trait and its DTOs. All failures are structured
//! (`ExchangeError`), never exceptions for control flow.

pub mod types;

pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Interval, PositionSide};

/// Failure taxonomy for exchange calls
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Timeouts, connection resets - retryable where the call is idempotent
    #[error("network error: {0}")]
    Network(String),

    /// Request throttled by the exchange
    #[error("rate limited")]
    RateLimited,

    /// The exchange refused the request (bad params, insufficient margin, ...)
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Referenced order/position does not exist on the exchange
    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong account, disallowed symbol - never retried
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ExchangeError {
    /// True if a read-only or idempotent call may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimited)
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// The exchange operations the engine consumes.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// concurrently across symbols.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Closed klines, oldest first. `end_time` bounds the query when given.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        end_time: Option<i64>,
    ) -> ExchangeResult<Vec<KlineRow>>;

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn get_symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters>;

    /// Free balance in the quote asset
    async fn get_balance(&self) -> ExchangeResult<f64>;

    async fn get_open_positions(&self) -> ExchangeResult<Vec<PositionDto>>;

    /// Open conditional (stop/take-profit) orders for one symbol
    async fn get_open_conditional_orders(&self, symbol: &str)
        -> ExchangeResult<Vec<OpenOrderDto>>;

    async fn submit_market_order(&self, order: NewOrder) -> ExchangeResult<OrderAck>;

    async fn submit_conditional_order(
        &self,
        order: NewConditionalOrder,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_conditional_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<()>;

    async fn get_order_status(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<OrderStatusDto>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn set_margin_mode_isolated(&self, symbol: &str) -> ExchangeResult<()>;

    async fn add_isolated_margin(
        &self,
        symbol: &str,
        position_side: PositionSide,
        amount: f64,
    ) -> ExchangeResult<()>;
}
