//! Internal DTOs for the exchange boundary
//!
//! The exchange collaborator's native response shapes stay outside: every
//! payload is mapped into these explicit types at the boundary and internal
//! components never see the SDK's nested optionals.

use serde::{Deserialize, Serialize};

use crate::types::{Candle, Interval, PositionSide, ProtectiveKind, Side};

/// One OHLCV row from a kline query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineRow {
    pub start_time: i64,
    pub end_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
}

impl KlineRow {
    pub fn into_candle(self, symbol: &str, interval: Interval) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval,
            start_time: self.start_time,
            end_time: self.end_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            is_final: true,
        }
    }
}

/// Per-symbol precision and minimum-order metadata
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_notional: f64,
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDto {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Absolute position quantity
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub isolated_margin: f64,
}

/// Open order as reported by the exchange (regular or conditional)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrderDto {
    pub symbol: String,
    pub order_id: String,
    /// Raw wire client order id; decoded at the boundary
    pub client_order_id: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub kind: OpenOrderKind,
    pub trigger_price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenOrderKind {
    StopMarket,
    TakeProfitMarket,
    Other,
}

impl OpenOrderKind {
    pub fn protective(&self) -> Option<ProtectiveKind> {
        match self {
            OpenOrderKind::StopMarket => Some(ProtectiveKind::Stop),
            OpenOrderKind::TakeProfitMarket => Some(ProtectiveKind::Target),
            OpenOrderKind::Other => None,
        }
    }
}

/// Market order request. Quantity is pre-formatted to the symbol's
/// quantity precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub quantity: String,
    pub client_order_id: String,
}

/// Conditional (stop/take-profit) order request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConditionalOrder {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub kind: ProtectiveKind,
    pub trigger_price: String,
    pub quantity: String,
    pub client_order_id: String,
}

/// Acknowledgement for a submitted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Point-in-time order state used by fill polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusDto {
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
}

/// One inbound account-stream event. `id` is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountEvent {
    pub id: String,
    pub kind: AccountEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEventKind {
    OrderFill(FillEvent),
    /// Anything the engine does not act on (balance pushes, etc.)
    Other,
}

/// A (possibly partial) order fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: String,
    pub order_id: String,
    /// Raw wire client order id
    pub client_order_id: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: f64,
    /// Original order quantity
    pub order_qty: f64,
    /// Quantity filled by this event
    pub filled_qty: f64,
    pub realized_pnl: f64,
    pub commission: f64,
    /// True for stop/take-profit/algo-type fills
    pub is_conditional: bool,
}
