//! Entry sizing and bracket placement
//!
//! Turns a confirmed signal into a market entry protected by a stop-loss and
//! take-profit pair. Sizing is risk-based: the distance to the stop decides
//! the quantity, the balance decides the risk budget. The protective pair
//! shares a fresh root id so later reconciliation can match the legs.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::exchange::{
    ExchangeClient, NewConditionalOrder, NewOrder, OrderStatus, SymbolFilters,
};
use crate::types::{
    ClientOrderId, OrderTag, Position, PositionSide, ProtectiveKind, ProtectiveOrder, Signal,
};

/// Format a quantity for the wire. Whole units round to an integer; smaller
/// quantities keep the symbol's full quantity precision.
pub fn format_quantity(qty: f64, precision: u32) -> String {
    if qty >= 1.0 {
        format!("{}", qty.round() as i64)
    } else {
        format!("{:.*}", precision as usize, qty)
    }
}

/// Format a trigger price to the symbol's price precision
pub fn format_price(price: f64, precision: u32) -> String {
    format!("{:.*}", precision as usize, price)
}

/// Risk-based position sizing.
///
/// The quantity is the risk budget divided by the stop distance, rounded to
/// a whole unit when at least one, otherwise to the symbol's quantity
/// precision.
pub fn compute_quantity(
    balance: f64,
    risk_percent: f64,
    mark: f64,
    stop: f64,
    filters: &SymbolFilters,
) -> Result<f64> {
    let stop_distance = (mark - stop).abs();
    if stop_distance <= 0.0 {
        bail!("stop distance is zero (mark {} stop {})", mark, stop);
    }

    // risk_percent of 0.4 means 0.4% of the balance
    let risk_amount = balance * risk_percent / 100.0;
    let raw = risk_amount / stop_distance;

    let qty = if raw >= 1.0 {
        raw.round()
    } else {
        let scale = 10f64.powi(filters.quantity_precision as i32);
        (raw * scale).round() / scale
    };

    if qty <= 0.0 {
        bail!("quantity rounded to zero (raw {})", raw);
    }
    Ok(qty)
}

/// Check the order would clear the minimum notional at every price it could
/// execute or trigger at.
fn check_notional(qty: f64, prices: &[f64], filters: &SymbolFilters) -> Result<()> {
    for &p in prices {
        if qty * p < filters.min_notional {
            bail!(
                "notional {:.4} at price {} below minimum {}",
                qty * p,
                p,
                filters.min_notional
            );
        }
    }
    Ok(())
}

/// Stop and target must sit on the correct sides of the mark
fn validate_levels(side: PositionSide, mark: f64, stop: f64, target: f64) -> Result<()> {
    let ok = match side {
        PositionSide::Long => stop < mark && target > mark,
        PositionSide::Short => stop > mark && target < mark,
    };
    if !ok {
        bail!(
            "invalid bracket levels for {}: stop {} mark {} target {}",
            side,
            stop,
            mark,
            target
        );
    }
    Ok(())
}

/// A placed bracket: the booked position plus its protective pair
#[derive(Debug, Clone)]
pub struct BracketEntry {
    pub position: Position,
    /// Root id shared by the protective pair (not the entry's root)
    pub root_id: String,
    pub stop: ProtectiveOrder,
    pub target: ProtectiveOrder,
}

/// Places risk-sized bracket entries through the exchange collaborator
pub struct EntryPlacer {
    client: Arc<dyn ExchangeClient>,
    prefix: String,
    leverage: u32,
    risk: RiskConfig,
}

impl EntryPlacer {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        prefix: String,
        leverage: u32,
        risk: RiskConfig,
    ) -> Self {
        Self {
            client,
            prefix,
            leverage,
            risk,
        }
    }

    /// Place a market entry and its protective pair for a confirmed signal.
    ///
    /// If either protective leg cannot be placed the entry is flattened at
    /// market and the other leg cancelled; a naked position is never left
    /// behind on a placement failure this side of a process crash.
    pub async fn place(&self, signal: &Signal, now_ms: i64) -> Result<BracketEntry> {
        let symbol = &signal.symbol;
        let filters = self
            .client
            .get_symbol_filters(symbol)
            .await
            .with_context(|| format!("symbol filters for {}", symbol))?;
        let mark = self
            .client
            .get_mark_price(symbol)
            .await
            .with_context(|| format!("mark price for {}", symbol))?;

        validate_levels(signal.side, mark, signal.stop_price, signal.target_price)?;

        let balance = self.client.get_balance().await.context("free balance")?;
        let qty = compute_quantity(
            balance,
            self.risk.risk_percent,
            mark,
            signal.stop_price,
            &filters,
        )?;
        check_notional(
            qty,
            &[mark, signal.stop_price, signal.target_price],
            &filters,
        )?;

        // Margin mode and leverage are idempotent setup calls; an exchange
        // that is already in the requested state rejects the request.
        if let Err(e) = self.client.set_margin_mode_isolated(symbol).await {
            debug!(symbol = %symbol, error = %e, "margin mode call refused, continuing");
        }
        if let Err(e) = self.client.set_leverage(symbol, self.leverage).await {
            debug!(symbol = %symbol, error = %e, "leverage call refused, continuing");
        }

        let entry_id = ClientOrderId::new(OrderTag::Entry, ClientOrderId::new_root_id());
        let qty_str = format_quantity(qty, filters.quantity_precision);
        let ack = self
            .client
            .submit_market_order(NewOrder {
                symbol: symbol.clone(),
                side: signal.side.entry_side(),
                position_side: signal.side,
                quantity: qty_str.clone(),
                client_order_id: entry_id.encode(&self.prefix),
            })
            .await
            .with_context(|| format!("market entry for {}", symbol))?;

        let (filled_qty, entry_price) = self
            .confirm_fill(symbol, &entry_id.encode(&self.prefix), qty, mark)
            .await;

        info!(
            symbol = %symbol,
            side = %signal.side,
            pattern = %signal.pattern,
            qty = %qty_str,
            entry_price,
            order_id = %ack.order_id,
            "entry filled, placing protective pair"
        );

        // Fresh root shared by the pair; this is what pairs the legs later
        let root_id = ClientOrderId::new_root_id();
        let stop = self
            .place_protective(
                signal,
                ProtectiveKind::Stop,
                signal.stop_price,
                filled_qty,
                &root_id,
                &filters,
            )
            .await;
        let stop = match stop {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "stop leg failed, flattening entry");
                self.flatten(signal, filled_qty, &filters).await;
                return Err(e.context("stop-loss leg"));
            }
        };

        let target = self
            .place_protective(
                signal,
                ProtectiveKind::Target,
                signal.target_price,
                filled_qty,
                &root_id,
                &filters,
            )
            .await;
        let target = match target {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "target leg failed, unwinding bracket");
                let stop_wire = stop.client_id.encode(&self.prefix);
                if let Err(e) = self
                    .client
                    .cancel_conditional_order(symbol, &stop_wire)
                    .await
                {
                    warn!(symbol = %symbol, error = %e, "stop leg cancel failed during unwind");
                }
                self.flatten(signal, filled_qty, &filters).await;
                return Err(e.context("take-profit leg"));
            }
        };

        let position = Position {
            symbol: symbol.clone(),
            side: signal.side.entry_side(),
            position_side: signal.side,
            quantity: filled_qty,
            entry_price,
            leverage: self.leverage,
            allocated_margin: filled_qty * entry_price / self.leverage as f64,
            entry_time: now_ms,
            pattern: Some(signal.pattern),
        };

        Ok(BracketEntry {
            position,
            root_id,
            stop,
            target,
        })
    }

    /// Poll the entry until filled. Falls back to the requested quantity and
    /// the pre-entry mark when polling never sees a terminal fill.
    async fn confirm_fill(
        &self,
        symbol: &str,
        wire_id: &str,
        requested_qty: f64,
        mark: f64,
    ) -> (f64, f64) {
        for attempt in 0..self.risk.fill_poll_attempts {
            match self.client.get_order_status(symbol, wire_id).await {
                Ok(st) if st.status == OrderStatus::Filled && st.executed_qty > 0.0 => {
                    return (st.executed_qty, st.avg_price);
                }
                Ok(st) => {
                    debug!(symbol, attempt, status = ?st.status, "entry not filled yet");
                }
                Err(e) if e.is_transient() => {
                    debug!(symbol, attempt, error = %e, "fill poll failed, retrying");
                }
                Err(e) => {
                    warn!(symbol, error = %e, "fill poll failed permanently");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.risk.fill_poll_backoff_ms)).await;
        }
        // Market orders fill in practice; assume the request went through
        warn!(symbol, "fill confirmation timed out, assuming requested quantity");
        (requested_qty, mark)
    }

    async fn place_protective(
        &self,
        signal: &Signal,
        kind: ProtectiveKind,
        trigger: f64,
        qty: f64,
        root_id: &str,
        filters: &SymbolFilters,
    ) -> Result<ProtectiveOrder> {
        let tag = match kind {
            ProtectiveKind::Stop => OrderTag::Stop,
            ProtectiveKind::Target => OrderTag::Target,
        };
        let client_id = ClientOrderId::new(tag, root_id.to_string());
        self.client
            .submit_conditional_order(NewConditionalOrder {
                symbol: signal.symbol.clone(),
                side: signal.side.exit_side(),
                position_side: signal.side,
                kind,
                trigger_price: format_price(trigger, filters.price_precision),
                quantity: format_quantity(qty, filters.quantity_precision),
                client_order_id: client_id.encode(&self.prefix),
            })
            .await
            .with_context(|| format!("{:?} at {}", kind, trigger))?;

        Ok(ProtectiveOrder {
            symbol: signal.symbol.clone(),
            side: signal.side.exit_side(),
            kind,
            trigger_price: trigger,
            quantity: qty,
            position_side: signal.side,
            client_id,
        })
    }

    /// Close the freshly opened position at market after a leg failure
    async fn flatten(&self, signal: &Signal, qty: f64, filters: &SymbolFilters) {
        let close_id = ClientOrderId::new(OrderTag::Cleanup, ClientOrderId::new_root_id());
        let res = self
            .client
            .submit_market_order(NewOrder {
                symbol: signal.symbol.clone(),
                side: signal.side.exit_side(),
                position_side: signal.side,
                quantity: format_quantity(qty, filters.quantity_precision),
                client_order_id: close_id.encode(&self.prefix),
            })
            .await;
        if let Err(e) = res {
            warn!(symbol = %signal.symbol, error = %e, "flatten after leg failure failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchangeClient, OrderAck, OrderStatusDto};
    use crate::types::{Interval, PatternKind};

    fn filters() -> SymbolFilters {
        SymbolFilters {
            price_precision: 2,
            quantity_precision: 3,
            min_notional: 5.0,
        }
    }

    fn risk_cfg() -> RiskConfig {
        RiskConfig {
            risk_percent: 0.4,
            fill_poll_attempts: 2,
            fill_poll_backoff_ms: 1,
        }
    }

    fn long_signal() -> Signal {
        Signal {
            symbol: "ABCUSDT".into(),
            side: PositionSide::Long,
            pattern: PatternKind::Hammer,
            stop_price: 95.0,
            target_price: 110.0,
            source_interval: Interval::Min5,
            confirming_interval: Some(Interval::Min15),
        }
    }

    #[test]
    fn test_quantity_formatting() {
        assert_eq!(format_quantity(0.8, 3), "0.800");
        assert_eq!(format_quantity(0.1234, 3), "0.123");
        assert_eq!(format_quantity(80.0, 3), "80");
        assert_eq!(format_quantity(12.6, 3), "13");
    }

    #[test]
    fn test_sizing_scenario() {
        // Balance 1000, risk 0.4%, mark 100, stop 95: risk 4.0, qty 0.8
        let qty = compute_quantity(1000.0, 0.4, 100.0, 95.0, &filters()).unwrap();
        assert!((qty - 0.8).abs() < 1e-12);
        assert_eq!(format_quantity(qty, 3), "0.800");
    }

    #[test]
    fn test_sizing_whole_units_round_to_integer() {
        let qty = compute_quantity(100_000.0, 0.4, 100.0, 95.0, &filters()).unwrap();
        assert_eq!(qty, 80.0);
        assert_eq!(format_quantity(qty, 3), "80");
    }

    #[test]
    fn test_sizing_rejects_zero_stop_distance() {
        assert!(compute_quantity(1000.0, 0.4, 100.0, 100.0, &filters()).is_err());
    }

    #[test]
    fn test_level_validation() {
        assert!(validate_levels(PositionSide::Long, 100.0, 95.0, 110.0).is_ok());
        assert!(validate_levels(PositionSide::Long, 100.0, 101.0, 110.0).is_err());
        assert!(validate_levels(PositionSide::Short, 100.0, 105.0, 90.0).is_ok());
        assert!(validate_levels(PositionSide::Short, 100.0, 95.0, 90.0).is_err());
    }

    #[test]
    fn test_notional_floor() {
        let f = filters();
        assert!(check_notional(0.8, &[100.0, 95.0, 110.0], &f).is_ok());
        assert!(check_notional(0.04, &[100.0, 95.0, 110.0], &f).is_err());
    }

    fn happy_path_mock() -> MockExchangeClient {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_symbol_filters()
            .returning(|_| Ok(filters()));
        mock.expect_get_mark_price().returning(|_| Ok(100.0));
        mock.expect_get_balance().returning(|| Ok(1000.0));
        mock.expect_set_margin_mode_isolated().returning(|_| Ok(()));
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_get_order_status().returning(|_, _| {
            Ok(OrderStatusDto {
                status: OrderStatus::Filled,
                executed_qty: 0.8,
                avg_price: 100.02,
            })
        });
        mock
    }

    #[tokio::test]
    async fn test_place_bracket_wire_format() {
        let mut mock = happy_path_mock();
        mock.expect_submit_market_order()
            .withf(|o: &NewOrder| {
                o.quantity == "0.800" && o.client_order_id.starts_with("bb_en-")
            })
            .times(1)
            .returning(|o| {
                Ok(OrderAck {
                    order_id: "1".into(),
                    client_order_id: o.client_order_id,
                    status: OrderStatus::Filled,
                })
            });
        mock.expect_submit_conditional_order()
            .withf(|o: &NewConditionalOrder| {
                let price_ok = match o.kind {
                    ProtectiveKind::Stop => o.trigger_price == "95.00",
                    ProtectiveKind::Target => o.trigger_price == "110.00",
                };
                price_ok && o.quantity == "0.800"
            })
            .times(2)
            .returning(|o| {
                Ok(OrderAck {
                    order_id: "2".into(),
                    client_order_id: o.client_order_id,
                    status: OrderStatus::New,
                })
            });

        let placer = EntryPlacer::new(Arc::new(mock), "bb".into(), 5, risk_cfg());
        let bracket = placer.place(&long_signal(), 1_700_000_000_000).await.unwrap();

        assert_eq!(bracket.position.quantity, 0.8);
        assert_eq!(bracket.position.entry_price, 100.02);
        // The protective pair shares one root
        assert_eq!(bracket.stop.client_id.root_id, bracket.root_id);
        assert_eq!(bracket.target.client_id.root_id, bracket.root_id);
        assert_eq!(bracket.stop.kind, ProtectiveKind::Stop);
        assert_eq!(bracket.target.kind, ProtectiveKind::Target);
    }

    #[tokio::test]
    async fn test_target_leg_failure_unwinds() {
        let mut mock = happy_path_mock();
        mock.expect_submit_market_order()
            .times(2) // entry + flatten
            .returning(|o| {
                Ok(OrderAck {
                    order_id: "1".into(),
                    client_order_id: o.client_order_id,
                    status: OrderStatus::Filled,
                })
            });
        // Stop leg succeeds, target leg is rejected
        mock.expect_submit_conditional_order()
            .withf(|o: &NewConditionalOrder| o.kind == ProtectiveKind::Stop)
            .returning(|o| {
                Ok(OrderAck {
                    order_id: "2".into(),
                    client_order_id: o.client_order_id,
                    status: OrderStatus::New,
                })
            });
        mock.expect_submit_conditional_order()
            .withf(|o: &NewConditionalOrder| o.kind == ProtectiveKind::Target)
            .returning(|_| Err(crate::exchange::ExchangeError::Rejected("margin".into())));
        mock.expect_cancel_conditional_order()
            .withf(|_, id: &str| id.starts_with("bb_sl-"))
            .times(1)
            .returning(|_, _| Ok(()));

        let placer = EntryPlacer::new(Arc::new(mock), "bb".into(), 5, risk_cfg());
        assert!(placer.place(&long_signal(), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_levels_before_any_order() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_symbol_filters()
            .returning(|_| Ok(filters()));
        mock.expect_get_mark_price().returning(|_| Ok(100.0));
        // No order submission expectations: placement must fail first
        let mut sig = long_signal();
        sig.stop_price = 105.0;

        let placer = EntryPlacer::new(Arc::new(mock), "bb".into(), 5, risk_cfg());
        assert!(placer.place(&sig, 0).await.is_err());
    }
}
