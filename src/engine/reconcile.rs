//! Reconciliation against exchange truth
//!
//! The account stream is at-least-once and the engine can restart mid
//! bracket, so every handler here is written to be idempotent: duplicate
//! events are dropped by id, scheduled flattens carry a dedup key, margin
//! top-ups are deduplicated per order with a timeout release, and startup
//! rebuilds the trailing book purely from what the exchange reports.
//!
//! Protective legs are paired by shared root id plus matching quantity.
//! Engine-owned conditional orders that fail to pair are ghosts and get
//! cancelled; foreign orders are never touched.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ReconcileConfig, TrailingConfig};
use crate::engine::entry::format_quantity;
use crate::engine::trailing::TrailingState;
use crate::engine::TradeSink;
use crate::exchange::{ExchangeClient, FillEvent, NewOrder, OpenOrderDto, PositionDto};
use crate::types::{ClientOrderId, ClosedTrade, ExitReason, OrderTag, PositionSide};

const QTY_EPSILON: f64 = 1e-9;

/// Bounded first-in-first-out set of already-processed ids
pub struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Insert an id; returns false if it was already present
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// How a fill's client order id classifies it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillClass {
    /// Our market entry; carries the entry's root id
    Entry(String),
    /// Our stop-loss leg; carries the pair's root id
    Stop(String),
    /// Our take-profit leg
    Target(String),
    /// Our own cleanup or close order
    Close,
    /// Not placed by this engine
    Foreign,
}

/// Decode a fill's client order id under the engine prefix
pub fn classify_fill(prefix: &str, fill: &FillEvent) -> FillClass {
    match ClientOrderId::parse(prefix, &fill.client_order_id) {
        Some(id) => match id.tag {
            OrderTag::Entry => FillClass::Entry(id.root_id),
            OrderTag::Stop => FillClass::Stop(id.root_id),
            OrderTag::Target => FillClass::Target(id.root_id),
            OrderTag::Cleanup | OrderTag::ClosePosition => FillClass::Close,
        },
        None => FillClass::Foreign,
    }
}

/// Matched stop/target pairs plus the leftover engine-owned ghosts
pub struct PairedLegs {
    pub pairs: Vec<(OpenOrderDto, OpenOrderDto)>,
    pub ghosts: Vec<OpenOrderDto>,
}

impl PairedLegs {
    /// Quantity covered by valid pairs
    pub fn protected_qty(&self) -> f64 {
        self.pairs.iter().map(|(s, _)| s.quantity).sum()
    }
}

/// Pair engine-owned conditional orders by root id and matching quantity.
///
/// A pair is one stop and one target sharing a root id with equal
/// quantities; orphans and quantity-mismatched siblings are ghosts. When a
/// pair matches the position quantity exactly it is the bracket and every
/// other pair is a leftover from an interrupted replace, so those demote to
/// ghosts too. With no position behind them (`position_qty` zero) all
/// engine-owned legs are ghosts. Foreign orders are ignored entirely.
pub fn pair_legs(prefix: &str, position_qty: f64, orders: &[OpenOrderDto]) -> PairedLegs {
    let mut engine_legs: Vec<(OrderTag, String, OpenOrderDto)> = Vec::new();
    for o in orders {
        if let Some(id) = ClientOrderId::parse(prefix, &o.client_order_id) {
            if matches!(id.tag, OrderTag::Stop | OrderTag::Target) {
                engine_legs.push((id.tag, id.root_id, o.clone()));
            }
        }
    }

    if position_qty <= QTY_EPSILON {
        return PairedLegs {
            pairs: Vec::new(),
            ghosts: engine_legs.into_iter().map(|(_, _, o)| o).collect(),
        };
    }

    let mut by_root: HashMap<String, Vec<(OrderTag, OpenOrderDto)>> = HashMap::new();
    for (tag, root, o) in engine_legs {
        by_root.entry(root).or_default().push((tag, o));
    }

    let mut pairs: Vec<(OpenOrderDto, OpenOrderDto)> = Vec::new();
    let mut ghosts = Vec::new();
    for (_, legs) in by_root {
        let is_pair = legs.len() == 2
            && legs.iter().any(|(t, _)| *t == OrderTag::Stop)
            && legs.iter().any(|(t, _)| *t == OrderTag::Target);
        if !is_pair {
            ghosts.extend(legs.into_iter().map(|(_, o)| o));
            continue;
        }
        let mut stop = None;
        let mut target = None;
        for (tag, o) in legs {
            match tag {
                OrderTag::Stop => stop = Some(o),
                _ => target = Some(o),
            }
        }
        let (stop, target) = match (stop, target) {
            (Some(s), Some(t)) => (s, t),
            _ => continue,
        };
        if (stop.quantity - target.quantity).abs() < QTY_EPSILON {
            pairs.push((stop, target));
        } else {
            ghosts.push(stop);
            ghosts.push(target);
        }
    }

    // An exact quantity match is the live bracket; other pairs are stale
    if let Some(idx) = pairs
        .iter()
        .position(|(s, _)| (s.quantity - position_qty).abs() < QTY_EPSILON)
    {
        let keep = pairs.swap_remove(idx);
        ghosts.extend(pairs.drain(..).flat_map(|(s, t)| [s, t]));
        pairs.push(keep);
    }

    PairedLegs { pairs, ghosts }
}

/// Per-order margin top-up dedup with timeout release
pub struct MarginDedup {
    seen: HashMap<String, i64>,
    timeout_ms: i64,
}

impl MarginDedup {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            timeout_ms: timeout_ms as i64,
        }
    }

    /// True if a top-up for this order may proceed now. Entries expire so a
    /// later legitimate top-up on the same order is not starved forever.
    pub fn try_claim(&mut self, order_id: &str, now_ms: i64) -> bool {
        self.seen.retain(|_, ts| now_ms - *ts < self.timeout_ms);
        if self.seen.contains_key(order_id) {
            return false;
        }
        self.seen.insert(order_id.to_string(), now_ms);
        true
    }
}

/// Reconciliation logic over the exchange boundary.
///
/// Holds no trailing or admission state; the engine owns that and feeds the
/// relevant slices in.
pub struct Reconciler {
    client: Arc<dyn ExchangeClient>,
    prefix: String,
    cfg: ReconcileConfig,
    sink: Arc<dyn TradeSink>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        prefix: String,
        cfg: ReconcileConfig,
        sink: Arc<dyn TradeSink>,
    ) -> Self {
        Self {
            client,
            prefix,
            cfg,
            sink,
        }
    }

    pub fn flatten_delay_ms(&self) -> u64 {
        self.cfg.flatten_delay_ms
    }

    pub fn event_cache_size(&self) -> usize {
        self.cfg.event_cache_size
    }

    /// Margin to add back after a losing fill, or `None` when the loss is
    /// below the threshold. Losses are scaled by the filled fraction so a
    /// partial fill tops up only its share.
    pub fn margin_topup_amount(&self, fill: &FillEvent) -> Option<f64> {
        if fill.realized_pnl >= 0.0 || fill.order_qty <= 0.0 {
            return None;
        }
        let fraction = (fill.filled_qty / fill.order_qty).clamp(0.0, 1.0);
        let amount = (fill.realized_pnl.abs() + fill.commission) * fraction;
        if amount < self.cfg.margin_topup_min {
            return None;
        }
        Some(amount)
    }

    pub async fn add_margin(
        &self,
        symbol: &str,
        position_side: PositionSide,
        amount: f64,
    ) -> Result<()> {
        self.client
            .add_isolated_margin(symbol, position_side, amount)
            .await
            .with_context(|| format!("margin top-up of {:.4} on {}", amount, symbol))?;
        info!(symbol, side = %position_side, amount, "isolated margin topped up");
        Ok(())
    }

    /// Flatten any position quantity not covered by a valid protective pair
    /// and cancel engine-owned ghosts. Safe to run repeatedly: once the
    /// excess is closed and ghosts are gone this becomes a no-op.
    pub async fn flatten_unprotected(&self, symbol: &str) -> Result<()> {
        let positions = self
            .client
            .get_open_positions()
            .await
            .context("open positions")?;
        let orders = self
            .client
            .get_open_conditional_orders(symbol)
            .await
            .with_context(|| format!("conditional orders for {}", symbol))?;

        let symbol_positions: Vec<&PositionDto> =
            positions.iter().filter(|p| p.symbol == symbol).collect();
        let mut ghosts: Vec<OpenOrderDto> = Vec::new();
        let mut acted = false;
        for pos in &symbol_positions {
            let side_orders: Vec<OpenOrderDto> = orders
                .iter()
                .filter(|o| o.position_side == pos.position_side)
                .cloned()
                .collect();
            let paired = pair_legs(&self.prefix, pos.quantity, &side_orders);
            let excess = pos.quantity - paired.protected_qty();
            if excess > QTY_EPSILON {
                acted = true;
                self.close_at_market(pos, excess).await?;
            }
            ghosts.extend(paired.ghosts);
        }
        // Legs on a side with no position behind them cannot pair (quantity
        // zero matches nothing) and are all ghosts
        let live_sides: HashSet<PositionSide> =
            symbol_positions.iter().map(|p| p.position_side).collect();
        let orphaned: Vec<OpenOrderDto> = orders
            .iter()
            .filter(|o| !live_sides.contains(&o.position_side))
            .cloned()
            .collect();
        ghosts.extend(pair_legs(&self.prefix, 0.0, &orphaned).ghosts);

        for ghost in &ghosts {
            acted = true;
            self.cancel_ghost(ghost).await;
        }
        if acted {
            info!(symbol, "flatten pass acted on unprotected exposure");
        } else {
            debug!(symbol, "flatten pass found nothing to do");
        }
        Ok(())
    }

    async fn cancel_ghost(&self, ghost: &OpenOrderDto) {
        match self
            .client
            .cancel_conditional_order(&ghost.symbol, &ghost.client_order_id)
            .await
        {
            Ok(()) => {
                info!(
                    symbol = %ghost.symbol,
                    order = %ghost.client_order_id,
                    "ghost order cancelled"
                );
            }
            Err(e) => {
                // Already gone is success for a cleanup
                warn!(
                    symbol = %ghost.symbol,
                    order = %ghost.client_order_id,
                    error = %e,
                    "ghost cancel failed"
                );
            }
        }
    }

    async fn close_at_market(&self, pos: &PositionDto, qty: f64) -> Result<()> {
        let filters = self
            .client
            .get_symbol_filters(&pos.symbol)
            .await
            .with_context(|| format!("symbol filters for {}", pos.symbol))?;
        let close_id = ClientOrderId::new(OrderTag::ClosePosition, ClientOrderId::new_root_id());
        self.client
            .submit_market_order(NewOrder {
                symbol: pos.symbol.clone(),
                side: pos.position_side.exit_side(),
                position_side: pos.position_side,
                quantity: format_quantity(qty, filters.quantity_precision),
                client_order_id: close_id.encode(&self.prefix),
            })
            .await
            .with_context(|| format!("market close of {:.6} {}", qty, pos.symbol))?;
        info!(symbol = %pos.symbol, side = %pos.position_side, qty, "unprotected quantity closed");

        let exit_price = match self.client.get_mark_price(&pos.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %pos.symbol, error = %e, "mark price unavailable for close record");
                pos.entry_price
            }
        };
        let trade = ClosedTrade {
            symbol: pos.symbol.clone(),
            side: pos.position_side.entry_side(),
            position_side: pos.position_side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: qty,
            stop_price: 0.0,
            target_price: 0.0,
            pnl: (exit_price - pos.entry_price) * qty * pos.position_side.sign(),
            pattern: None,
            // Entry time is unknown for exposure the engine did not open
            entry_time: 0,
            exit_time: chrono::Utc::now().timestamp_millis(),
            reason: ExitReason::Flattened,
        };
        if let Err(e) = self.sink.record(trade).await {
            warn!(symbol = %pos.symbol, error = %e, "closed-trade record failed");
        }
        Ok(())
    }

    /// Rebuild trailing state from exchange truth at startup.
    ///
    /// Each open position with exactly one valid protective pair gets a
    /// trailing entry seeded from the live trigger prices; candidates start
    /// from the current mark. Ghost orders found along the way are
    /// cancelled.
    pub async fn rebuild(
        &self,
        scalping: bool,
        trailing_cfg: &TrailingConfig,
    ) -> Result<Vec<TrailingState>> {
        let positions = self
            .client
            .get_open_positions()
            .await
            .context("open positions at startup")?;

        let mut rebuilt = Vec::new();
        let mut seen_symbols: HashSet<String> = HashSet::new();
        for pos in &positions {
            if !seen_symbols.insert(pos.symbol.clone()) {
                continue;
            }
            let orders = self
                .client
                .get_open_conditional_orders(&pos.symbol)
                .await
                .with_context(|| format!("conditional orders for {}", pos.symbol))?;

            // Positions on both sides of one symbol share the order list
            for p in positions.iter().filter(|p| p.symbol == pos.symbol) {
                let side_orders: Vec<OpenOrderDto> = orders
                    .iter()
                    .filter(|o| o.position_side == p.position_side)
                    .cloned()
                    .collect();
                let paired = pair_legs(&self.prefix, p.quantity, &side_orders);

                for ghost in &paired.ghosts {
                    self.cancel_ghost(ghost).await;
                }

                let pair = paired
                    .pairs
                    .into_iter()
                    .find(|(s, _)| (s.quantity - p.quantity).abs() < QTY_EPSILON);
                let Some((stop, target)) = pair else {
                    warn!(
                        symbol = %p.symbol,
                        side = %p.position_side,
                        "open position has no protective pair matching its quantity"
                    );
                    continue;
                };
                let (Some(sl_client), Some(tp_client)) = (
                    ClientOrderId::parse(&self.prefix, &stop.client_order_id),
                    ClientOrderId::parse(&self.prefix, &target.client_order_id),
                ) else {
                    continue;
                };

                let mark = self
                    .client
                    .get_mark_price(&p.symbol)
                    .await
                    .with_context(|| format!("mark price for {}", p.symbol))?;

                let st = TrailingState::new(
                    p.symbol.clone(),
                    p.position_side,
                    p.quantity,
                    scalping,
                    stop.trigger_price,
                    target.trigger_price,
                    sl_client,
                    tp_client,
                    mark,
                    trailing_cfg,
                );
                info!(
                    symbol = %p.symbol,
                    side = %p.position_side,
                    sl = st.current_sl,
                    tp = st.current_tp,
                    qty = p.quantity,
                    "trailing state rebuilt from exchange"
                );
                rebuilt.push(st);
            }
        }
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::{LogTradeSink, MockTradeSink};
    use crate::exchange::{
        MockExchangeClient, OpenOrderKind, OrderAck, OrderStatus, SymbolFilters,
    };
    use crate::types::Side;

    fn reconcile_cfg() -> ReconcileConfig {
        AppConfig::load().unwrap().reconcile
    }

    fn reconciler(client: MockExchangeClient) -> Reconciler {
        Reconciler::new(
            Arc::new(client),
            "bb".into(),
            reconcile_cfg(),
            Arc::new(LogTradeSink),
        )
    }

    fn leg(symbol: &str, tag: OrderTag, root: &str, trigger: f64, qty: f64) -> OpenOrderDto {
        let kind = match tag {
            OrderTag::Stop => OpenOrderKind::StopMarket,
            _ => OpenOrderKind::TakeProfitMarket,
        };
        OpenOrderDto {
            symbol: symbol.into(),
            order_id: format!("{}-{}", root, tag.code()),
            client_order_id: ClientOrderId::new(tag, root).encode("bb"),
            side: Side::Sell,
            position_side: PositionSide::Long,
            kind,
            trigger_price: trigger,
            quantity: qty,
        }
    }

    fn position(symbol: &str, qty: f64) -> PositionDto {
        PositionDto {
            symbol: symbol.into(),
            position_side: PositionSide::Long,
            quantity: qty,
            entry_price: 100.0,
            leverage: 5,
            isolated_margin: 40.0,
        }
    }

    #[test]
    fn test_dedup_cache_bounded() {
        let mut cache = DedupCache::new(2);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c")); // evicts "a"
        assert_eq!(cache.len(), 2);
        assert!(cache.insert("a"));
    }

    #[test]
    fn test_classify_fill() {
        let mut fill = FillEvent {
            symbol: "BTCUSDT".into(),
            order_id: "1".into(),
            client_order_id: "bb_sl-abc123".into(),
            side: Side::Sell,
            position_side: PositionSide::Long,
            price: 95.0,
            order_qty: 1.0,
            filled_qty: 1.0,
            realized_pnl: -5.0,
            commission: 0.02,
            is_conditional: true,
        };
        assert_eq!(classify_fill("bb", &fill), FillClass::Stop("abc123".into()));

        fill.client_order_id = "web_775533".into();
        assert_eq!(classify_fill("bb", &fill), FillClass::Foreign);
    }

    #[test]
    fn test_pair_legs_matches_root_and_quantity() {
        let orders = vec![
            leg("XYZUSDT", OrderTag::Stop, "rootA", 95.0, 2.0),
            leg("XYZUSDT", OrderTag::Target, "rootA", 110.0, 2.0),
            // Orphan stop, no sibling
            leg("XYZUSDT", OrderTag::Stop, "rootB", 94.0, 2.0),
            // Pair with wrong quantity
            leg("XYZUSDT", OrderTag::Stop, "rootC", 93.0, 1.0),
            leg("XYZUSDT", OrderTag::Target, "rootC", 111.0, 1.0),
        ];
        let paired = pair_legs("bb", 2.0, &orders);
        assert_eq!(paired.pairs.len(), 1);
        assert_eq!(paired.pairs[0].0.trigger_price, 95.0);
        assert_eq!(paired.pairs[0].1.trigger_price, 110.0);
        assert_eq!(paired.ghosts.len(), 3);
        assert!((paired.protected_qty() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pair_legs_ignores_foreign_orders() {
        let mut foreign = leg("XYZUSDT", OrderTag::Stop, "rootZ", 90.0, 2.0);
        foreign.client_order_id = "web_12345".into();
        let paired = pair_legs("bb", 2.0, &[foreign]);
        assert!(paired.pairs.is_empty());
        assert!(paired.ghosts.is_empty());
    }

    #[test]
    fn test_margin_topup_threshold_and_scaling() {
        let r = reconciler(MockExchangeClient::new());
        let mut fill = FillEvent {
            symbol: "BTCUSDT".into(),
            order_id: "1".into(),
            client_order_id: "bb_sl-abc".into(),
            side: Side::Sell,
            position_side: PositionSide::Long,
            price: 95.0,
            order_qty: 2.0,
            filled_qty: 1.0,
            realized_pnl: -8.0,
            commission: 0.04,
            is_conditional: true,
        };
        // Half filled: half the loss plus commission
        let amount = r.margin_topup_amount(&fill).unwrap();
        assert!((amount - 4.02).abs() < 1e-9);

        fill.realized_pnl = 3.0;
        assert!(r.margin_topup_amount(&fill).is_none());

        fill.realized_pnl = -0.4;
        fill.filled_qty = 2.0;
        assert!(r.margin_topup_amount(&fill).is_none());
    }

    #[test]
    fn test_margin_dedup_timeout_release() {
        let mut dedup = MarginDedup::new(30_000);
        assert!(dedup.try_claim("order1", 0));
        assert!(!dedup.try_claim("order1", 10_000));
        assert!(dedup.try_claim("order1", 40_000));
    }

    #[tokio::test]
    async fn test_flatten_closes_excess_and_cancels_ghosts() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_open_positions()
            .returning(|| Ok(vec![position("XYZUSDT", 3.0)]));
        mock.expect_get_open_conditional_orders().returning(|_| {
            Ok(vec![
                leg("XYZUSDT", OrderTag::Stop, "rootA", 95.0, 2.0),
                leg("XYZUSDT", OrderTag::Target, "rootA", 110.0, 2.0),
                leg("XYZUSDT", OrderTag::Stop, "rootB", 94.0, 2.0),
            ])
        });
        mock.expect_get_symbol_filters().returning(|_| {
            Ok(SymbolFilters {
                price_precision: 2,
                quantity_precision: 3,
                min_notional: 5.0,
            })
        });
        // Pair covers 2.0 of 3.0: one unit closed at market with the cp tag
        mock.expect_submit_market_order()
            .withf(|o: &NewOrder| {
                o.client_order_id.starts_with("bb_cp-") && o.quantity == "1" && o.side == Side::Sell
            })
            .times(1)
            .returning(|o| {
                Ok(OrderAck {
                    order_id: "9".into(),
                    client_order_id: o.client_order_id,
                    status: OrderStatus::Filled,
                })
            });
        // Only the orphan stop gets cancelled
        mock.expect_cancel_conditional_order()
            .withf(|_, id: &str| id == ClientOrderId::new(OrderTag::Stop, "rootB").encode("bb"))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_mark_price().returning(|_| Ok(99.0));

        let r = reconciler(mock);
        r.flatten_unprotected("XYZUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn test_flatten_records_closed_trade() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_open_positions()
            .returning(|| Ok(vec![position("XYZUSDT", 3.0)]));
        mock.expect_get_open_conditional_orders().returning(|_| {
            Ok(vec![
                leg("XYZUSDT", OrderTag::Stop, "rootA", 95.0, 2.0),
                leg("XYZUSDT", OrderTag::Target, "rootA", 110.0, 2.0),
            ])
        });
        mock.expect_get_symbol_filters().returning(|_| {
            Ok(SymbolFilters {
                price_precision: 2,
                quantity_precision: 3,
                min_notional: 5.0,
            })
        });
        mock.expect_submit_market_order().returning(|o| {
            Ok(OrderAck {
                order_id: "9".into(),
                client_order_id: o.client_order_id,
                status: OrderStatus::Filled,
            })
        });
        mock.expect_get_mark_price().returning(|_| Ok(98.0));

        let mut sink = MockTradeSink::new();
        sink.expect_record()
            .withf(|t: &ClosedTrade| {
                t.reason == ExitReason::Flattened
                    && (t.quantity - 1.0).abs() < 1e-9
                    && t.exit_price == 98.0
                    && (t.pnl - (-2.0)).abs() < 1e-9
            })
            .times(1)
            .returning(|_| Ok(()));

        let r = Reconciler::new(
            Arc::new(mock),
            "bb".into(),
            reconcile_cfg(),
            Arc::new(sink),
        );
        r.flatten_unprotected("XYZUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn test_flatten_idempotent_when_protected() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_open_positions()
            .returning(|| Ok(vec![position("XYZUSDT", 2.0)]));
        mock.expect_get_open_conditional_orders().returning(|_| {
            Ok(vec![
                leg("XYZUSDT", OrderTag::Stop, "rootA", 95.0, 2.0),
                leg("XYZUSDT", OrderTag::Target, "rootA", 110.0, 2.0),
            ])
        });
        // No market orders, no cancels expected

        let r = reconciler(mock);
        r.flatten_unprotected("XYZUSDT").await.unwrap();
        r.flatten_unprotected("XYZUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_from_live_pair() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_open_positions()
            .returning(|| Ok(vec![position("XYZUSDT", 2.0)]));
        mock.expect_get_open_conditional_orders().returning(|_| {
            Ok(vec![
                leg("XYZUSDT", OrderTag::Stop, "rootA", 95.0, 2.0),
                leg("XYZUSDT", OrderTag::Target, "rootA", 110.0, 2.0),
            ])
        });
        mock.expect_get_mark_price().returning(|_| Ok(100.0));

        let cfg = AppConfig::load().unwrap();
        let r = reconciler(mock);
        let rebuilt = r.rebuild(true, &cfg.trailing).await.unwrap();

        assert_eq!(rebuilt.len(), 1);
        let st = &rebuilt[0];
        assert_eq!(st.symbol, "XYZUSDT");
        assert_eq!(st.position_side, PositionSide::Long);
        assert_eq!(st.current_sl, 95.0);
        assert_eq!(st.current_tp, 110.0);
        assert_eq!(st.quantity, 2.0);
        assert!(st.next_trigger > 100.0);
    }

    #[tokio::test]
    async fn test_rebuild_skips_unpaired_position() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_open_positions()
            .returning(|| Ok(vec![position("XYZUSDT", 2.0)]));
        mock.expect_get_open_conditional_orders().returning(|_| {
            Ok(vec![leg("XYZUSDT", OrderTag::Stop, "rootB", 94.0, 2.0)])
        });
        // The orphan leg is swept
        mock.expect_cancel_conditional_order()
            .times(1)
            .returning(|_, _| Ok(()));

        let cfg = AppConfig::load().unwrap();
        let r = reconciler(mock);
        let rebuilt = r.rebuild(true, &cfg.trailing).await.unwrap();
        assert!(rebuilt.is_empty());
    }
}
