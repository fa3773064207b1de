//! Trailing bracket state machine
//!
//! Each live bracket carries precomputed trail candidates: the price that
//! triggers the next step and the stop/target levels that step would move to.
//! A big-move trigger ratchets by larger multipliers and takes precedence
//! over the normal step.
//!
//! The protective levels only ever tighten. A candidate that does not
//! strictly improve both legs (possible when normal candidates go stale
//! after a big-move ratchet) advances the thresholds without touching the
//! live orders. Replacement places the new pair before cancelling the old
//! one, so the position is covered by at least one stop at all times.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TrailingConfig;
use crate::engine::entry::{format_price, format_quantity};
use crate::exchange::{ExchangeClient, NewConditionalOrder, SymbolFilters};
use crate::types::{ClientOrderId, OrderTag, PositionSide, ProtectiveKind};

/// Live trailing state for one bracket, keyed by (symbol, position side)
#[derive(Debug, Clone)]
pub struct TrailingState {
    pub symbol: String,
    pub position_side: PositionSide,
    pub quantity: f64,
    pub scalping: bool,
    pub current_sl: f64,
    pub current_tp: f64,
    pub sl_client: ClientOrderId,
    pub tp_client: ClientOrderId,
    pub trail_count: u32,
    pub next_trigger: f64,
    pub next_sl: f64,
    pub next_tp: f64,
    pub big_trigger: f64,
    pub big_sl: f64,
    pub big_tp: f64,
}

/// Which candidate a price movement activated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailStep {
    Normal,
    Big,
}

/// What a trail attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailOutcome {
    /// Price has not reached either trigger
    NotTriggered,
    /// Neither protective leg is live any more; the bracket is finished
    BracketGone,
    /// Both legs replaced at tighter levels
    Advanced(TrailStep),
    /// Triggers moved forward but the live orders were left alone
    ThresholdsOnly,
}

impl TrailingState {
    /// Build state for a fresh bracket, seeding candidates from the entry's
    /// levels and the given base price.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        position_side: PositionSide,
        quantity: f64,
        scalping: bool,
        current_sl: f64,
        current_tp: f64,
        sl_client: ClientOrderId,
        tp_client: ClientOrderId,
        base_price: f64,
        cfg: &TrailingConfig,
    ) -> Self {
        let mut st = Self {
            symbol,
            position_side,
            quantity,
            scalping,
            current_sl,
            current_tp,
            sl_client,
            tp_client,
            trail_count: 0,
            next_trigger: 0.0,
            next_sl: 0.0,
            next_tp: 0.0,
            big_trigger: 0.0,
            big_sl: 0.0,
            big_tp: 0.0,
        };
        st.advance_thresholds(base_price, cfg);
        st
    }

    /// Recompute the trail candidates from the current levels and the given
    /// base price. Called on commit and on every non-committing trigger.
    pub fn advance_thresholds(&mut self, base_price: f64, cfg: &TrailingConfig) {
        let sign = self.position_side.sign();
        let normal = cfg.normal(self.scalping);
        let big = cfg.big(self.scalping);

        self.next_trigger = base_price * (1.0 + sign * normal.trigger_pct);
        self.next_sl = self.current_sl * (1.0 + sign * normal.stop_pct);
        self.next_tp = self.current_tp * (1.0 + sign * normal.target_pct);

        self.big_trigger = base_price * (1.0 + sign * big.trigger_pct);
        self.big_sl = self.current_sl * (1.0 + sign * big.stop_pct);
        self.big_tp = self.current_tp * (1.0 + sign * big.target_pct);
    }

    /// Check whether a price activates a candidate. Big takes precedence.
    pub fn triggered(&self, price: f64) -> Option<TrailStep> {
        match self.position_side {
            PositionSide::Long => {
                if price >= self.big_trigger {
                    Some(TrailStep::Big)
                } else if price >= self.next_trigger {
                    Some(TrailStep::Normal)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if price <= self.big_trigger {
                    Some(TrailStep::Big)
                } else if price <= self.next_trigger {
                    Some(TrailStep::Normal)
                } else {
                    None
                }
            }
        }
    }

    /// Strict improvement on both legs in the trade direction
    pub fn improves(&self, new_sl: f64, new_tp: f64) -> bool {
        match self.position_side {
            PositionSide::Long => new_sl > self.current_sl && new_tp > self.current_tp,
            PositionSide::Short => new_sl < self.current_sl && new_tp < self.current_tp,
        }
    }

    fn candidate(&self, step: TrailStep) -> (f64, f64) {
        match step {
            TrailStep::Normal => (self.next_sl, self.next_tp),
            TrailStep::Big => (self.big_sl, self.big_tp),
        }
    }
}

/// Executes trail steps against the exchange.
///
/// Attempts for one bracket are serialized by the engine's state lock, so a
/// second price tick cannot start a replace while one is in progress.
pub struct TrailEngine {
    client: Arc<dyn ExchangeClient>,
    prefix: String,
    cfg: TrailingConfig,
}

impl TrailEngine {
    pub fn new(client: Arc<dyn ExchangeClient>, prefix: String, cfg: TrailingConfig) -> Self {
        Self {
            client,
            prefix,
            cfg,
        }
    }

    pub fn config(&self) -> &TrailingConfig {
        &self.cfg
    }

    /// Run one trail attempt for a price tick.
    ///
    /// On a partial placement failure the old pair stays live and only the
    /// thresholds advance; the failed new leg is cancelled best-effort.
    pub async fn attempt(
        &self,
        st: &mut TrailingState,
        price: f64,
        filters: &SymbolFilters,
    ) -> Result<TrailOutcome> {
        let Some(step) = st.triggered(price) else {
            return Ok(TrailOutcome::NotTriggered);
        };

        // Confirm both legs are still live before replacing anything
        let open = self
            .client
            .get_open_conditional_orders(&st.symbol)
            .await
            .with_context(|| format!("open conditional orders for {}", st.symbol))?;
        let sl_wire = st.sl_client.encode(&self.prefix);
        let tp_wire = st.tp_client.encode(&self.prefix);
        let sl_live = open.iter().any(|o| o.client_order_id == sl_wire);
        let tp_live = open.iter().any(|o| o.client_order_id == tp_wire);
        if !sl_live || !tp_live {
            info!(
                symbol = %st.symbol,
                side = %st.position_side,
                sl_live,
                tp_live,
                "protective leg gone, bracket finished"
            );
            return Ok(TrailOutcome::BracketGone);
        }

        let (new_sl, new_tp) = st.candidate(step);
        if !st.improves(new_sl, new_tp) {
            debug!(
                symbol = %st.symbol,
                current_sl = st.current_sl,
                new_sl,
                "candidate does not tighten, advancing thresholds only"
            );
            st.advance_thresholds(price, &self.cfg);
            return Ok(TrailOutcome::ThresholdsOnly);
        }

        // Place the replacement pair first; old legs keep covering the
        // position until the new ones are acknowledged.
        let root_id = ClientOrderId::new_root_id();
        let new_sl_client = ClientOrderId::new(OrderTag::Stop, root_id.clone());
        let new_tp_client = ClientOrderId::new(OrderTag::Target, root_id);

        if let Err(e) = self
            .place_leg(st, ProtectiveKind::Stop, new_sl, &new_sl_client, filters)
            .await
        {
            warn!(symbol = %st.symbol, error = %e, "trail stop placement failed, keeping old pair");
            st.advance_thresholds(price, &self.cfg);
            return Ok(TrailOutcome::ThresholdsOnly);
        }
        if let Err(e) = self
            .place_leg(st, ProtectiveKind::Target, new_tp, &new_tp_client, filters)
            .await
        {
            warn!(symbol = %st.symbol, error = %e, "trail target placement failed, unwinding new stop");
            let wire = new_sl_client.encode(&self.prefix);
            if let Err(e) = self.client.cancel_conditional_order(&st.symbol, &wire).await {
                warn!(symbol = %st.symbol, error = %e, "unwind cancel of new stop failed");
            }
            st.advance_thresholds(price, &self.cfg);
            return Ok(TrailOutcome::ThresholdsOnly);
        }

        // New pair is live; old legs are now ghosts and their cancellation
        // is best-effort (reconciliation sweeps any leftovers)
        for wire in [&sl_wire, &tp_wire] {
            if let Err(e) = self.client.cancel_conditional_order(&st.symbol, wire).await {
                warn!(symbol = %st.symbol, order = %wire, error = %e, "old leg cancel failed");
            }
        }

        st.current_sl = new_sl;
        st.current_tp = new_tp;
        st.sl_client = new_sl_client;
        st.tp_client = new_tp_client;
        st.trail_count += 1;
        st.advance_thresholds(price, &self.cfg);

        info!(
            symbol = %st.symbol,
            side = %st.position_side,
            step = ?step,
            sl = st.current_sl,
            tp = st.current_tp,
            trail_count = st.trail_count,
            "bracket trailed"
        );
        Ok(TrailOutcome::Advanced(step))
    }

    async fn place_leg(
        &self,
        st: &TrailingState,
        kind: ProtectiveKind,
        trigger: f64,
        client_id: &ClientOrderId,
        filters: &SymbolFilters,
    ) -> Result<()> {
        self.client
            .submit_conditional_order(NewConditionalOrder {
                symbol: st.symbol.clone(),
                side: st.position_side.exit_side(),
                position_side: st.position_side,
                kind,
                trigger_price: format_price(trigger, filters.price_precision),
                quantity: format_quantity(st.quantity, filters.quantity_precision),
                client_order_id: client_id.encode(&self.prefix),
            })
            .await
            .with_context(|| format!("{:?} replacement at {}", kind, trigger))?;
        Ok(())
    }
}
