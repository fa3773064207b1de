//! Account engine - owns all mutable trading state for one account
//!
//! One engine instance holds the candle store, the trailing book, the
//! admission counters and the reconciliation caches behind a single async
//! lock. Stream handlers (`on_minute_candle`, `on_price`,
//! `on_account_event`) are the only entry points; each takes the lock,
//! applies exchange calls and commits state before returning, so handlers
//! for one account never interleave mid-bracket.

pub mod admission;
pub mod entry;
pub mod reconcile;
pub mod trailing;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::candles::CandleStore;
use crate::config::AppConfig;
use crate::exchange::{AccountEvent, AccountEventKind, ExchangeClient, FillEvent};
use crate::patterns::PatternEngine;
use crate::types::{
    Candle, ClientOrderId, ClosedTrade, ExitReason, Interval, OrderTag, Position, PositionSide,
    ProtectiveKind, Signal,
};

use admission::AdmissionControl;
use entry::EntryPlacer;
use reconcile::{classify_fill, DedupCache, FillClass, MarginDedup, Reconciler};
use trailing::{TrailEngine, TrailOutcome, TrailingState};

const QTY_EPSILON: f64 = 1e-9;

/// Persistence boundary for completed brackets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn record(&self, trade: ClosedTrade) -> Result<()>;
}

/// Sink that only logs, for dry runs and tests
pub struct LogTradeSink;

#[async_trait]
impl TradeSink for LogTradeSink {
    async fn record(&self, trade: ClosedTrade) -> Result<()> {
        let payload = serde_json::to_string(&trade).context("serializing closed trade")?;
        info!(
            symbol = %trade.symbol,
            reason = %trade.reason,
            trade = %payload,
            "trade closed"
        );
        Ok(())
    }
}

/// Everything mutable, guarded by one lock per account
struct EngineState {
    store: CandleStore,
    trailing: HashMap<(String, PositionSide), TrailingState>,
    positions: HashMap<(String, PositionSide), Position>,
    admission: AdmissionControl,
    events: DedupCache,
    margin_dedup: MarginDedup,
    /// Symbols with a delayed flatten already scheduled
    flatten_pending: HashSet<String>,
}

pub struct Engine {
    cfg: AppConfig,
    client: Arc<dyn ExchangeClient>,
    patterns: PatternEngine,
    placer: EntryPlacer,
    trailer: TrailEngine,
    reconciler: Arc<Reconciler>,
    sink: Arc<dyn TradeSink>,
    state: Arc<Mutex<EngineState>>,
}

impl Engine {
    pub fn new(cfg: AppConfig, client: Arc<dyn ExchangeClient>, sink: Arc<dyn TradeSink>) -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let state = EngineState {
            store: CandleStore::new(cfg.bot.candle_history),
            trailing: HashMap::new(),
            positions: HashMap::new(),
            admission: AdmissionControl::new(cfg.admission.clone(), now_ms),
            events: DedupCache::new(cfg.reconcile.event_cache_size),
            margin_dedup: MarginDedup::new(cfg.reconcile.margin_dedup_timeout_ms),
            flatten_pending: HashSet::new(),
        };
        let prefix = cfg.bot.client_id_prefix.clone();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&client),
            prefix.clone(),
            cfg.reconcile.clone(),
            Arc::clone(&sink),
        ));
        Self {
            patterns: PatternEngine::new(cfg.patterns.clone()),
            placer: EntryPlacer::new(
                Arc::clone(&client),
                prefix.clone(),
                cfg.bot.leverage,
                cfg.risk.clone(),
            ),
            trailer: TrailEngine::new(Arc::clone(&client), prefix, cfg.trailing.clone()),
            reconciler,
            sink,
            state: Arc::new(Mutex::new(state)),
            client,
            cfg,
        }
    }

    /// Backfill candle history, rebuild the trailing book from exchange
    /// truth and sweep leftovers. Run once before consuming streams.
    pub async fn start(&self) -> Result<()> {
        info!(config = %self.cfg.digest(), "engine starting");

        let mut state = self.state.lock().await;
        for symbol in &self.cfg.bot.symbols {
            for interval in [Interval::Min1, Interval::Min5, Interval::Min15] {
                let rows = self
                    .client
                    .get_klines(symbol, interval, self.cfg.bot.candle_history, None)
                    .await
                    .with_context(|| format!("backfill {} {}", symbol, interval))?;
                let candles: Vec<Candle> = rows
                    .into_iter()
                    .map(|r| r.into_candle(symbol, interval))
                    .collect();
                debug!(%symbol, %interval, count = candles.len(), "history seeded");
                state.store.seed_history(candles);
            }
        }

        let rebuilt = self
            .reconciler
            .rebuild(self.cfg.bot.scalping_mode, self.trailer.config())
            .await
            .context("trailing rebuild")?;
        for st in rebuilt {
            state
                .trailing
                .insert((st.symbol.clone(), st.position_side), st);
        }

        // Re-book the positions behind the rebuilt brackets so later exit
        // fills close them as trades instead of hitting an empty book
        let open = self
            .client
            .get_open_positions()
            .await
            .context("open positions at startup")?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        for p in open {
            let key = (p.symbol.clone(), p.position_side);
            if !state.trailing.contains_key(&key) {
                continue;
            }
            state.positions.insert(
                key,
                Position {
                    symbol: p.symbol,
                    side: p.position_side.entry_side(),
                    position_side: p.position_side,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    leverage: p.leverage,
                    allocated_margin: p.isolated_margin,
                    entry_time: now_ms,
                    pattern: None,
                },
            );
        }

        for symbol in &self.cfg.bot.symbols {
            if let Err(e) = self.reconciler.flatten_unprotected(symbol).await {
                warn!(%symbol, error = %e, "startup flatten pass failed");
            }
        }

        info!(
            brackets = state.trailing.len(),
            "engine started"
        );
        Ok(())
    }

    /// Ingest a 1-minute candle update. Sealed series bars drive pattern
    /// evaluation; the tick price drives the trailing book either way.
    pub async fn on_minute_candle(&self, candle: Candle) -> Result<()> {
        let symbol = candle.symbol.clone();
        let price = candle.close;

        let sealed = {
            let mut state = self.state.lock().await;
            state.store.on_minute_candle(candle)
        };

        for closed in sealed {
            self.evaluate_series(&closed).await;
        }

        self.on_price(&symbol, price).await;
        Ok(())
    }

    async fn evaluate_series(&self, closed: &Candle) {
        let series = {
            let state = self.state.lock().await;
            state.store.closed(&closed.symbol, closed.interval)
        };
        let mark = match self.client.get_mark_price(&closed.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %closed.symbol, error = %e, "mark price unavailable, skipping evaluation");
                return;
            }
        };
        let Some(signal) = self
            .patterns
            .evaluate(
                self.client.as_ref(),
                &series,
                &closed.symbol,
                closed.interval,
                mark,
            )
            .await
        else {
            return;
        };
        self.try_enter(signal).await;
    }

    /// Admission-checked entry for a confirmed signal
    async fn try_enter(&self, signal: Signal) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let permit = {
            let mut state = self.state.lock().await;
            if state
                .trailing
                .contains_key(&(signal.symbol.clone(), signal.side))
            {
                debug!(symbol = %signal.symbol, side = %signal.side, "bracket already live");
                return;
            }
            match state.admission.check_entry(&signal.symbol, signal.side, now_ms) {
                Ok(p) => p,
                Err(block) => {
                    info!(
                        symbol = %signal.symbol,
                        side = %signal.side,
                        pattern = %signal.pattern,
                        reason = ?block,
                        "entry blocked by admission control"
                    );
                    return;
                }
            }
        };

        let bracket = match self.placer.place(&signal, now_ms).await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "entry placement failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state
            .admission
            .record_entry(permit, &signal.symbol, signal.side, now_ms);
        let st = TrailingState::new(
            signal.symbol.clone(),
            signal.side,
            bracket.position.quantity,
            self.cfg.bot.scalping_mode,
            bracket.stop.trigger_price,
            bracket.target.trigger_price,
            bracket.stop.client_id.clone(),
            bracket.target.client_id.clone(),
            bracket.position.entry_price,
            self.trailer.config(),
        );
        state
            .trailing
            .insert((signal.symbol.clone(), signal.side), st);
        state
            .positions
            .insert((signal.symbol.clone(), signal.side), bracket.position);
        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            pattern = %signal.pattern,
            confirmed_by = ?signal.confirming_interval,
            "bracket opened"
        );
    }

    /// Drive the trailing book for one price tick
    pub async fn on_price(&self, symbol: &str, price: f64) {
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = (symbol.to_string(), side);
            let mut state = self.state.lock().await;
            let Some(st) = state.trailing.get_mut(&key) else {
                continue;
            };
            if st.triggered(price).is_none() {
                continue;
            }
            let filters = match self.client.get_symbol_filters(symbol).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(%symbol, error = %e, "symbol filters unavailable, skipping trail");
                    continue;
                }
            };
            let outcome = self.trailer.attempt(st, price, &filters).await;
            match outcome {
                Ok(TrailOutcome::BracketGone) => {
                    state.trailing.remove(&key);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%symbol, side = %side, error = %e, "trail attempt failed");
                }
            }
        }
    }

    /// Apply one account-stream event. At-least-once delivery is absorbed
    /// by the event id cache; replaying a processed event is a no-op. An
    /// event is only marked processed after its handler succeeds, so a
    /// failed handler gets another chance on redelivery.
    pub async fn on_account_event(&self, event: AccountEvent) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.events.contains(&event.id) {
                debug!(event_id = %event.id, "duplicate account event dropped");
                return Ok(());
            }
        }
        let AccountEventKind::OrderFill(fill) = event.kind else {
            self.state.lock().await.events.insert(&event.id);
            return Ok(());
        };

        let outcome = match classify_fill(&self.cfg.bot.client_id_prefix, &fill) {
            FillClass::Entry(_) | FillClass::Close => {
                // An algo-type fill outside the protective pair disturbs
                // the book the same way a foreign one does
                if fill.is_conditional {
                    self.schedule_flatten(&fill.symbol).await;
                }
                Ok(())
            }
            FillClass::Stop(root) => {
                self.on_protective_fill(&fill, root, ProtectiveKind::Stop)
                    .await
            }
            FillClass::Target(root) => {
                self.on_protective_fill(&fill, root, ProtectiveKind::Target)
                    .await
            }
            FillClass::Foreign => {
                self.schedule_flatten(&fill.symbol).await;
                Ok(())
            }
        };
        if outcome.is_ok() {
            self.state.lock().await.events.insert(&event.id);
        }
        outcome
    }

    /// A protective leg filled: top up margin on a partial, or finish the
    /// bracket (cancel the sibling, drop state, record the trade) on a full
    /// fill.
    async fn on_protective_fill(
        &self,
        fill: &FillEvent,
        root: String,
        kind: ProtectiveKind,
    ) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let key = (fill.symbol.clone(), fill.position_side);

        let partial = fill.filled_qty + QTY_EPSILON < fill.order_qty;
        if partial {
            if let Some(amount) = self.reconciler.margin_topup_amount(fill) {
                let claim = {
                    let mut state = self.state.lock().await;
                    state.margin_dedup.try_claim(&fill.order_id, now_ms)
                };
                if claim {
                    if let Err(e) = self
                        .reconciler
                        .add_margin(&fill.symbol, fill.position_side, amount)
                        .await
                    {
                        warn!(symbol = %fill.symbol, error = %e, "margin top-up failed");
                    }
                }
            }
            // The position shrank under the bracket: shrink the booked
            // quantities so later trail replacements match, and sweep to
            // close anything the reduced pair no longer covers
            {
                let mut state = self.state.lock().await;
                if let Some(st) = state.trailing.get_mut(&key) {
                    st.quantity = (st.quantity - fill.filled_qty).max(0.0);
                }
                if let Some(p) = state.positions.get_mut(&key) {
                    p.quantity = (p.quantity - fill.filled_qty).max(0.0);
                }
            }
            self.schedule_flatten(&fill.symbol).await;
            return Ok(());
        }

        // Full fill: the sibling leg is now a ghost
        let sibling_tag = match kind {
            ProtectiveKind::Stop => OrderTag::Target,
            ProtectiveKind::Target => OrderTag::Stop,
        };
        let sibling =
            ClientOrderId::new(sibling_tag, root).encode(&self.cfg.bot.client_id_prefix);
        if let Err(e) = self
            .client
            .cancel_conditional_order(&fill.symbol, &sibling)
            .await
        {
            // Usually already cancelled or triggered; reconcile sweeps stragglers
            debug!(symbol = %fill.symbol, order = %sibling, error = %e, "sibling cancel refused");
        }
        // Conditional fills also get the delayed sweep, catching anything
        // the direct cancel raced with
        self.schedule_flatten(&fill.symbol).await;

        let position = {
            let state = self.state.lock().await;
            state.positions.get(&key).cloned()
        };
        let Some(position) = position else {
            debug!(symbol = %fill.symbol, side = %fill.position_side, "fill for unknown bracket");
            return Ok(());
        };

        let reason = match kind {
            ProtectiveKind::Stop => ExitReason::StopLoss,
            ProtectiveKind::Target => ExitReason::TakeProfit,
        };
        let trade = ClosedTrade {
            symbol: fill.symbol.clone(),
            side: position.side,
            position_side: position.position_side,
            entry_price: position.entry_price,
            exit_price: fill.price,
            quantity: fill.filled_qty,
            stop_price: if reason == ExitReason::StopLoss {
                fill.price
            } else {
                0.0
            },
            target_price: if reason == ExitReason::TakeProfit {
                fill.price
            } else {
                0.0
            },
            pnl: fill.realized_pnl - fill.commission,
            pattern: position.pattern,
            entry_time: position.entry_time,
            exit_time: now_ms,
            reason,
        };
        // Record first: a sink failure leaves the bracket booked so the
        // redelivered event can try again
        self.sink
            .record(trade)
            .await
            .context("recording closed trade")?;
        let mut state = self.state.lock().await;
        state.trailing.remove(&key);
        state.positions.remove(&key);
        Ok(())
    }

    /// Schedule a delayed flatten pass for a symbol hit by a fill the engine
    /// did not place. The delay absorbs cancellation propagation lag; the
    /// pending set keeps one task per symbol.
    async fn schedule_flatten(&self, symbol: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.flatten_pending.insert(symbol.to_string()) {
                debug!(%symbol, "flatten already scheduled");
                return;
            }
        }
        info!(%symbol, delay_ms = self.reconciler.flatten_delay_ms(), "unwanted fill, flatten scheduled");

        let reconciler = Arc::clone(&self.reconciler);
        let state = Arc::clone(&self.state);
        let symbol = symbol.to_string();
        let delay = reconciler.flatten_delay_ms();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Err(e) = reconciler.flatten_unprotected(&symbol).await {
                warn!(%symbol, error = %e, "scheduled flatten failed");
            }
            state.lock().await.flatten_pending.remove(&symbol);
        });
    }

    /// Suspend new entries until the given timestamp (command surface)
    pub async fn set_resting(&self, until_ms: i64) {
        self.state.lock().await.admission.set_resting(until_ms);
        info!(until_ms, "resting window set");
    }

    /// Grant a batch of spacing-exempt entries (command surface)
    pub async fn activate_burst(&self) -> Result<usize> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let granted = self
            .state
            .lock()
            .await
            .admission
            .activate_burst(now_ms)
            .map_err(|b| anyhow::anyhow!("burst activation refused: {:?}", b))?;
        info!(granted, "burst mode activated");
        Ok(granted)
    }

    /// Number of live brackets (test and telemetry hook)
    pub async fn open_brackets(&self) -> usize {
        self.state.lock().await.trailing.len()
    }
}
