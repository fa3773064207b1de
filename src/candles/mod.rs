//! Candle Store - Rolls a per-symbol 1-minute candle stream into
//! higher-interval series
//!
//! Maintains rolling windows of closed candles per (symbol, interval) and
//! seals 5m/15m aggregates exactly once per interval boundary. Out-of-order
//! or duplicate updates are absorbed by an append/replace/ignore rule keyed
//! on the candle start time.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::types::{Candle, Interval};

/// Intervals the store aggregates from the 1-minute stream
pub const AGGREGATE_INTERVALS: [Interval; 2] = [Interval::Min5, Interval::Min15];

/// In-progress aggregate for one (symbol, target interval)
#[derive(Debug, Clone)]
struct BuildingAggregate {
    start_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: u64,
    /// Start time of the last 1m candle rolled in, guards double-counting
    last_rolled: i64,
}

impl BuildingAggregate {
    fn new(start_time: i64, c: &Candle) -> Self {
        Self {
            start_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            quote_volume: c.quote_volume,
            trade_count: c.trade_count,
            last_rolled: c.start_time,
        }
    }

    fn roll(&mut self, c: &Candle) {
        self.high = self.high.max(c.high);
        self.low = self.low.min(c.low);
        self.close = c.close;
        self.volume += c.volume;
        self.quote_volume += c.quote_volume;
        self.trade_count += c.trade_count;
        self.last_rolled = c.start_time;
    }

    fn seal(&self, symbol: &str, interval: Interval) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval,
            start_time: self.start_time,
            end_time: self.start_time + interval.millis() - 1,
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

/// Candle store with multi-timeframe aggregation
pub struct CandleStore {
    /// Closed (and one in-progress 1m) candles per (symbol, interval)
    history: HashMap<(String, Interval), VecDeque<Candle>>,
    /// Aggregates-in-progress per (symbol, target interval)
    building: HashMap<(String, Interval), BuildingAggregate>,
    /// Maximum candles retained per series
    max_history: usize,
}

impl CandleStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: HashMap::new(),
            building: HashMap::new(),
            max_history,
        }
    }

    /// Ingest one 1-minute candle update and return every series candle that
    /// sealed as a result (the 1m candle itself on finality, plus any 5m/15m
    /// aggregate whose boundary it completed).
    pub fn on_minute_candle(&mut self, candle: Candle) -> Vec<Candle> {
        debug_assert_eq!(candle.interval, Interval::Min1);
        let mut sealed = Vec::new();

        if !self.store_minute(&candle) {
            return sealed;
        }

        if !candle.is_final {
            return sealed;
        }

        sealed.push(candle.clone());

        for interval in AGGREGATE_INTERVALS {
            if let Some(c) = self.roll_into(&candle, interval) {
                sealed.push(c);
            }
        }

        sealed
    }

    /// Append/replace/ignore rule for the 1m series. Returns false if the
    /// update was older than the series head and was dropped.
    fn store_minute(&mut self, candle: &Candle) -> bool {
        let key = (candle.symbol.clone(), Interval::Min1);
        let series = self.history.entry(key).or_default();

        match series.back() {
            Some(last) if candle.start_time < last.start_time => {
                debug!(
                    symbol = %candle.symbol,
                    start_time = candle.start_time,
                    "ignoring stale 1m candle"
                );
                false
            }
            Some(last) if candle.start_time == last.start_time => {
                // In-progress update: replace in place. A sealed candle is
                // immutable, so a duplicate final is dropped too.
                if last.is_final {
                    return false;
                }
                if let Some(slot) = series.back_mut() {
                    *slot = candle.clone();
                }
                true
            }
            _ => {
                series.push_back(candle.clone());
                while series.len() > self.max_history {
                    series.pop_front();
                }
                true
            }
        }
    }

    /// Roll one final 1m candle into a higher-interval aggregate; returns the
    /// sealed candle when the incoming candle completes the boundary.
    fn roll_into(&mut self, candle: &Candle, interval: Interval) -> Option<Candle> {
        let agg_start = interval.bucket_start(candle.start_time);
        let key = (candle.symbol.clone(), interval);

        let current_start = self.building.get(&key).map(|a| a.start_time);
        match current_start {
            Some(start) if start == agg_start => {
                if let Some(agg) = self.building.get_mut(&key) {
                    if candle.start_time <= agg.last_rolled {
                        return None;
                    }
                    agg.roll(candle);
                }
            }
            _ => {
                if let Some(start) = current_start {
                    // A gap in the stream left an unfinished aggregate
                    // behind; exchange truth for that boundary arrives via
                    // backfill, so drop it rather than seal a partial bar.
                    debug!(
                        symbol = %candle.symbol,
                        %interval,
                        abandoned_start = start,
                        "abandoning stale aggregate"
                    );
                    self.building.remove(&key);
                }
                // A bucket only builds from its first minute. Starting
                // mid-bucket (fresh process, stream gap) would seal a short
                // bar, so wait for the next boundary instead.
                if candle.start_time != agg_start {
                    debug!(
                        symbol = %candle.symbol,
                        %interval,
                        "mid-bucket candle, deferring to the next boundary"
                    );
                    return None;
                }
                self.building
                    .insert(key.clone(), BuildingAggregate::new(agg_start, candle));
            }
        }

        let agg = self.building.get(&key)?;
        if candle.end_time >= agg_start + interval.millis() - 1 {
            let sealed = agg.seal(&candle.symbol, interval);
            self.building.remove(&key);
            self.push_closed(sealed.clone());
            Some(sealed)
        } else {
            None
        }
    }

    fn push_closed(&mut self, candle: Candle) {
        let key = (candle.symbol.clone(), candle.interval);
        let series = self.history.entry(key).or_default();
        series.push_back(candle);
        while series.len() > self.max_history {
            series.pop_front();
        }
    }

    /// Seed a series with historical candles (e.g. from a REST backfill)
    pub fn seed_history(&mut self, candles: Vec<Candle>) {
        for candle in candles {
            if candle.is_final {
                self.push_closed(candle);
            }
        }
    }

    /// All closed candles of a series, oldest first
    pub fn closed(&self, symbol: &str, interval: Interval) -> Vec<Candle> {
        self.history
            .get(&(symbol.to_string(), interval))
            .map(|s| s.iter().filter(|c| c.is_final).cloned().collect())
            .unwrap_or_default()
    }

    /// Last `n` closed candles of a series, oldest first
    pub fn last_closed(&self, symbol: &str, interval: Interval, n: usize) -> Vec<Candle> {
        let mut candles = self.closed(symbol, interval);
        if candles.len() > n {
            candles.drain(..candles.len() - n);
        }
        candles
    }

    /// Latest traded price for a symbol, from the newest 1m update
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.history
            .get(&(symbol.to_string(), Interval::Min1))
            .and_then(|s| s.back())
            .map(|c| c.close)
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(500)
    }
}
