//! Pattern Engine - Candlestick reversal detection with multi-timeframe
//! confirmation
//!
//! On each closed series bar the engine evaluates, in order, the 3-candle
//! single-candlestick patterns and then the multi-candle patterns; the first
//! pattern that survives every gate wins and at most one signal is produced
//! per closed bar.

pub mod gates;
pub mod multi;
pub mod single;

use tracing::{debug, warn};

use crate::config::PatternConfig;
use crate::exchange::ExchangeClient;
use crate::types::{Candle, Interval, PatternKind, PositionSide, Signal};

/// A detected (but not yet confirmed) pattern
#[derive(Debug, Clone, Copy)]
pub struct PatternMatch {
    pub kind: PatternKind,
    /// The pattern's defining extreme - the candidate stop price
    pub stop: f64,
    /// Trailing candles the pattern spans, trend context included
    pub window_len: usize,
}

/// Run detection against the very end of a closed series:
/// singles first, then engulfing/harami/inside-bar.
pub fn detect_at_end(candles: &[Candle], max_inside_bars: usize) -> Option<PatternMatch> {
    if let Some((kind, stop)) = single::detect_single(candles) {
        return Some(PatternMatch {
            kind,
            stop,
            window_len: 3,
        });
    }
    multi::detect_multi(candles, max_inside_bars).map(|m| PatternMatch {
        kind: m.kind,
        stop: m.stop,
        window_len: m.window_len,
    })
}

pub struct PatternEngine {
    cfg: PatternConfig,
}

impl PatternEngine {
    pub fn new(cfg: PatternConfig) -> Self {
        Self { cfg }
    }

    /// Detection plus the two gates that run on local data (volatility and
    /// historical). `candles` is the closed series, oldest first.
    pub fn detect_local(&self, candles: &[Candle], interval: Interval) -> Option<PatternMatch> {
        let m = detect_at_end(candles, self.cfg.max_inside_bars)?;
        let n = candles.len();
        let window = &candles[n - m.window_len.min(n)..];

        if !gates::volatility_gate(window, self.cfg.max_range_for(interval)) {
            debug!(kind = %m.kind, %interval, "volatility gate rejected pattern");
            return None;
        }

        let lookback = self.cfg.lookback_for(interval);
        let before = &candles[..n - m.window_len.min(n)];
        let prior = if before.len() > lookback {
            &before[before.len() - lookback..]
        } else {
            before
        };
        if !gates::historical_gate(prior, m.kind.position_side(), m.stop) {
            debug!(kind = %m.kind, %interval, "historical gate rejected pattern");
            return None;
        }

        Some(m)
    }

    /// Full evaluation of one closed series bar: local detection, volume
    /// gate and higher-timeframe confirmation. Exchange failures during a
    /// gate reject the candidate; signal evaluation is never retried.
    pub async fn evaluate(
        &self,
        exchange: &dyn ExchangeClient,
        candles: &[Candle],
        symbol: &str,
        interval: Interval,
        mark_price: f64,
    ) -> Option<Signal> {
        if candles.len() < 6 {
            return None;
        }
        let m = self.detect_local(candles, interval)?;
        let side = m.kind.position_side();

        if !self.volume_gate(exchange, symbol).await {
            debug!(%symbol, kind = %m.kind, "volume gate rejected pattern");
            return None;
        }

        let confirming = self
            .htf_confirmation(exchange, symbol, interval, &m, mark_price)
            .await?;

        let close = candles.last()?.close;
        let target = self.target_for(&m, close)?;

        Some(Signal {
            symbol: symbol.to_string(),
            side,
            pattern: m.kind,
            stop_price: m.stop,
            target_price: target,
            source_interval: interval,
            confirming_interval: Some(confirming),
        })
    }

    /// Volume gate: increasing volume on at least one of the configured
    /// higher intervals, checked highest first.
    async fn volume_gate(&self, exchange: &dyn ExchangeClient, symbol: &str) -> bool {
        for code in &self.cfg.volume_intervals {
            let Some(interval) = Interval::from_code(code) else {
                continue;
            };
            match exchange.get_klines(symbol, interval, 2, None).await {
                Ok(rows) if rows.len() >= 2 => {
                    let candles: Vec<Candle> = rows
                        .into_iter()
                        .map(|r| r.into_candle(symbol, interval))
                        .collect();
                    if gates::volume_increasing(&candles[candles.len() - 2..]) {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%symbol, %interval, error = %e, "volume gate kline fetch failed");
                }
            }
        }
        false
    }

    /// Re-run detection on each configured higher timeframe; the first one
    /// showing the same family and direction, with the live price inside an
    /// unviolated confirmation zone, confirms the signal.
    async fn htf_confirmation(
        &self,
        exchange: &dyn ExchangeClient,
        symbol: &str,
        source: Interval,
        m: &PatternMatch,
        mark_price: f64,
    ) -> Option<Interval> {
        let family = m.kind.family();
        let side = m.kind.position_side();
        let max_inside = self.cfg.max_inside_bars;

        for code in &self.cfg.confirmation_intervals {
            let Some(interval) = Interval::from_code(code) else {
                continue;
            };
            if interval <= source {
                continue;
            }
            match exchange.get_klines(symbol, interval, 30, None).await {
                Ok(rows) => {
                    let htf: Vec<Candle> = rows
                        .into_iter()
                        .map(|r| r.into_candle(symbol, interval))
                        .collect();
                    let confirmed =
                        gates::confirm_on_series(&htf, family, side, mark_price, |cs| {
                            detect_at_end(cs, max_inside)
                        });
                    if confirmed {
                        return Some(interval);
                    }
                }
                Err(e) => {
                    warn!(%symbol, %interval, error = %e, "confirmation kline fetch failed");
                }
            }
        }
        None
    }

    /// Asymmetric target: a fixed multiple of the stop distance past the
    /// pattern close, on the winning side. Exits are trail-managed, so the
    /// multiple is deliberately reward-skewed.
    fn target_for(&self, m: &PatternMatch, close: f64) -> Option<f64> {
        let multiple = match m.kind {
            PatternKind::Hammer
            | PatternKind::InverseHammer
            | PatternKind::BullishSpinningTop
            | PatternKind::BearishSpinningTop => self.cfg.reward_multiple_single,
            PatternKind::BullishEngulfing
            | PatternKind::BearishEngulfing
            | PatternKind::BullishHarami
            | PatternKind::BearishHarami => self.cfg.reward_multiple_multi,
            PatternKind::BullishInsideBar | PatternKind::BearishInsideBar => {
                self.cfg.reward_multiple_inside
            }
        };

        match m.kind.position_side() {
            PositionSide::Long => {
                let risk = close - m.stop;
                (risk > 0.0).then(|| close + multiple * risk)
            }
            PositionSide::Short => {
                let risk = m.stop - close;
                (risk > 0.0).then(|| close - multiple * risk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::exchange::{KlineRow, MockExchangeClient};

    fn pattern_cfg() -> PatternConfig {
        AppConfig::load().unwrap().patterns
    }

    fn candle(start: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: Interval::Min5,
            start_time: start,
            end_time: start + 299_999,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            quote_volume: 100.0,
            trade_count: 5,
            is_final: true,
        }
    }

    /// A calm descending run ending in a clean hammer with its low at 104.0
    fn hammer_series(prior_low: f64) -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut ts = 0i64;
        // Flat, low-volatility prelude
        for i in 0..20 {
            let p = 112.0 - 0.1 * i as f64;
            candles.push(candle(ts, p, p + 0.3, prior_low.min(p - 0.3), p - 0.1));
            ts += 300_000;
        }
        candles.push(candle(ts, 110.0, 110.5, 108.0, 108.3));
        ts += 300_000;
        candles.push(candle(ts, 108.3, 108.5, 106.0, 106.3));
        ts += 300_000;
        candles.push(candle(ts, 106.2, 106.8, 104.0, 106.5));
        candles
    }

    #[test]
    fn test_detect_local_hammer() {
        let cfg = pattern_cfg();
        let engine = PatternEngine::new(cfg);
        // Prior lows stay above the hammer's 104.0 low
        let candles = hammer_series(104.5);
        let m = engine
            .detect_local(&candles, Interval::Min5)
            .expect("hammer through local gates");
        assert_eq!(m.kind, PatternKind::Hammer);
        assert_eq!(m.stop, 104.0);
    }

    #[test]
    fn test_historical_gate_blocks_prior_lower_low() {
        let cfg = pattern_cfg();
        let engine = PatternEngine::new(cfg);
        // Prior bars dip to 103.5, below the hammer's 104.0 extreme
        let candles = hammer_series(103.5);
        assert!(engine.detect_local(&candles, Interval::Min5).is_none());
    }

    #[test]
    fn test_volatility_gate_blocks_gappy_window() {
        let cfg = pattern_cfg();
        let engine = PatternEngine::new(cfg);
        let mut candles = hammer_series(104.5);
        // Blow out the range of a candle inside the pattern window
        let n = candles.len();
        candles[n - 2].high = 140.0;
        assert!(engine.detect_local(&candles, Interval::Min5).is_none());
    }

    fn hammer_kline_rows() -> Vec<KlineRow> {
        // Mirrors hammer_series geometry on a higher timeframe
        let mut rows: Vec<KlineRow> = (0..10)
            .map(|i| KlineRow {
                start_time: i * 3_600_000,
                end_time: i * 3_600_000 + 3_599_999,
                open: 112.0 - 0.1 * i as f64,
                high: 112.4 - 0.1 * i as f64,
                low: 110.0,
                close: 111.9 - 0.1 * i as f64,
                volume: 5.0,
                quote_volume: 500.0,
                trade_count: 50,
            })
            .collect();
        let base = 10 * 3_600_000;
        for (i, (o, h, l, c)) in [
            (110.0, 110.5, 107.0, 108.0),
            (108.0, 108.5, 104.5, 105.0),
            (104.8, 105.6, 100.0, 105.4),
        ]
        .iter()
        .enumerate()
        {
            rows.push(KlineRow {
                start_time: base + i as i64 * 3_600_000,
                end_time: base + i as i64 * 3_600_000 + 3_599_999,
                open: *o,
                high: *h,
                low: *l,
                close: *c,
                volume: 5.0,
                quote_volume: 500.0,
                trade_count: 50,
            });
        }
        rows
    }

    #[tokio::test]
    async fn test_evaluate_with_confirmation() {
        let cfg = pattern_cfg();
        let engine = PatternEngine::new(cfg);
        let candles = hammer_series(104.5);

        let mut exchange = MockExchangeClient::new();
        // Volume gate: newer candle carries more volume
        exchange
            .expect_get_klines()
            .withf(|_, _, limit, _| *limit == 2)
            .returning(|_, _, _, _| {
                Ok(vec![
                    KlineRow {
                        start_time: 0,
                        end_time: 1,
                        open: 1.0,
                        high: 1.0,
                        low: 1.0,
                        close: 1.0,
                        volume: 10.0,
                        quote_volume: 10.0,
                        trade_count: 1,
                    },
                    KlineRow {
                        start_time: 2,
                        end_time: 3,
                        open: 1.0,
                        high: 1.0,
                        low: 1.0,
                        close: 1.0,
                        volume: 12.0,
                        quote_volume: 12.0,
                        trade_count: 1,
                    },
                ])
            });
        // HTF confirmation: same hammer on 1h
        exchange
            .expect_get_klines()
            .withf(|_, _, limit, _| *limit == 30)
            .returning(|_, _, _, _| Ok(hammer_kline_rows()));

        let signal = engine
            .evaluate(&exchange, &candles, "BTCUSDT", Interval::Min5, 104.0)
            .await
            .expect("confirmed signal");
        assert_eq!(signal.pattern, PatternKind::Hammer);
        assert_eq!(signal.side, PositionSide::Long);
        assert_eq!(signal.stop_price, 104.0);
        assert!(signal.target_price > signal.stop_price);
        assert!(signal.confirming_interval.is_some());
    }

    #[tokio::test]
    async fn test_evaluate_requires_volume() {
        let cfg = pattern_cfg();
        let engine = PatternEngine::new(cfg);
        let candles = hammer_series(104.5);

        let mut exchange = MockExchangeClient::new();
        // Decreasing volume everywhere
        exchange.expect_get_klines().returning(|_, _, _, _| {
            Ok(vec![
                KlineRow {
                    start_time: 0,
                    end_time: 1,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 12.0,
                    quote_volume: 12.0,
                    trade_count: 1,
                },
                KlineRow {
                    start_time: 2,
                    end_time: 3,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 10.0,
                    quote_volume: 10.0,
                    trade_count: 1,
                },
            ])
        });

        let signal = engine
            .evaluate(&exchange, &candles, "BTCUSDT", Interval::Min5, 104.0)
            .await;
        assert!(signal.is_none());
    }
}
