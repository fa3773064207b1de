//! Confirmation gates applied to detected patterns
//!
//! A pattern only becomes a signal after passing the volatility, historical,
//! volume and higher-timeframe gates. The predicates here are pure; fetching
//! the data they run on is the engine's job.

use crate::types::{Candle, PatternFamily, PositionSide};

use super::PatternMatch;

/// How many closed bars back a higher-timeframe pattern may sit and still
/// confirm the lower-timeframe signal.
const MAX_PATTERN_AGE: usize = 2;

/// Volatility gate: reject if any candle in the pattern window is gappy or
/// illiquid, measured as (high-low)/low against a per-interval threshold.
pub fn volatility_gate(window: &[Candle], max_range: f64) -> bool {
    window.iter().all(|c| c.range_pct() <= max_range)
}

/// Historical gate: the pattern's extreme must be a fresh extreme. A bullish
/// setup is rejected if any prior bar in the lookback made a lower low, a
/// bearish one if any made a higher high - those are trend continuations,
/// not reversals.
pub fn historical_gate(prior: &[Candle], side: PositionSide, extreme: f64) -> bool {
    match side {
        PositionSide::Long => prior.iter().all(|c| c.low >= extreme),
        PositionSide::Short => prior.iter().all(|c| c.high <= extreme),
    }
}

/// Volume gate input: true if the newer of the two most recently closed
/// candles carries more volume than the older.
pub fn volume_increasing(last_two: &[Candle]) -> bool {
    match last_two {
        [older, newer] => newer.volume > older.volume,
        _ => false,
    }
}

/// Higher-timeframe confirmation over one HTF series.
///
/// Re-runs detection near the end of the series; the match must be the same
/// family and direction, the live price must sit inside the zone bounded by
/// the pattern's confirmation candles, and no later bar may have broken that
/// zone against the trade direction.
pub fn confirm_on_series<F>(
    candles: &[Candle],
    family: PatternFamily,
    side: PositionSide,
    live_price: f64,
    detect: F,
) -> bool
where
    F: Fn(&[Candle]) -> Option<PatternMatch>,
{
    let n = candles.len();

    for age in 0..=MAX_PATTERN_AGE {
        if n <= age + 4 {
            break;
        }
        let sub = &candles[..n - age];
        let Some(m) = detect(sub) else {
            continue;
        };
        if m.kind.family() != family || m.kind.position_side() != side {
            continue;
        }

        // Confirmation candles are the pattern bars, context excluded
        let zone_len = m.window_len.saturating_sub(2).max(1);
        let zone = &sub[sub.len() - zone_len..];
        let zone_low = zone.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let zone_high = zone.iter().map(|c| c.high).fold(f64::MIN, f64::max);

        if live_price < zone_low || live_price > zone_high {
            continue;
        }

        // Post-pattern no-violation check
        let later = &candles[n - age..];
        let violated = match side {
            PositionSide::Long => later.iter().any(|c| c.low < zone_low),
            PositionSide::Short => later.iter().any(|c| c.high > zone_high),
        };
        if !violated {
            return true;
        }
    }

    false
}
