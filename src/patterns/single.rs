//! 3-candle single-candlestick reversal patterns
//!
//! The two candles before the signal candle provide trend context: a bullish
//! reversal needs a decline into the signal bar, a bearish one needs a rise.

use crate::types::{Candle, PatternKind};

/// Geometry thresholds shared by the single-candle patterns
const WICK_BODY_RATIO: f64 = 2.0;
const SPINNING_BODY_MAX: f64 = 0.3;

/// Detect a single-candle pattern over exactly the last 3 closed candles.
/// Returns the pattern and its defining extreme (candidate stop price).
pub fn detect_single(candles: &[Candle]) -> Option<(PatternKind, f64)> {
    if candles.len() < 3 {
        return None;
    }
    let [c0, c1, c2] = [
        &candles[candles.len() - 3],
        &candles[candles.len() - 2],
        &candles[candles.len() - 1],
    ];

    let declining = c1.close < c0.close && c2.open <= c1.close.max(c1.open);
    let rising = c1.close > c0.close && c2.open >= c1.close.min(c1.open);

    let body = c2.body();
    if body <= 0.0 {
        return None;
    }

    // Hammer: long lower wick rejected the decline
    if declining && c2.lower_wick() >= WICK_BODY_RATIO * body && c2.upper_wick() <= body {
        return Some((PatternKind::Hammer, c2.low));
    }

    // Inverse hammer: long upper wick rejected the rise
    if rising && c2.upper_wick() >= WICK_BODY_RATIO * body && c2.lower_wick() <= body {
        return Some((PatternKind::InverseHammer, c2.high));
    }

    // Spinning tops: indecision bar with a small body and both wicks present
    let range = c2.high - c2.low;
    if range > 0.0 && body <= SPINNING_BODY_MAX * range {
        let balanced = c2.upper_wick() >= body && c2.lower_wick() >= body;
        if balanced && declining && c2.is_bullish() {
            return Some((PatternKind::BullishSpinningTop, c2.low));
        }
        if balanced && rising && c2.is_bearish() {
            return Some((PatternKind::BearishSpinningTop, c2.high));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interval;

    fn candle(o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            interval: Interval::Min5,
            start_time: 0,
            end_time: 299_999,
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

    #[test]
    fn test_hammer_after_decline() {
        let candles = vec![
            candle(110.0, 111.0, 107.0, 108.0),
            candle(108.0, 108.5, 104.0, 105.0),
            // long lower wick, small body near the top
            candle(104.8, 105.6, 100.0, 105.4),
        ];
        let (kind, stop) = detect_single(&candles).expect("hammer");
        assert_eq!(kind, PatternKind::Hammer);
        assert_eq!(stop, 100.0);
    }

    #[test]
    fn test_hammer_needs_downtrend() {
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(100.5, 102.0, 100.0, 101.5),
            candle(101.0, 101.6, 96.0, 101.4),
        ];
        assert!(detect_single(&candles).is_none());
    }

    #[test]
    fn test_inverse_hammer_after_rise() {
        let candles = vec![
            candle(100.0, 101.0, 99.5, 100.5),
            candle(100.5, 103.0, 100.2, 102.5),
            // long upper wick
            candle(102.8, 108.0, 102.4, 102.5),
        ];
        let (kind, stop) = detect_single(&candles).expect("inverse hammer");
        assert_eq!(kind, PatternKind::InverseHammer);
        assert_eq!(stop, 108.0);
    }

    #[test]
    fn test_bullish_spinning_top() {
        let candles = vec![
            candle(110.0, 111.0, 107.0, 108.0),
            candle(108.0, 108.5, 104.0, 105.0),
            // small bullish body centered in the range
            candle(104.5, 106.5, 102.5, 104.9),
        ];
        let (kind, _) = detect_single(&candles).expect("spinning top");
        assert_eq!(kind, PatternKind::BullishSpinningTop);
    }

    #[test]
    fn test_doji_rejected() {
        let candles = vec![
            candle(110.0, 111.0, 107.0, 108.0),
            candle(108.0, 108.5, 104.0, 105.0),
            candle(104.5, 106.0, 103.0, 104.5),
        ];
        assert!(detect_single(&candles).is_none());
    }
}
