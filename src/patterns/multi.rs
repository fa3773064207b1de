//! Multi-candle reversal patterns: engulfing, harami and the variable-width
//! inside-bar family (1-5 inside candles bounded by a mother candle).

use crate::types::{Candle, PatternKind};

/// A detected multi-candle pattern: kind, defining extreme (candidate stop)
/// and how many trailing candles the pattern spans (context included).
pub struct MultiMatch {
    pub kind: PatternKind,
    pub stop: f64,
    pub window_len: usize,
}

/// Detect engulfing/harami over the last 4 closed candles (2 context +
/// 2 pattern candles), then the inside-bar family. First hit wins.
pub fn detect_multi(candles: &[Candle], max_inside_bars: usize) -> Option<MultiMatch> {
    if let Some(m) = detect_engulfing(candles) {
        return Some(m);
    }
    if let Some(m) = detect_harami(candles) {
        return Some(m);
    }
    detect_inside_bar(candles, max_inside_bars)
}

fn trend_context(candles: &[Candle], end: usize) -> (bool, bool) {
    // Two candles immediately before the pattern pair set the trend
    if end < 2 {
        return (false, false);
    }
    let a = &candles[end - 2];
    let b = &candles[end - 1];
    let declining = b.close < a.close;
    let rising = b.close > a.close;
    (declining, rising)
}

fn detect_engulfing(candles: &[Candle]) -> Option<MultiMatch> {
    if candles.len() < 4 {
        return None;
    }
    let n = candles.len();
    let prev = &candles[n - 2];
    let last = &candles[n - 1];
    let (declining, rising) = trend_context(candles, n - 2);

    let engulfs = last.body() > prev.body();

    if declining
        && prev.is_bearish()
        && last.is_bullish()
        && engulfs
        && last.open <= prev.close
        && last.close >= prev.open
    {
        return Some(MultiMatch {
            kind: PatternKind::BullishEngulfing,
            stop: prev.low.min(last.low),
            window_len: 4,
        });
    }

    if rising
        && prev.is_bullish()
        && last.is_bearish()
        && engulfs
        && last.open >= prev.close
        && last.close <= prev.open
    {
        return Some(MultiMatch {
            kind: PatternKind::BearishEngulfing,
            stop: prev.high.max(last.high),
            window_len: 4,
        });
    }

    None
}

fn detect_harami(candles: &[Candle]) -> Option<MultiMatch> {
    if candles.len() < 4 {
        return None;
    }
    let n = candles.len();
    let mother = &candles[n - 2];
    let baby = &candles[n - 1];
    let (declining, rising) = trend_context(candles, n - 2);

    // Baby body strictly inside the mother body
    let inside = baby.open.max(baby.close) < mother.open.max(mother.close)
        && baby.open.min(baby.close) > mother.open.min(mother.close);
    if !inside || baby.body() >= mother.body() {
        return None;
    }

    if declining && mother.is_bearish() && baby.is_bullish() {
        return Some(MultiMatch {
            kind: PatternKind::BullishHarami,
            stop: mother.low,
            window_len: 4,
        });
    }
    if rising && mother.is_bullish() && baby.is_bearish() {
        return Some(MultiMatch {
            kind: PatternKind::BearishHarami,
            stop: mother.high,
            window_len: 4,
        });
    }

    None
}

/// Inside-bar family: a mother candle followed by 1..=max inside candles whose
/// full ranges stay within the mother's range. Direction is a reversal of the
/// mother candle, confirmed by the last inside candle closing past the mother
/// midpoint.
fn detect_inside_bar(candles: &[Candle], max_inside_bars: usize) -> Option<MultiMatch> {
    let n = candles.len();

    for k in 1..=max_inside_bars {
        // mother at n-1-k, inside candles at n-k..n
        if n < k + 2 {
            break;
        }
        let mother = &candles[n - 1 - k];
        let inside = &candles[n - k..];
        if !inside
            .iter()
            .all(|c| c.high <= mother.high && c.low >= mother.low)
        {
            continue;
        }

        let midpoint = (mother.high + mother.low) / 2.0;
        let last = &candles[n - 1];
        let (declining, rising) = trend_context(candles, n - 1 - k);

        if declining && mother.is_bearish() && last.close > midpoint {
            return Some(MultiMatch {
                kind: PatternKind::BullishInsideBar,
                stop: mother.low,
                window_len: k + 3,
            });
        }
        if rising && mother.is_bullish() && last.close < midpoint {
            return Some(MultiMatch {
                kind: PatternKind::BearishInsideBar,
                stop: mother.high,
                window_len: k + 3,
            });
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
    fn test_bullish_engulfing() {
        let candles = vec![
            candle(112.0, 113.0, 109.0, 110.0),
            candle(110.0, 110.5, 107.0, 108.0),
            candle(107.5, 108.0, 105.0, 105.5), // bearish
            candle(105.0, 109.0, 104.0, 108.5), // engulfs it
        ];
        let m = detect_multi(&candles, 5).expect("engulfing");
        assert_eq!(m.kind, PatternKind::BullishEngulfing);
        assert_eq!(m.stop, 104.0);
        assert_eq!(m.window_len, 4);
    }

    #[test]
    fn test_bearish_engulfing() {
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(100.5, 102.5, 100.0, 102.0),
            candle(102.0, 104.0, 101.5, 103.5), // bullish
            candle(104.0, 105.0, 101.0, 101.5), // engulfs it
        ];
        let m = detect_multi(&candles, 5).expect("engulfing");
        assert_eq!(m.kind, PatternKind::BearishEngulfing);
        assert_eq!(m.stop, 105.0);
    }

    #[test]
    fn test_bullish_harami() {
        let candles = vec![
            candle(114.0, 115.0, 111.0, 112.0),
            candle(112.0, 112.5, 108.0, 109.0),
            candle(109.0, 109.5, 103.0, 104.0), // large bearish mother
            candle(105.5, 107.0, 105.0, 106.5), // small bullish inside
        ];
        let m = detect_multi(&candles, 5).expect("harami");
        assert_eq!(m.kind, PatternKind::BullishHarami);
        assert_eq!(m.stop, 103.0);
    }

    #[test]
    fn test_bullish_inside_bar_two_inside() {
        let candles = vec![
            candle(120.0, 121.0, 117.0, 118.0),
            candle(118.0, 118.5, 114.0, 115.0),
            candle(115.0, 116.0, 105.0, 106.0), // bearish mother
            candle(107.0, 110.0, 106.0, 109.0), // inside 1
            candle(109.0, 112.0, 108.0, 111.5), // inside 2, closes above midpoint
        ];
        let m = detect_multi(&candles, 5).expect("inside bar");
        assert_eq!(m.kind, PatternKind::BullishInsideBar);
        assert_eq!(m.stop, 105.0);
        assert_eq!(m.window_len, 5);
    }

    #[test]
    fn test_inside_bar_needs_midpoint_break() {
        let candles = vec![
            candle(120.0, 121.0, 117.0, 118.0),
            candle(118.0, 118.5, 114.0, 115.0),
            candle(115.0, 116.0, 105.0, 106.0),
            candle(107.0, 109.0, 106.0, 106.5), // stays below midpoint (110.5)
        ];
        assert!(detect_multi(&candles, 5).is_none());
    }
}
