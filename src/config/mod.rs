//! Configuration management for BracketBot
//!
//! Loads from YAML/TOML files + environment variables via .env. Thresholds
//! that differed between historical variants of this engine (volatility
//! ranges, trailing multipliers, burst limits) are deliberately plain
//! configuration, not hidden business rules.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::Interval;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub patterns: PatternConfig,
    pub risk: RiskConfig,
    pub trailing: TrailingConfig,
    pub admission: AdmissionConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Engine prefix for structured client order ids
    pub client_id_prefix: String,
    /// Symbols to subscribe and trade
    pub symbols: Vec<String>,
    /// Leverage applied before entries
    pub leverage: u32,
    /// Scalping (tight trail steps) vs swing mode
    pub scalping_mode: bool,
    /// Candle history depth kept per (symbol, interval)
    pub candle_history: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternConfig {
    /// Volatility gate: max (high-low)/low per interval code
    pub max_range: HashMap<String, f64>,
    /// Historical gate lookback (bars) per interval code
    pub lookback: HashMap<String, usize>,
    /// Higher timeframes checked for pattern confirmation, in order
    pub confirmation_intervals: Vec<String>,
    /// Intervals checked for increasing volume, highest first
    pub volume_intervals: Vec<String>,
    /// Reward multiple applied to the stop distance for 3-candle patterns
    pub reward_multiple_single: f64,
    /// Reward multiple for engulfing/harami patterns
    pub reward_multiple_multi: f64,
    /// Reward multiple for the inside-bar family
    pub reward_multiple_inside: f64,
    /// Maximum inside candles bounded by a mother candle
    pub max_inside_bars: usize,
}

impl PatternConfig {
    /// Volatility threshold for an interval; absent entries reject nothing
    pub fn max_range_for(&self, interval: Interval) -> f64 {
        self.max_range
            .get(interval.code())
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    /// Historical-gate lookback for an interval
    pub fn lookback_for(&self, interval: Interval) -> usize {
        self.lookback.get(interval.code()).copied().unwrap_or(30)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Percent of balance risked per trade (0.4 means 0.4%)
    pub risk_percent: f64,
    /// Fill-confirmation polling attempts after a market entry
    pub fill_poll_attempts: usize,
    /// Backoff between polling attempts in milliseconds
    pub fill_poll_backoff_ms: u64,
}

/// One set of trailing multipliers.
///
/// Triggers advance from the attempt price; candidate stop/target advance
/// multiplicatively from the current levels.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrailProfile {
    /// Next trigger distance from the base price
    pub trigger_pct: f64,
    /// Candidate stop advance from the current stop
    pub stop_pct: f64,
    /// Candidate target advance from the current target
    pub target_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailingConfig {
    pub scalp_normal: TrailProfile,
    pub scalp_big: TrailProfile,
    pub swing_normal: TrailProfile,
    pub swing_big: TrailProfile,
}

impl TrailingConfig {
    pub fn normal(&self, scalping: bool) -> TrailProfile {
        if scalping {
            self.scalp_normal
        } else {
            self.swing_normal
        }
    }

    pub fn big(&self, scalping: bool) -> TrailProfile {
        if scalping {
            self.scalp_big
        } else {
            self.swing_big
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Daily entry cap per account
    pub max_entries_per_day: usize,
    /// Entry cap per (symbol, position side) per day
    pub max_entries_per_symbol_side: usize,
    /// Day boundary offset from UTC midnight, in hours
    pub day_boundary_offset_hours: i64,
    /// Minimum spacing between entries in seconds
    pub min_entry_spacing_secs: i64,
    /// Entries granted per burst activation
    pub burst_entries: usize,
    /// Burst activations allowed per day
    pub burst_max_activations_per_day: usize,
    /// Minimum cooldown between burst activations in seconds
    pub burst_cooldown_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Delay before a scheduled flatten runs, absorbing exchange-side
    /// cancellation propagation lag (milliseconds)
    pub flatten_delay_ms: u64,
    /// Minimum realized loss that triggers a margin top-up
    pub margin_topup_min: f64,
    /// Release timeout for margin top-up dedup keys (milliseconds)
    pub margin_dedup_timeout_ms: u64,
    /// Bounded size of the seen-event-id cache
    pub event_cache_size: usize,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Bot defaults
            .set_default("bot.client_id_prefix", "bb")?
            .set_default("bot.symbols", vec!["BTCUSDT", "ETHUSDT"])?
            .set_default("bot.leverage", 5)?
            .set_default("bot.scalping_mode", true)?
            .set_default("bot.candle_history", 500)?
            // Pattern defaults: volatility gate tightest on 1m, loosest on 1d
            .set_default("patterns.max_range.1m", 0.015)?
            .set_default("patterns.max_range.5m", 0.03)?
            .set_default("patterns.max_range.15m", 0.05)?
            .set_default("patterns.max_range.1h", 0.08)?
            .set_default("patterns.max_range.4h", 0.12)?
            .set_default("patterns.max_range.1d", 0.25)?
            .set_default("patterns.lookback.1m", 60)?
            .set_default("patterns.lookback.5m", 40)?
            .set_default("patterns.lookback.15m", 30)?
            .set_default("patterns.lookback.1h", 20)?
            .set_default("patterns.lookback.4h", 15)?
            .set_default("patterns.lookback.1d", 15)?
            .set_default("patterns.confirmation_intervals", vec!["15m", "1h", "4h"])?
            .set_default("patterns.volume_intervals", vec!["1d", "4h", "1h", "15m"])?
            .set_default("patterns.reward_multiple_single", 20.0)?
            .set_default("patterns.reward_multiple_multi", 10.0)?
            .set_default("patterns.reward_multiple_inside", 40.0)?
            .set_default("patterns.max_inside_bars", 5)?
            // Risk defaults
            .set_default("risk.risk_percent", 0.4)?
            .set_default("risk.fill_poll_attempts", 5)?
            .set_default("risk.fill_poll_backoff_ms", 400)?
            // Trailing defaults
            .set_default("trailing.scalp_normal.trigger_pct", 0.004)?
            .set_default("trailing.scalp_normal.stop_pct", 0.003)?
            .set_default("trailing.scalp_normal.target_pct", 0.003)?
            .set_default("trailing.scalp_big.trigger_pct", 0.012)?
            .set_default("trailing.scalp_big.stop_pct", 0.009)?
            .set_default("trailing.scalp_big.target_pct", 0.009)?
            .set_default("trailing.swing_normal.trigger_pct", 0.01)?
            .set_default("trailing.swing_normal.stop_pct", 0.008)?
            .set_default("trailing.swing_normal.target_pct", 0.008)?
            .set_default("trailing.swing_big.trigger_pct", 0.03)?
            .set_default("trailing.swing_big.stop_pct", 0.024)?
            .set_default("trailing.swing_big.target_pct", 0.024)?
            // Admission defaults
            .set_default("admission.max_entries_per_day", 10)?
            .set_default("admission.max_entries_per_symbol_side", 2)?
            .set_default("admission.day_boundary_offset_hours", 9)?
            .set_default("admission.min_entry_spacing_secs", 900)?
            .set_default("admission.burst_entries", 3)?
            .set_default("admission.burst_max_activations_per_day", 2)?
            .set_default("admission.burst_cooldown_secs", 3600)?
            // Reconcile defaults
            .set_default("reconcile.flatten_delay_ms", 4000)?
            .set_default("reconcile.margin_topup_min", 0.5)?
            .set_default("reconcile.margin_dedup_timeout_ms", 30000)?
            .set_default("reconcile.event_cache_size", 2048)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (BRACKETBOT_*)
            .add_source(Environment::with_prefix("BRACKETBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config for startup logging
    pub fn digest(&self) -> String {
        format!(
            "prefix={} symbols={:?} leverage={} scalping={} risk_pct={:.2}",
            self.bot.client_id_prefix,
            self.bot.symbols,
            self.bot.leverage,
            self.bot.scalping_mode,
            self.risk.risk_percent
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let cfg = AppConfig::load().expect("default config must load");
        assert_eq!(cfg.bot.client_id_prefix, "bb");
        assert!(cfg.patterns.max_range_for(Interval::Min1) < cfg.patterns.max_range_for(Interval::Day1));
        assert!(cfg.patterns.lookback_for(Interval::Min1) >= cfg.patterns.lookback_for(Interval::Day1));
        assert!(cfg.trailing.scalp_normal.trigger_pct < cfg.trailing.scalp_big.trigger_pct);
    }

    #[test]
    fn test_digest_mentions_prefix() {
        let cfg = AppConfig::load().unwrap();
        assert!(cfg.digest().contains("prefix=bb"));
    }
}
