//! Admission Control - daily entry caps, resting suspension, burst override
//!
//! Per-account counters reset at a configurable day boundary (offset from
//! UTC midnight, not midnight itself). All state is owned by the account
//! engine; nothing here touches the exchange.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::AdmissionConfig;
use crate::types::PositionSide;

/// Why an entry was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionBlock {
    Resting,
    DailyCap,
    SymbolCap,
    Spacing,
}

/// Why a burst activation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstBlock {
    ActivationCap,
    Cooldown,
}

/// Permission to place one entry. Hand it back via `record_entry` after the
/// entry succeeds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPermit {
    uses_burst: bool,
}

/// Per-account admission state
pub struct AdmissionControl {
    cfg: AdmissionConfig,
    day_key: String,
    daily_entries: usize,
    per_symbol_side: HashMap<(String, PositionSide), usize>,
    last_entry_ts: i64,
    resting_until: Option<i64>,
    burst_remaining: usize,
    burst_activations_today: usize,
    last_burst_activation: i64,
}

impl AdmissionControl {
    pub fn new(cfg: AdmissionConfig, now_ms: i64) -> Self {
        let day_key = Self::day_key_for(&cfg, now_ms);
        Self {
            cfg,
            day_key,
            daily_entries: 0,
            per_symbol_side: HashMap::new(),
            last_entry_ts: 0,
            resting_until: None,
            burst_remaining: 0,
            burst_activations_today: 0,
            last_burst_activation: 0,
        }
    }

    fn day_key_for(cfg: &AdmissionConfig, now_ms: i64) -> String {
        let dt: DateTime<Utc> = DateTime::from_timestamp_millis(now_ms)
            .unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap_or_default());
        let shifted = dt - Duration::hours(cfg.day_boundary_offset_hours);
        shifted.format("%Y-%m-%d").to_string()
    }

    /// Reset daily counters on first access after the boundary crossed
    fn roll_day(&mut self, now_ms: i64) {
        let key = Self::day_key_for(&self.cfg, now_ms);
        if key != self.day_key {
            self.day_key = key;
            self.daily_entries = 0;
            self.per_symbol_side.clear();
            self.burst_activations_today = 0;
        }
    }

    /// Check whether a new entry is admissible right now
    pub fn check_entry(
        &mut self,
        symbol: &str,
        side: PositionSide,
        now_ms: i64,
    ) -> Result<EntryPermit, AdmissionBlock> {
        self.roll_day(now_ms);

        if let Some(until) = self.resting_until {
            if now_ms < until {
                return Err(AdmissionBlock::Resting);
            }
            // Resting window self-expires on next check
            self.resting_until = None;
        }

        if self.daily_entries >= self.cfg.max_entries_per_day {
            return Err(AdmissionBlock::DailyCap);
        }

        let symbol_count = self
            .per_symbol_side
            .get(&(symbol.to_string(), side))
            .copied()
            .unwrap_or(0);
        if symbol_count >= self.cfg.max_entries_per_symbol_side {
            return Err(AdmissionBlock::SymbolCap);
        }

        let spacing_ok = self.last_entry_ts == 0
            || now_ms - self.last_entry_ts >= self.cfg.min_entry_spacing_secs * 1000;
        if spacing_ok {
            return Ok(EntryPermit { uses_burst: false });
        }
        if self.burst_remaining > 0 {
            return Ok(EntryPermit { uses_burst: true });
        }
        Err(AdmissionBlock::Spacing)
    }

    /// Record a successful entry against the counters
    pub fn record_entry(
        &mut self,
        permit: EntryPermit,
        symbol: &str,
        side: PositionSide,
        now_ms: i64,
    ) {
        self.roll_day(now_ms);
        self.daily_entries += 1;
        *self
            .per_symbol_side
            .entry((symbol.to_string(), side))
            .or_insert(0) += 1;
        self.last_entry_ts = now_ms;
        if permit.uses_burst {
            self.burst_remaining = self.burst_remaining.saturating_sub(1);
        }
    }

    /// Suspend all entries until the given timestamp
    pub fn set_resting(&mut self, until_ms: i64) {
        self.resting_until = Some(until_ms);
    }

    pub fn is_resting(&self, now_ms: i64) -> bool {
        matches!(self.resting_until, Some(until) if now_ms < until)
    }

    /// Grant a batch of spacing-exempt entries. Capped per day and rate
    /// limited by a cooldown between activations.
    pub fn activate_burst(&mut self, now_ms: i64) -> Result<usize, BurstBlock> {
        self.roll_day(now_ms);

        if self.burst_activations_today >= self.cfg.burst_max_activations_per_day {
            return Err(BurstBlock::ActivationCap);
        }
        if self.last_burst_activation != 0
            && now_ms - self.last_burst_activation < self.cfg.burst_cooldown_secs * 1000
        {
            return Err(BurstBlock::Cooldown);
        }

        self.burst_activations_today += 1;
        self.last_burst_activation = now_ms;
        self.burst_remaining = self.cfg.burst_entries;
        Ok(self.burst_remaining)
    }

    pub fn daily_entries(&self) -> usize {
        self.daily_entries
    }
}
