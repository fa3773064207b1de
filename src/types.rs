//! Core types used throughout BracketBot
//!
//! Defines common data structures for candles, signals, positions and the
//! structured client-order-id protocol that pairs bracket legs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Candle intervals the engine understands.
///
/// The engine aggregates its own 1m/5m/15m series; the larger intervals are
/// only queried through the exchange collaborator for higher-timeframe
/// confirmation and volume checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Interval {
    /// Interval length in milliseconds
    pub fn millis(&self) -> i64 {
        match self {
            Interval::Min1 => 60_000,
            Interval::Min5 => 300_000,
            Interval::Min15 => 900_000,
            Interval::Hour1 => 3_600_000,
            Interval::Hour4 => 14_400_000,
            Interval::Day1 => 86_400_000,
        }
    }

    /// Exchange string code (e.g. "5m")
    pub fn code(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
        }
    }

    /// Parse from exchange string code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Interval::Min1),
            "5m" => Some(Interval::Min5),
            "15m" => Some(Interval::Min15),
            "1h" => Some(Interval::Hour1),
            "4h" => Some(Interval::Hour4),
            "1d" => Some(Interval::Day1),
            _ => None,
        }
    }

    /// Start of the interval bucket containing `ts` (millis)
    pub fn bucket_start(&self, ts: i64) -> i64 {
        (ts / self.millis()) * self.millis()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Order side as the exchange sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Position side for hedge-mode bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side used to open the position
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Side used to close or protect the position
    pub fn exit_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }

    /// +1 for long, -1 for short (direction-aware arithmetic)
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Instrument symbol (e.g. "BTCUSDT")
    pub symbol: String,
    /// Series interval
    pub interval: Interval,
    /// Open time (start of period, millis)
    pub start_time: i64,
    /// Close time (end of period, millis)
    pub end_time: i64,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
    /// Volume in quote currency
    pub quote_volume: f64,
    /// Number of trades
    pub trade_count: u64,
    /// Whether this candle is sealed (immutable once true)
    pub is_final: bool,
}

impl Candle {
    /// Range of the candle relative to its low, used by the volatility gate
    pub fn range_pct(&self) -> f64 {
        if self.low <= 0.0 {
            return 0.0;
        }
        (self.high - self.low) / self.low
    }

    /// True if the candle closed above its open
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// True if the candle closed below its open
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Absolute body size
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Wick above the body
    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    /// Wick below the body
    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }
}

/// Candlestick reversal patterns the engine detects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    Hammer,
    InverseHammer,
    BullishSpinningTop,
    BearishSpinningTop,
    BullishEngulfing,
    BearishEngulfing,
    BullishHarami,
    BearishHarami,
    BullishInsideBar,
    BearishInsideBar,
}

/// Pattern family, ignoring direction. Higher-timeframe confirmation requires
/// the same family and the same direction on a larger interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternFamily {
    Hammer,
    InverseHammer,
    SpinningTop,
    Engulfing,
    Harami,
    InsideBar,
}

impl PatternKind {
    pub fn family(&self) -> PatternFamily {
        match self {
            PatternKind::Hammer => PatternFamily::Hammer,
            PatternKind::InverseHammer => PatternFamily::InverseHammer,
            PatternKind::BullishSpinningTop | PatternKind::BearishSpinningTop => {
                PatternFamily::SpinningTop
            }
            PatternKind::BullishEngulfing | PatternKind::BearishEngulfing => {
                PatternFamily::Engulfing
            }
            PatternKind::BullishHarami | PatternKind::BearishHarami => PatternFamily::Harami,
            PatternKind::BullishInsideBar | PatternKind::BearishInsideBar => {
                PatternFamily::InsideBar
            }
        }
    }

    /// Direction the pattern trades in
    pub fn position_side(&self) -> PositionSide {
        match self {
            PatternKind::Hammer
            | PatternKind::BullishSpinningTop
            | PatternKind::BullishEngulfing
            | PatternKind::BullishHarami
            | PatternKind::BullishInsideBar => PositionSide::Long,
            PatternKind::InverseHammer
            | PatternKind::BearishSpinningTop
            | PatternKind::BearishEngulfing
            | PatternKind::BearishHarami
            | PatternKind::BearishInsideBar => PositionSide::Short,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trading signal produced by the pattern engine.
///
/// Ephemeral: produced and consumed within one evaluation pass, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: PositionSide,
    pub pattern: PatternKind,
    pub stop_price: f64,
    pub target_price: f64,
    pub source_interval: Interval,
    /// Higher timeframe that confirmed the pattern, if any
    pub confirming_interval: Option<Interval>,
}

/// An open position as the engine books it.
///
/// Always a cache of exchange truth, possibly stale until reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub allocated_margin: f64,
    pub entry_time: i64,
    /// Absent when the position was adopted from exchange state at startup
    pub pattern: Option<PatternKind>,
}

/// Internal view of a protective (stop or target) order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub symbol: String,
    pub side: Side,
    pub kind: ProtectiveKind,
    pub trigger_price: f64,
    pub quantity: f64,
    pub position_side: PositionSide,
    pub client_id: ClientOrderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectiveKind {
    Stop,
    Target,
}

/// Tag portion of a structured client order id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderTag {
    /// Market entry (`en`)
    Entry,
    /// Stop-loss leg (`sl`)
    Stop,
    /// Take-profit leg (`tp`)
    Target,
    /// Cleanup cancellation (`co`)
    Cleanup,
    /// Close-position market order (`cp`)
    ClosePosition,
}

impl OrderTag {
    pub fn code(&self) -> &'static str {
        match self {
            OrderTag::Entry => "en",
            OrderTag::Stop => "sl",
            OrderTag::Target => "tp",
            OrderTag::Cleanup => "co",
            OrderTag::ClosePosition => "cp",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "en" => Some(OrderTag::Entry),
            "sl" => Some(OrderTag::Stop),
            "tp" => Some(OrderTag::Target),
            "co" => Some(OrderTag::Cleanup),
            "cp" => Some(OrderTag::ClosePosition),
            _ => None,
        }
    }
}

/// Structured client order id: `<prefix>_<tag>-<rootId>`.
///
/// The root id is shared by the stop/target pair created together and is the
/// sole mechanism for pairing legs and for telling engine-owned orders apart
/// from foreign ones. The wire format is kept for exchange compatibility;
/// everything internal operates on this decoded form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId {
    pub tag: OrderTag,
    pub root_id: String,
}

impl ClientOrderId {
    pub fn new(tag: OrderTag, root_id: impl Into<String>) -> Self {
        Self {
            tag,
            root_id: root_id.into(),
        }
    }

    /// Generate a fresh root id shared by a bracket pair.
    ///
    /// Kept short so the encoded id stays under exchange client-id limits.
    pub fn new_root_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..20].to_string()
    }

    /// Encode to the wire format under the given engine prefix
    pub fn encode(&self, prefix: &str) -> String {
        format!("{}_{}-{}", prefix, self.tag.code(), self.root_id)
    }

    /// Decode from the wire format. Returns `None` for foreign order ids.
    pub fn parse(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix('_')?;
        let (tag, root_id) = rest.split_once('-')?;
        let tag = OrderTag::from_code(tag)?;
        if root_id.is_empty() {
            return None;
        }
        Some(Self {
            tag,
            root_id: root_id.to_string(),
        })
    }
}

/// Why a bracket closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Flattened,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::Flattened => write!(f, "FLATTENED"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// One record per completed bracket, handed to the persistence collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub pnl: f64,
    /// Absent for exposure adopted after a restart or flattened by
    /// reconciliation
    pub pattern: Option<PatternKind>,
    pub entry_time: i64,
    pub exit_time: i64,
    pub reason: ExitReason,
}
