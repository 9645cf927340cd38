//! Core types used throughout FusionBot
//!
//! Defines ticks, candles, timeframes, directions and signals shared by the
//! aggregation, estimation, fusion and execution layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Candle bucket duration, stored in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe(u64);

impl Timeframe {
    pub const M1: Timeframe = Timeframe(60);
    pub const M5: Timeframe = Timeframe(5 * 60);
    pub const M15: Timeframe = Timeframe(15 * 60);
    pub const H1: Timeframe = Timeframe(60 * 60);
    pub const H4: Timeframe = Timeframe(4 * 60 * 60);
    pub const D1: Timeframe = Timeframe(24 * 60 * 60);

    /// Build a timeframe from a duration in seconds. Zero is not a timeframe,
    /// nor is anything whose millisecond length overflows an `i64`.
    pub fn from_secs(secs: u64) -> Option<Self> {
        (secs > 0 && secs <= i64::MAX as u64 / 1000).then_some(Timeframe(secs))
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn duration_ms(&self) -> i64 {
        self.0 as i64 * 1000
    }

    /// Start of the bucket containing `ts_ms`.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        let d = self.duration_ms();
        ts_ms.div_euclid(d) * d
    }

    /// Parse "30s", "1m", "15m", "1h", "4h", "1d" (and bare seconds)
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let unit_at = s.len() - s.chars().last()?.len_utf8();
        let (num, unit) = s.split_at(unit_at);
        let mult = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => return s.parse::<u64>().ok().and_then(Self::from_secs),
        };
        num.parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(mult))
            .and_then(Self::from_secs)
    }

    /// Interval name for Binance kline endpoints
    pub fn binance_interval(&self) -> Option<&'static str> {
        match self.0 {
            60 => Some("1m"),
            180 => Some("3m"),
            300 => Some("5m"),
            900 => Some("15m"),
            1800 => Some("30m"),
            3600 => Some("1h"),
            7200 => Some("2h"),
            14400 => Some("4h"),
            86400 => Some("1d"),
            _ => None,
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::M5
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s % 86400 == 0 {
            write!(f, "{}d", s / 86400)
        } else if s % 3600 == 0 {
            write!(f, "{}h", s / 3600)
        } else if s % 60 == 0 {
            write!(f, "{}m", s / 60)
        } else {
            write!(f, "{}s", s)
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::from_str(&value).ok_or_else(|| format!("invalid timeframe: {}", value))
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for a long exposure, -1 for a short one
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional opinion of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    Long,
    Short,
    #[default]
    Neutral,
}

impl Direction {
    /// Signed unit used in weighted sums. Neutral contributes nothing.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    /// Direction of `value` when its magnitude clears `deadband`
    pub fn from_value(value: f64, deadband: f64) -> Direction {
        if !value.is_finite() || value.abs() < deadband {
            Direction::Neutral
        } else if value > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        }
    }

    /// Entry side for this direction
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Buy),
            Direction::Short => Some(Side::Sell),
            Direction::Neutral => None,
        }
    }

    pub fn is_neutral(&self) -> bool {
        matches!(self, Direction::Neutral)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Market regime as classified by the state estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    Volatile,
    #[default]
    Stable,
    MeanReverting,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Trending => write!(f, "trending"),
            Regime::Volatile => write!(f, "volatile"),
            Regime::Stable => write!(f, "stable"),
            Regime::MeanReverting => write!(f, "mean_reverting"),
        }
    }
}

/// One value per regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeValues {
    pub trending: f64,
    pub volatile: f64,
    pub stable: f64,
    pub mean_reverting: f64,
}

impl RegimeValues {
    pub fn get(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Trending => self.trending,
            Regime::Volatile => self.volatile,
            Regime::Stable => self.stable,
            Regime::MeanReverting => self.mean_reverting,
        }
    }
}

/// A single trade print
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Exchange timestamp in milliseconds
    pub ts: i64,
    pub price: f64,
    pub quantity: f64,
}

impl Tick {
    pub fn new(ts: i64, price: f64, quantity: f64) -> Self {
        Self { ts, price, quantity }
    }
}

/// Trade print as delivered by a market-data source
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub symbol: String,
    pub ts: i64,
    pub price: f64,
    pub quantity: f64,
    /// Aggressor side
    pub side: Side,
}

impl TradeTick {
    pub fn tick(&self) -> Tick {
        Tick::new(self.ts, self.price, self.quantity)
    }
}

/// OHLCV candle keyed by its bucket start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start in milliseconds
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn from_tick(bucket: i64, tick: &Tick) -> Self {
        Self {
            ts: bucket,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
        }
    }

    /// Zero-volume candle at a constant price, used to fill gaps
    pub fn flat(ts: i64, price: f64) -> Self {
        Self {
            ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }

    pub fn apply_tick(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.quantity;
    }

    /// Fold a later, finer candle into this one
    pub fn absorb(&mut self, later: &Candle) {
        self.high = self.high.max(later.high);
        self.low = self.low.min(later.low);
        self.close = later.close;
        self.volume += later.volume;
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Output of one signal source for one timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// 0.0 to 1.0
    pub strength: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub timeframe: Timeframe,
    pub source: String,
    pub ts: i64,
}

impl Signal {
    /// Build a signal, clamping strength and confidence into [0, 1]
    pub fn new(
        direction: Direction,
        strength: f64,
        confidence: f64,
        timeframe: Timeframe,
        source: impl Into<String>,
        ts: i64,
    ) -> Self {
        Self {
            direction,
            strength: clamp_unit(strength),
            confidence: clamp_unit(confidence),
            timeframe,
            source: source.into(),
            ts,
        }
    }
}

/// Combined decision of the fusion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSignal {
    pub direction: Direction,
    /// Magnitude of the weighted directional sum
    pub strength: f64,
    pub confidence: f64,
    pub coherence: f64,
    pub signals: Vec<Signal>,
    pub position_size_fraction: f64,
    pub stop_loss_fraction: f64,
    pub regime: Regime,
    pub ts: i64,
}

impl FusedSignal {
    /// Result for an empty or unusable signal set
    pub fn neutral(regime: Regime, ts: i64) -> Self {
        Self {
            direction: Direction::Neutral,
            strength: 0.0,
            confidence: 0.0,
            coherence: 0.0,
            signals: Vec::new(),
            position_size_fraction: 0.0,
            stop_loss_fraction: 0.0,
            regime,
            ts,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !self.direction.is_neutral()
    }
}

/// Reason a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::Manual => write!(f, "MANUAL"),
            ExitReason::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    /// Last mark-to-market price
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_ts: i64,
    pub entry_commission: f64,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        self.side.sign() * (self.current_price - self.entry_price) * self.size
    }

    pub fn notional(&self) -> f64 {
        self.size * self.current_price
    }

    /// Exit triggered by a bar with the given extremes; the stop wins when
    /// both levels were touched.
    pub fn exit_trigger(&self, high: f64, low: f64) -> Option<ExitReason> {
        let (stop_hit, target_hit) = match self.side {
            Side::Buy => (low <= self.stop_loss, high >= self.take_profit),
            Side::Sell => (high >= self.stop_loss, low <= self.take_profit),
        };
        if stop_hit {
            Some(ExitReason::StopLoss)
        } else if target_hit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }
}

/// Position converted into a realized result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_ts: i64,
    pub exit_ts: i64,
    /// Net of both commissions
    pub pnl: f64,
    pub commission: f64,
    pub exit_reason: ExitReason,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

/// Source of wall-clock time in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used for replay and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ts_ms: i64) {
        self.now.store(ts_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parse_and_display() {
        assert_eq!(Timeframe::from_str("5m"), Some(Timeframe::M5));
        assert_eq!(Timeframe::from_str("1H"), Some(Timeframe::H1));
        assert_eq!(Timeframe::from_str("30s").map(|t| t.secs()), Some(30));
        assert_eq!(Timeframe::from_str("0m"), None);
        assert_eq!(Timeframe::from_str("abc"), None);
        assert_eq!(Timeframe::from_str("307445734561825861m"), None);
        assert_eq!(Timeframe::from_str("99999999999999999999d"), None);
        assert_eq!(Timeframe::from_str("9223372036854776s"), None);
        assert_eq!(Timeframe::M15.to_string(), "15m");
        assert_eq!(Timeframe::D1.to_string(), "1d");
        assert!(Timeframe::M1 < Timeframe::M5);
    }

    #[test]
    fn test_bucket_start_alignment() {
        let tf = Timeframe::M5;
        assert_eq!(tf.bucket_start(0), 0);
        assert_eq!(tf.bucket_start(299_999), 0);
        assert_eq!(tf.bucket_start(300_000), 300_000);
        assert_eq!(tf.bucket_start(-1), -300_000);
    }

    #[test]
    fn test_direction_from_value() {
        assert_eq!(Direction::from_value(0.5, 0.1), Direction::Long);
        assert_eq!(Direction::from_value(-0.5, 0.1), Direction::Short);
        assert_eq!(Direction::from_value(0.05, 0.1), Direction::Neutral);
        assert_eq!(Direction::from_value(f64::NAN, 0.1), Direction::Neutral);
        assert_eq!(Direction::Long.side(), Some(Side::Buy));
        assert_eq!(Direction::Neutral.side(), None);
    }

    #[test]
    fn test_signal_clamps_inputs() {
        let s = Signal::new(Direction::Long, 1.7, -0.2, Timeframe::M5, "test", 0);
        assert_eq!(s.strength, 1.0);
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn test_candle_absorb() {
        let mut c = Candle::from_tick(0, &Tick::new(0, 100.0, 1.0));
        c.absorb(&Candle {
            ts: 60_000,
            open: 101.0,
            high: 105.0,
            low: 99.0,
            close: 102.0,
            volume: 2.0,
        });
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 99.0);
        assert_eq!(c.close, 102.0);
        assert_eq!(c.volume, 3.0);
        assert_eq!(c.ts, 0);
    }

    #[test]
    fn test_timeframe_serde_as_string() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let tf: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(tf, Timeframe::M15);
    }
}
