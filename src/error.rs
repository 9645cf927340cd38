//! Error taxonomy
//!
//! Each concern gets its own enum. Only a corrupted or unreadable state file
//! at startup is fatal; everything else is recovered where it happens.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Timeframe;

/// Malformed tick or order input. Dropped and logged, never propagated past
/// the component that detected it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
    #[error("late tick at {ts}: bucket {bucket} already finalized")]
    LateTick { ts: i64, bucket: i64 },
    #[error("invalid order size {0}")]
    InvalidSize(f64),
    #[error("stop {stop} / target {target} on wrong side of entry {entry}")]
    InvalidBracket { entry: f64, stop: f64, target: f64 },
    #[error("timeframe {0} is not configured")]
    UnknownTimeframe(Timeframe),
}

/// Why the risk gate refused an order. Exactly one reason per rejection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("max concurrent positions reached ({open}/{max})")]
    MaxConcurrentPositions { open: usize, max: usize },
    #[error("daily loss limit hit: pnl {pnl:.2} <= -{limit:.2}")]
    DailyLossLimit { pnl: f64, limit: f64 },
    #[error("max drawdown exceeded: {:.2}% > {:.2}%", .drawdown * 100.0, .max * 100.0)]
    MaxDrawdown { drawdown: f64, max: f64 },
    #[error("position too large: notional {notional:.2} > limit {limit:.2}")]
    PositionTooLarge { notional: f64, limit: f64 },
}

impl RiskRejection {
    /// Stable short code for journals and alerts
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::MaxConcurrentPositions { .. } => "MAX_CONCURRENT",
            RiskRejection::DailyLossLimit { .. } => "DAILY_LOSS",
            RiskRejection::MaxDrawdown { .. } => "MAX_DRAWDOWN",
            RiskRejection::PositionTooLarge { .. } => "POSITION_TOO_LARGE",
        }
    }
}

/// Not enough history for the estimator to say anything.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("estimator degenerate: {updates}/{required} warm-up measurements")]
pub struct EstimationDegenerate {
    pub updates: usize,
    pub required: usize,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exchange rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed exchange response: {0}")]
    Malformed(String),
    #[error("live trading requires api credentials")]
    MissingCredentials,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("risk rejected: {0}")]
    RiskRejected(#[from] RiskRejection),
    #[error("exchange rejected: {0}")]
    ExchangeRejected(String),
    #[error("order timed out after {0} ms")]
    Timeout(u64),
    #[error("position not found: {0}")]
    PositionNotFound(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("order {0} is no longer pending")]
    NotPending(String),
}

impl From<ExchangeError> for ExecutionError {
    fn from(e: ExchangeError) -> Self {
        ExecutionError::ExchangeRejected(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupted state file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },
    #[error("unsupported state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trade journal error: {0}")]
    Journal(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection lost to {venue}: {reason}")]
    ConnectionLost { venue: String, reason: String },
    #[error("no symbols subscribed on {0}")]
    NoSubscriptions(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_rejection_messages() {
        let r = RiskRejection::MaxDrawdown {
            drawdown: 0.2,
            max: 0.15,
        };
        assert_eq!(r.to_string(), "max drawdown exceeded: 20.00% > 15.00%");
        assert_eq!(r.code(), "MAX_DRAWDOWN");

        let e: ExecutionError = RiskRejection::MaxConcurrentPositions { open: 3, max: 3 }.into();
        assert!(e.to_string().contains("3/3"));
    }
}
