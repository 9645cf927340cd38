//! FusionBot Library
//!
//! Multi-timeframe signal-fusion trading engine for Binance spot

pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod execution;
pub mod notify;
pub mod oracle;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod types;
