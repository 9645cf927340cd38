//! Strategy layer
//!
//! Signal sources turn candle windows into directional opinions, the fusion
//! engine combines them across timeframes, and `indicators` supplies the
//! volatility measure used for stop sizing.

pub mod fusion;
pub mod indicators;
pub mod strategy_trait;

pub use fusion::{FusionConfig, FusionStats, SignalFusionEngine};
pub use indicators::{atr, atr_fraction};
pub use strategy_trait::{MomentumSource, SignalSource};
