//! Oracle module - market data intake
//!
//! Trade streams and historical klines come in through `sources`; the
//! `TickAggregator` turns them into finalized multi-timeframe candles.

mod candles;
mod ring;
pub mod sources;

pub use candles::{AggregatorConfig, CandleEvent, CandleListener, TickAggregator};
pub use ring::RingBuffer;
