//! Market-data sources (live Binance stream, historical klines, replay)

mod binance;
mod replay;

pub use binance::{
    parse_klines, parse_trade_message, BinanceClient, BinanceHistory, BINANCE_REST_URL,
    BINANCE_WS_URL,
};
pub use replay::ReplaySource;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::error::SourceError;
use crate::types::{Candle, Timeframe, TradeTick};

/// Push-based trade stream.
///
/// `connect` runs one session and returns when it ends. The caller owns
/// reconnection and must call `subscribe` again before every `connect`.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Set the symbols streamed by the next session
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), SourceError>;

    /// Stream events into `tx` until the session ends.
    ///
    /// A remote drop is reported as `SourceError::ConnectionLost`. `Ok(())`
    /// means the stream was exhausted or the receiver went away.
    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<(), SourceError>;

    /// Disconnect from the source
    async fn disconnect(&mut self) -> Result<(), SourceError>;

    /// Check if connected
    fn is_connected(&self) -> bool;
}

/// Ordered historical candles used to warm up buffers at startup
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Events from tick sources
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// New trade received
    Trade(TradeTick),
    /// Connection status changed
    Connected(String),
    Disconnected(String),
    /// Error occurred (source, message)
    Error(String, String),
}
