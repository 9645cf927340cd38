//! Binance spot market data
//!
//! `BinanceClient` streams raw trades over the combined WebSocket endpoint.
//! `BinanceHistory` fetches klines over REST for the startup bootstrap.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::SourceError;
use crate::oracle::sources::{HistoricalSource, SourceEvent, TickSource};
use crate::types::{Candle, Side, Timeframe, TradeTick};

pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";
pub const BINANCE_REST_URL: &str = "https://api.binance.com";

#[derive(Debug, Clone)]
pub struct BinanceClient {
    ws_url: String,
    connected: bool,
    subscriptions: Vec<String>,
}

impl BinanceClient {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            connected: false,
            subscriptions: Vec::new(),
        }
    }

    fn build_stream_url(&self) -> String {
        let streams: Vec<String> = self
            .subscriptions
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect();
        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    fn lost(reason: impl ToString) -> SourceError {
        SourceError::ConnectionLost {
            venue: "Binance".to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new(BINANCE_WS_URL)
    }
}

#[async_trait]
impl TickSource for BinanceClient {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), SourceError> {
        self.subscriptions = symbols.to_vec();
        Ok(())
    }

    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<(), SourceError> {
        if self.subscriptions.is_empty() {
            return Err(SourceError::NoSubscriptions("Binance".to_string()));
        }

        let url = self.build_stream_url();
        tracing::info!(
            source = %"Binance",
            url = %url.split('?').next().unwrap_or(url.as_str()),
            streams = self.subscriptions.len(),
            "Connecting to Binance WebSocket..."
        );

        let (ws_stream, _) = connect_async(&url).await.map_err(Self::lost)?;
        let (mut write, mut read) = ws_stream.split();
        self.connected = true;

        if tx
            .send(SourceEvent::Connected("Binance".to_string()))
            .await
            .is_err()
        {
            self.connected = false;
            return Ok(());
        }
        tracing::info!(source = %"Binance", "✅ Connected to Binance WebSocket");

        let outcome = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match parse_trade_message(&text) {
                    Ok(Some(trade)) => {
                        if tx.send(SourceEvent::Trade(trade)).await.is_err() {
                            break Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(source = %"Binance", error = %e, "Failed to parse message");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::warn!(source = %"Binance", "Connection closed by server");
                    break Err(Self::lost("closed by server"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(source = %"Binance", error = %e, "WebSocket error");
                    let _ = tx
                        .send(SourceEvent::Error("Binance".to_string(), e.to_string()))
                        .await;
                    break Err(Self::lost(e));
                }
                None => {
                    tracing::warn!(source = %"Binance", "Stream ended");
                    break Err(Self::lost("stream ended"));
                }
            }
        };

        self.connected = false;
        let _ = tx
            .send(SourceEvent::Disconnected("Binance".to_string()))
            .await;
        outcome
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Parse a combined-stream `@trade` message.
///
/// Returns `Ok(None)` for messages on other streams.
pub fn parse_trade_message(text: &str) -> Result<Option<TradeTick>> {
    // {"stream":"btcusdt@trade","data":{"s":"BTCUSDT","p":"...","q":"...","T":...,"m":true}}
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    let stream = wrapper["stream"]
        .as_str()
        .context("Missing stream name in message")?;
    if !stream.ends_with("@trade") {
        return Ok(None);
    }
    let data = &wrapper["data"];

    // Buyer is maker => the aggressor sold
    let side = if data["m"].as_bool().unwrap_or(false) {
        Side::Sell
    } else {
        Side::Buy
    };

    Ok(Some(TradeTick {
        symbol: data["s"].as_str().context("Missing symbol")?.to_string(),
        ts: data["T"].as_i64().context("Missing trade time")?,
        price: data["p"].as_str().context("Missing price")?.parse()?,
        quantity: data["q"].as_str().context("Missing quantity")?.parse()?,
        side,
    }))
}

/// Kline downloader for the startup bootstrap
#[derive(Debug, Clone)]
pub struct BinanceHistory {
    client: reqwest::Client,
    rest_url: String,
}

impl BinanceHistory {
    pub fn new(rest_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            rest_url: rest_url.into(),
        })
    }
}

#[async_trait]
impl HistoricalSource for BinanceHistory {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let interval = timeframe
            .binance_interval()
            .with_context(|| format!("Binance has no kline interval for {}", timeframe))?;
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.rest_url,
            symbol.to_uppercase(),
            interval,
            limit.min(1000)
        );

        tracing::info!(
            symbol = %symbol,
            timeframe = %timeframe,
            limit,
            "📥 Fetching historical candles from Binance..."
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch historical candles from Binance")?;

        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        let klines: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Binance klines response")?;
        let candles = parse_klines(&klines);

        tracing::info!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = candles.len(),
            "✅ Historical candles fetched"
        );

        Ok(candles)
    }
}

/// Convert kline rows `[open_time, open, high, low, close, volume, ...]`,
/// skipping malformed rows
pub fn parse_klines(klines: &[Vec<serde_json::Value>]) -> Vec<Candle> {
    klines
        .iter()
        .filter_map(|kline| {
            if kline.len() < 6 {
                return None;
            }
            Some(Candle {
                ts: kline[0].as_i64()?,
                open: kline[1].as_str()?.parse().ok()?,
                high: kline[2].as_str()?.parse().ok()?,
                low: kline[3].as_str()?.parse().ok()?,
                close: kline[4].as_str()?.parse().ok()?,
                volume: kline[5].as_str()?.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trade_message() {
        let msg = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000123,"s":"BTCUSDT","t":1,"p":"43000.50","q":"0.012","T":1700000000120,"m":true}}"#;
        let trade = parse_trade_message(msg).unwrap().unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.ts, 1700000000120);
        assert_eq!(trade.price, 43000.50);
        assert_eq!(trade.quantity, 0.012);
        assert_eq!(trade.side, Side::Sell);
    }

    #[test]
    fn test_parse_ignores_other_streams() {
        let msg = r#"{"stream":"btcusdt@bookTicker","data":{}}"#;
        assert!(parse_trade_message(msg).unwrap().is_none());
        assert!(parse_trade_message("not json").is_err());
    }

    #[test]
    fn test_parse_klines_skips_bad_rows() {
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(
            r#"[[1700000000000,"1.0","2.0","0.5","1.5","10.0",1700000059999],
                [1700000060000,"oops"]]"#,
        )
        .unwrap();
        let candles = parse_klines(&rows);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 2.0);
        assert_eq!(candles[0].volume, 10.0);
    }

    #[test]
    fn test_stream_url() {
        let mut client = BinanceClient::default();
        client.subscriptions = vec!["BTCUSDT".to_string()];
        assert_eq!(
            client.build_stream_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade"
        );
    }
}
