//! In-memory tick source that replays recorded trades

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

use crate::error::SourceError;
use crate::oracle::sources::{SourceEvent, TickSource};
use crate::types::TradeTick;

/// Replays a fixed list of trades, optionally dropping the connection after
/// the first `drop_after` trades of each session.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    trades: Vec<TradeTick>,
    cursor: usize,
    drop_after: Option<usize>,
    pace: Option<Duration>,
    subscriptions: Vec<String>,
    sessions: usize,
    connected: bool,
}

impl ReplaySource {
    pub fn new(trades: Vec<TradeTick>) -> Self {
        Self {
            trades,
            ..Default::default()
        }
    }

    /// Simulate a remote drop every `n` trades
    pub fn with_drop_after(mut self, n: usize) -> Self {
        self.drop_after = Some(n.max(1));
        self
    }

    /// Sleep between trades
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Number of sessions started so far
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }
}

#[async_trait]
impl TickSource for ReplaySource {
    fn name(&self) -> &'static str {
        "Replay"
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), SourceError> {
        self.subscriptions = symbols.to_vec();
        Ok(())
    }

    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<(), SourceError> {
        if self.subscriptions.is_empty() {
            return Err(SourceError::NoSubscriptions("Replay".to_string()));
        }
        self.sessions += 1;
        self.connected = true;
        let _ = tx.send(SourceEvent::Connected("Replay".to_string())).await;

        let mut sent = 0usize;
        while self.cursor < self.trades.len() {
            if self.drop_after.map_or(false, |n| sent >= n) {
                self.connected = false;
                let _ = tx.send(SourceEvent::Disconnected("Replay".to_string())).await;
                return Err(SourceError::ConnectionLost {
                    venue: "Replay".to_string(),
                    reason: "simulated drop".to_string(),
                });
            }
            let trade = self.trades[self.cursor].clone();
            if !self.subscriptions.iter().any(|s| s == &trade.symbol) {
                self.cursor += 1;
                continue;
            }
            if tx.send(SourceEvent::Trade(trade)).await.is_err() {
                break;
            }
            self.cursor += 1;
            sent += 1;
            if let Some(pace) = self.pace {
                tokio::time::sleep(pace).await;
            }
        }

        self.connected = false;
        let _ = tx.send(SourceEvent::Disconnected("Replay".to_string())).await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
