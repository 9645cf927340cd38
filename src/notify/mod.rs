//! Operator notifications
//!
//! Fire-and-forget: a notifier never blocks the trading path and never
//! returns an error to it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::execution::AccountSummary;
use crate::types::{ClosedTrade, Side};

#[derive(Debug, Clone)]
pub enum Notification {
    Fill {
        symbol: String,
        side: Side,
        size: f64,
        price: f64,
        paper: bool,
    },
    Rejected {
        symbol: String,
        side: Side,
        reason: String,
    },
    Closed(ClosedTrade),
    Status(AccountSummary),
    Error(String),
    Info(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Fill {
                symbol,
                side,
                size,
                price,
                paper,
            } => write!(
                f,
                "{}{} {} {:.6} @ {:.2}",
                if *paper { "[PAPER] " } else { "" },
                side,
                symbol,
                size,
                price
            ),
            Notification::Rejected {
                symbol,
                side,
                reason,
            } => write!(f, "REJECTED {} {}: {}", side, symbol, reason),
            Notification::Closed(t) => write!(
                f,
                "CLOSED {} {} {:.6} {:.2} -> {:.2} ({}) pnl {:+.2}",
                t.side, t.symbol, t.size, t.entry_price, t.exit_price, t.exit_reason, t.pnl
            ),
            Notification::Status(s) => write!(f, "STATUS {}", s),
            Notification::Error(msg) => write!(f, "ERROR {}", msg),
            Notification::Info(msg) => write!(f, "{}", msg),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::Error(_) => error!("🚨 {}", notification),
            Notification::Rejected { .. } => warn!("⛔ {}", notification),
            Notification::Closed(t) if t.is_win() => info!("💰 {}", notification),
            Notification::Closed(_) => info!("📉 {}", notification),
            Notification::Fill { .. } => info!("✅ {}", notification),
            Notification::Status(_) => info!("📊 {}", notification),
            Notification::Info(_) => info!("ℹ️ {}", notification),
        }
    }
}

/// Forwards into a bounded channel; drops when the consumer falls behind
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
    dropped: AtomicU64,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.try_send(notification).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 100 == 0 {
                warn!(dropped = n, "Notification channel full or closed, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_drops_when_full() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notifier.notify(Notification::Info("one".into()));
        notifier.notify(Notification::Info("two".into()));
        assert_eq!(notifier.dropped(), 1);
        match rx.try_recv() {
            Ok(Notification::Info(msg)) => assert_eq!(msg, "one"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fill_display() {
        let n = Notification::Fill {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            size: 0.5,
            price: 50_000.0,
            paper: true,
        };
        assert_eq!(n.to_string(), "[PAPER] BUY BTCUSDT 0.500000 @ 50000.00");
    }
}
