//! Risk controls
//!
//! Implements:
//! - Hard limits checked before every entry order
//! - Rolling 24h realized-loss window
//! - Adaptive stop-loss / take-profit sizing (`sizer`)

pub mod sizer;

pub use sizer::{AdaptiveRiskSizer, SizerConfig, SizingRequest, StopTarget};

use serde::{Deserialize, Serialize};

use crate::error::RiskRejection;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Capital the engine started with; daily loss is measured against it
    pub initial_capital: f64,
    /// Maximum notional per order as a fraction of current capital
    pub max_position_fraction: f64,
    /// Maximum realized loss per 24h window as a fraction of initial capital
    pub max_daily_loss_fraction: f64,
    /// Maximum peak-to-current equity decline
    pub max_drawdown_fraction: f64,
    pub max_concurrent_positions: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            max_position_fraction: 0.25,   // 25% of capital per order
            max_daily_loss_fraction: 0.05, // stop after losing 5% in a day
            max_drawdown_fraction: 0.15,   // 15% off the equity peak
            max_concurrent_positions: 3,
        }
    }
}

/// Account figures the limits are evaluated against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskSnapshot {
    pub open_positions: usize,
    pub daily_pnl: f64,
    pub capital: f64,
    pub equity: f64,
    pub peak_equity: f64,
}

impl RiskLimits {
    /// Check an order of `notional` value. Limits are evaluated in a fixed
    /// order and the first breach is reported.
    pub fn check(&self, snap: &RiskSnapshot, notional: f64) -> Result<(), RiskRejection> {
        if snap.open_positions >= self.max_concurrent_positions {
            return Err(RiskRejection::MaxConcurrentPositions {
                open: snap.open_positions,
                max: self.max_concurrent_positions,
            });
        }

        let daily_limit = self.max_daily_loss_fraction * self.initial_capital;
        if snap.daily_pnl <= -daily_limit {
            return Err(RiskRejection::DailyLossLimit {
                pnl: snap.daily_pnl,
                limit: daily_limit,
            });
        }

        if snap.peak_equity > 0.0 {
            let drawdown = (snap.peak_equity - snap.equity) / snap.peak_equity;
            if drawdown > self.max_drawdown_fraction {
                return Err(RiskRejection::MaxDrawdown {
                    drawdown,
                    max: self.max_drawdown_fraction,
                });
            }
        }

        let limit = snap.capital * self.max_position_fraction;
        if notional > limit {
            return Err(RiskRejection::PositionTooLarge { notional, limit });
        }

        Ok(())
    }
}

/// Realized PnL over a 24h window anchored at the first check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyLossWindow {
    start_ms: Option<i64>,
    realized: f64,
}

impl DailyLossWindow {
    /// Start the window on first use and reset it once 24h have elapsed
    pub fn roll(&mut self, now_ms: i64) {
        match self.start_ms {
            None => self.start_ms = Some(now_ms),
            Some(start) if now_ms - start >= DAY_MS => {
                let days = (now_ms - start) / DAY_MS;
                self.start_ms = Some(start + days * DAY_MS);
                tracing::info!(
                    previous_pnl = self.realized,
                    "🔄 Daily loss window reset"
                );
                self.realized = 0.0;
            }
            Some(_) => {}
        }
    }

    pub fn record(&mut self, pnl: f64, now_ms: i64) {
        self.roll(now_ms);
        self.realized += pnl;
    }

    pub fn pnl(&self) -> f64 {
        self.realized
    }

    pub fn started_at(&self) -> Option<i64> {
        self.start_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> RiskSnapshot {
        RiskSnapshot {
            open_positions: 0,
            daily_pnl: 0.0,
            capital: 10_000.0,
            equity: 10_000.0,
            peak_equity: 10_000.0,
        }
    }

    #[test]
    fn test_allows_within_limits() {
        let limits = RiskLimits::default();
        assert!(limits.check(&healthy(), 2_500.0).is_ok());
    }

    #[test]
    fn test_reports_first_breach_only() {
        let limits = RiskLimits::default();
        let snap = RiskSnapshot {
            open_positions: 3,
            daily_pnl: -1_000.0,
            equity: 5_000.0,
            ..healthy()
        };
        assert!(matches!(
            limits.check(&snap, 1e9),
            Err(RiskRejection::MaxConcurrentPositions { open: 3, max: 3 })
        ));

        let snap = RiskSnapshot {
            open_positions: 0,
            ..snap
        };
        assert!(matches!(
            limits.check(&snap, 1e9),
            Err(RiskRejection::DailyLossLimit { .. })
        ));
    }

    #[test]
    fn test_daily_limit_is_inclusive() {
        let limits = RiskLimits::default();
        let snap = RiskSnapshot {
            daily_pnl: -500.0,
            ..healthy()
        };
        assert!(matches!(
            limits.check(&snap, 1.0),
            Err(RiskRejection::DailyLossLimit { .. })
        ));
        let snap = RiskSnapshot {
            daily_pnl: -499.99,
            ..healthy()
        };
        assert!(limits.check(&snap, 1.0).is_ok());
    }

    #[test]
    fn test_drawdown_and_size() {
        let limits = RiskLimits::default();
        let snap = RiskSnapshot {
            equity: 8_400.0,
            ..healthy()
        };
        assert!(matches!(
            limits.check(&snap, 1.0),
            Err(RiskRejection::MaxDrawdown { .. })
        ));
        assert!(matches!(
            limits.check(&healthy(), 2_500.01),
            Err(RiskRejection::PositionTooLarge { .. })
        ));
    }

    #[test]
    fn test_daily_window_resets_after_a_day() {
        let mut window = DailyLossWindow::default();
        window.record(-100.0, 1_000);
        window.roll(1_000 + DAY_MS - 1);
        assert_eq!(window.pnl(), -100.0);

        window.roll(1_000 + DAY_MS);
        assert_eq!(window.pnl(), 0.0);
        assert_eq!(window.started_at(), Some(1_000 + DAY_MS));

        window.roll(1_000 + 3 * DAY_MS + 5);
        assert_eq!(window.started_at(), Some(1_000 + 3 * DAY_MS));
    }
}
