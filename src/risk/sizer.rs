//! Adaptive stop-loss / take-profit sizing
//!
//! Stop distance tightens with confidence and calm regimes and widens in
//! volatile ones. Reward:risk scales with signal quality and recent win
//! rate. Targets near a structural extension of the recent swing snap to it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::types::{Candle, Regime, RegimeValues, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerConfig {
    pub base_stop_fraction: f64,
    pub min_stop_fraction: f64,
    pub max_stop_fraction: f64,
    pub stop_regime_factor: RegimeValues,
    /// Stop is never tighter than this multiple of the volatility measure
    pub volatility_floor_multiple: f64,
    pub base_reward_risk: RegimeValues,
    pub min_reward_risk: f64,
    pub max_reward_risk: f64,
    pub confidence_weight: f64,
    pub strength_weight: f64,
    pub coherence_weight: f64,
    pub win_rate_window: usize,
    /// Outcomes needed before win rate adjusts the ratio
    pub min_win_samples: usize,
    pub high_win_rate: f64,
    pub low_win_rate: f64,
    pub win_rate_boost: f64,
    pub win_rate_cut: f64,
    /// Relative distance within which a target snaps to a structure level
    pub snap_tolerance: f64,
    /// Extensions of the swing range beyond the swing extreme
    pub extension_levels: Vec<f64>,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            base_stop_fraction: 0.02,
            min_stop_fraction: 0.005,
            max_stop_fraction: 0.05,
            stop_regime_factor: RegimeValues {
                trending: 1.0,
                volatile: 1.5,
                stable: 0.8,
                mean_reverting: 1.0,
            },
            volatility_floor_multiple: 1.5,
            base_reward_risk: RegimeValues {
                trending: 2.5,
                volatile: 1.5,
                stable: 2.0,
                mean_reverting: 1.5,
            },
            min_reward_risk: 1.0,
            max_reward_risk: 4.0,
            confidence_weight: 0.4,
            strength_weight: 0.3,
            coherence_weight: 0.3,
            win_rate_window: 50,
            min_win_samples: 10,
            high_win_rate: 0.75,
            low_win_rate: 0.5,
            win_rate_boost: 1.2,
            win_rate_cut: 0.8,
            snap_tolerance: 0.002,
            extension_levels: vec![0.0, 0.272, 0.618, 1.0, 1.618],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizingRequest<'a> {
    pub entry: f64,
    pub side: Side,
    pub confidence: f64,
    pub strength: f64,
    pub coherence: f64,
    pub regime: Regime,
    /// Relative volatility (e.g. ATR / price)
    pub volatility: Option<f64>,
    /// Recent candles for swing structure
    pub swing_window: Option<&'a [Candle]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopTarget {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_fraction: f64,
    pub reward_risk: f64,
    /// Take-profit moved onto a swing extension
    pub snapped: bool,
}

pub struct AdaptiveRiskSizer {
    config: SizerConfig,
    outcomes: Mutex<VecDeque<bool>>,
}

impl AdaptiveRiskSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::with_capacity(config.win_rate_window.max(1))),
            config,
        }
    }

    pub fn compute(&self, req: &SizingRequest<'_>) -> StopTarget {
        let c = &self.config;
        let confidence = req.confidence.clamp(0.0, 1.0);

        let mut stop_fraction =
            c.base_stop_fraction * c.stop_regime_factor.get(req.regime) * (1.5 - confidence);
        if let Some(vol) = req.volatility.filter(|v| v.is_finite() && *v > 0.0) {
            stop_fraction = stop_fraction.max(c.volatility_floor_multiple * vol);
        }
        let stop_fraction = stop_fraction.clamp(c.min_stop_fraction, c.max_stop_fraction);

        let reward_risk = self.reward_risk(req);
        let target_fraction = stop_fraction * reward_risk;

        let sign = req.side.sign();
        let stop_loss = req.entry * (1.0 - sign * stop_fraction);
        let computed_target = req.entry * (1.0 + sign * target_fraction);

        let snapped_target = req
            .swing_window
            .and_then(|w| self.snap_target(req.entry, req.side, computed_target, w));

        StopTarget {
            stop_loss,
            take_profit: snapped_target.unwrap_or(computed_target),
            stop_fraction,
            reward_risk,
            snapped: snapped_target.is_some(),
        }
    }

    fn reward_risk(&self, req: &SizingRequest<'_>) -> f64 {
        let c = &self.config;
        let quality = c.confidence_weight * req.confidence.clamp(0.0, 1.0)
            + c.strength_weight * req.strength.clamp(0.0, 1.0)
            + c.coherence_weight * req.coherence.clamp(0.0, 1.0);
        let mut ratio = c.base_reward_risk.get(req.regime) * (0.75 + 0.5 * quality);

        if let Some(win_rate) = self.win_rate() {
            if win_rate > c.high_win_rate {
                ratio *= c.win_rate_boost;
            } else if win_rate < c.low_win_rate {
                ratio *= c.win_rate_cut;
            }
        }
        ratio.clamp(c.min_reward_risk, c.max_reward_risk)
    }

    fn snap_target(&self, entry: f64, side: Side, target: f64, window: &[Candle]) -> Option<f64> {
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        if !high.is_finite() || !low.is_finite() || high <= low {
            return None;
        }
        let range = high - low;

        self.config
            .extension_levels
            .iter()
            .map(|r| match side {
                Side::Buy => high + r * range,
                Side::Sell => low - r * range,
            })
            .filter(|level| (level - entry) * side.sign() > 0.0)
            .filter(|level| ((level - target) / target).abs() <= self.config.snap_tolerance)
            .min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs()))
    }

    /// Position size in base units for `fraction` of `capital` at `entry`
    pub fn position_size(capital: f64, fraction: f64, entry: f64) -> f64 {
        if entry <= 0.0 || !entry.is_finite() {
            return 0.0;
        }
        (capital * fraction / entry).max(0.0)
    }

    pub fn record_outcome(&self, win: bool) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        if outcomes.len() >= self.config.win_rate_window.max(1) {
            outcomes.pop_front();
        }
        outcomes.push_back(win);
    }

    /// Win rate once enough outcomes are recorded
    pub fn win_rate(&self) -> Option<f64> {
        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        if outcomes.len() < self.config.min_win_samples.max(1) {
            return None;
        }
        let wins = outcomes.iter().filter(|w| **w).count();
        Some(wins as f64 / outcomes.len() as f64)
    }
}
