//! Signal source trait shared by the estimator adapter and pattern detectors

use crate::types::{Candle, Signal, Timeframe};

/// Anything that can turn a candle window into a directional opinion.
///
/// Implementations are called from the candle-processing task and must be
/// cheap; returning `None` means "no opinion" and is never an error.
pub trait SignalSource: Send + Sync {
    /// Stable tag stamped on produced signals and used for reliability
    /// weighting
    fn name(&self) -> &str;

    /// Minimum candles needed before `generate` can say anything
    fn min_history(&self) -> usize {
        1
    }

    /// Produce a signal from `window` (oldest first, last is most recent)
    fn generate(&self, timeframe: Timeframe, window: &[Candle]) -> Option<Signal>;
}

/// Rate-of-change source: direction from the close-to-close move over
/// `lookback` candles, confidence from how many of those candles moved the
/// same way.
#[derive(Debug, Clone)]
pub struct MomentumSource {
    pub lookback: usize,
    /// Relative move mapped to full strength
    pub full_strength_move: f64,
    /// Moves smaller than this are neutral
    pub min_move: f64,
}

impl Default for MomentumSource {
    fn default() -> Self {
        Self {
            lookback: 10,
            full_strength_move: 0.01,
            min_move: 0.0005,
        }
    }
}

impl SignalSource for MomentumSource {
    fn name(&self) -> &str {
        "momentum"
    }

    fn min_history(&self) -> usize {
        self.lookback + 1
    }

    fn generate(&self, timeframe: Timeframe, window: &[Candle]) -> Option<Signal> {
        if self.lookback == 0 || window.len() < self.min_history() {
            return None;
        }
        let recent = &window[window.len() - self.lookback - 1..];
        let first = recent.first()?.close;
        let last = recent.last()?;
        if first <= 0.0 {
            return None;
        }

        let change = (last.close - first) / first;
        let direction = crate::types::Direction::from_value(change, self.min_move);
        let agreeing = recent
            .windows(2)
            .filter(|w| (w[1].close - w[0].close) * change > 0.0)
            .count();
        let confidence = agreeing as f64 / self.lookback as f64;
        let strength = if direction.is_neutral() {
            0.0
        } else {
            change.abs() / self.full_strength_move
        };

        Some(Signal::new(
            direction,
            strength,
            confidence,
            timeframe,
            self.name(),
            last.ts,
        ))
    }
}
