//! Signal Fusion Engine
//!
//! Combines signals from independent sources and timeframes into one
//! decision:
//! 1. Base weight = confidence × regime timeframe tilt × source reliability
//! 2. Finer timeframes gain weight when coarser ones point the same way
//! 3. Weighted directional sum with a deadband
//! 4. Coherence = pairwise agreement of per-timeframe directions
//! 5. Confidence = weighted confidence × √coherence × count saturation
//! 6. Neutral unless both confidence and coherence clear their gates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use crate::types::{Direction, FusedSignal, Regime, RegimeValues, Signal, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub min_confidence: f64,
    pub min_coherence: f64,
    /// |weighted sum| below this is neutral
    pub deadband: f64,
    /// Signal count at which confidence stops being discounted
    pub saturation_count: usize,
    pub modulation_enabled: bool,
    /// Maximum extra weight a fully agreeing coarser context adds
    pub modulation_boost: f64,
    /// Weight decay per timeframe step when averaging coarser context
    pub modulation_discount: f64,
    /// Positive favors coarse timeframes, negative favors fine ones
    pub regime_tilt: RegimeValues,
    /// Per-source multiplier; unknown sources get 1.0
    pub source_reliability: HashMap<String, f64>,
    pub base_position_fraction: f64,
    pub min_position_fraction: f64,
    pub max_position_fraction: f64,
    pub base_stop_fraction: f64,
    pub min_stop_fraction: f64,
    pub max_stop_fraction: f64,
    pub stop_regime_factor: RegimeValues,
    pub history_size: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_coherence: 0.6,
            deadband: 0.1,
            saturation_count: 2,
            modulation_enabled: true,
            modulation_boost: 0.18,
            modulation_discount: 0.5,
            regime_tilt: RegimeValues {
                trending: 0.3,
                volatile: -0.3,
                stable: 0.0,
                mean_reverting: -0.2,
            },
            source_reliability: HashMap::new(),
            base_position_fraction: 0.1,
            min_position_fraction: 0.01,
            max_position_fraction: 0.2,
            base_stop_fraction: 0.02,
            min_stop_fraction: 0.005,
            max_stop_fraction: 0.05,
            stop_regime_factor: RegimeValues {
                trending: 1.0,
                volatile: 1.5,
                stable: 0.8,
                mean_reverting: 1.0,
            },
            history_size: 500,
        }
    }
}

/// Read-only aggregate over recent fused results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionStats {
    pub count: usize,
    pub longs: usize,
    pub shorts: usize,
    pub neutrals: usize,
    pub mean_confidence: f64,
    pub mean_coherence: f64,
}

pub struct SignalFusionEngine {
    config: FusionConfig,
    history: RwLock<VecDeque<FusedSignal>>,
}

impl SignalFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        let cap = config.history_size.max(1);
        Self {
            config,
            history: RwLock::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse `signals` under the current market `regime`.
    pub fn fuse(&self, signals: &[Signal], regime: Regime, ts: i64) -> FusedSignal {
        let fused = self.compute(signals, regime, ts);
        self.record(&fused);
        fused
    }

    fn compute(&self, signals: &[Signal], regime: Regime, ts: i64) -> FusedSignal {
        let c = &self.config;
        if signals.is_empty() {
            return FusedSignal::neutral(regime, ts);
        }

        // Ascending timeframe -> rank
        let timeframes: Vec<Timeframe> = signals
            .iter()
            .map(|s| s.timeframe)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let rank: HashMap<Timeframe, usize> = timeframes
            .iter()
            .enumerate()
            .map(|(i, tf)| (*tf, i))
            .collect();

        let mut weights: Vec<f64> = signals
            .iter()
            .map(|s| {
                s.confidence
                    * self.timeframe_multiplier(rank[&s.timeframe], timeframes.len(), regime)
                    * self.reliability(&s.source)
            })
            .collect();
        if !normalize(&mut weights) {
            let mut neutral = FusedSignal::neutral(regime, ts);
            neutral.signals = signals.to_vec();
            return neutral;
        }

        if c.modulation_enabled && timeframes.len() > 1 {
            self.modulate(signals, &timeframes, &rank, &mut weights);
        }

        let sum: f64 = signals
            .iter()
            .zip(&weights)
            .map(|(s, w)| s.direction.sign() * s.strength * w)
            .sum();
        let raw = Direction::from_value(sum, c.deadband);

        let coherence = coherence(signals, &weights, &timeframes);
        let weighted_confidence: f64 = signals
            .iter()
            .zip(&weights)
            .map(|(s, w)| s.confidence * w)
            .sum();
        let saturation = (signals.len() as f64 / c.saturation_count.max(1) as f64).min(1.0);
        let confidence = (weighted_confidence * coherence.sqrt() * saturation).clamp(0.0, 1.0);

        let direction = if confidence < c.min_confidence || coherence < c.min_coherence {
            Direction::Neutral
        } else {
            raw
        };

        let position_size_fraction = (c.base_position_fraction * (confidence * coherence).sqrt())
            .clamp(c.min_position_fraction, c.max_position_fraction);
        let stop_loss_fraction = (c.base_stop_fraction
            * c.stop_regime_factor.get(regime)
            * (1.5 - confidence))
            .clamp(c.min_stop_fraction, c.max_stop_fraction);

        tracing::debug!(
            %direction,
            raw = %raw,
            sum,
            confidence,
            coherence,
            signals = signals.len(),
            "Fused signals"
        );

        FusedSignal {
            direction,
            strength: sum.abs().min(1.0),
            confidence,
            coherence,
            signals: signals.to_vec(),
            position_size_fraction,
            stop_loss_fraction,
            regime,
            ts,
        }
    }

    fn timeframe_multiplier(&self, rank: usize, count: usize, regime: Regime) -> f64 {
        let position = if count > 1 {
            rank as f64 / (count - 1) as f64
        } else {
            0.5
        };
        (1.0 + self.config.regime_tilt.get(regime) * (2.0 * position - 1.0)).max(0.1)
    }

    fn reliability(&self, source: &str) -> f64 {
        self.config
            .source_reliability
            .get(source)
            .copied()
            .unwrap_or(1.0)
            .max(0.0)
    }

    /// Boost finer timeframes whose direction matches the coarser context
    fn modulate(
        &self,
        signals: &[Signal],
        timeframes: &[Timeframe],
        rank: &HashMap<Timeframe, usize>,
        weights: &mut [f64],
    ) {
        let c = &self.config;

        // Average signed confidence per timeframe
        let mut context: BTreeMap<Timeframe, (f64, usize)> = BTreeMap::new();
        for s in signals {
            let e = context.entry(s.timeframe).or_insert((0.0, 0));
            e.0 += s.direction.sign() * s.confidence;
            e.1 += 1;
        }

        let mut factors: HashMap<Timeframe, f64> = HashMap::new();
        for tf in timeframes {
            let own: f64 = signals
                .iter()
                .zip(weights.iter())
                .filter(|(s, _)| s.timeframe == *tf)
                .map(|(s, w)| s.direction.sign() * w)
                .sum();
            let own_sign = Direction::from_value(own, f64::EPSILON).sign();

            let (mut num, mut den) = (0.0, 0.0);
            for (coarser, (total, n)) in context.range((
                std::ops::Bound::Excluded(*tf),
                std::ops::Bound::Unbounded,
            )) {
                let distance = rank[coarser] - rank[tf];
                let decay = c.modulation_discount.powi(distance as i32 - 1);
                num += total / *n as f64 * decay;
                den += decay;
            }
            let agreement = if den > 0.0 { num / den } else { 0.0 };
            factors.insert(*tf, 1.0 + c.modulation_boost * (own_sign * agreement).max(0.0));
        }

        for (s, w) in signals.iter().zip(weights.iter_mut()) {
            *w *= factors.get(&s.timeframe).copied().unwrap_or(1.0);
        }
        normalize(weights);
    }

    fn record(&self, fused: &FusedSignal) {
        let mut history = self
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if history.len() >= self.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(fused.clone());
    }

    /// Most recent fused results, oldest first
    pub fn history(&self, n: usize) -> Vec<FusedSignal> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn history_stats(&self) -> FusionStats {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let count = history.len();
        if count == 0 {
            return FusionStats::default();
        }
        let mut stats = FusionStats {
            count,
            ..Default::default()
        };
        for f in history.iter() {
            match f.direction {
                Direction::Long => stats.longs += 1,
                Direction::Short => stats.shorts += 1,
                Direction::Neutral => stats.neutrals += 1,
            }
            stats.mean_confidence += f.confidence;
            stats.mean_coherence += f.coherence;
        }
        stats.mean_confidence /= count as f64;
        stats.mean_coherence /= count as f64;
        stats
    }
}

/// Scale to sum 1. False when the total is not positive.
fn normalize(weights: &mut [f64]) -> bool {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return false;
    }
    weights.iter_mut().for_each(|w| *w /= total);
    true
}

fn coherence(signals: &[Signal], weights: &[f64], timeframes: &[Timeframe]) -> f64 {
    if signals.len() < 2 {
        return 0.5;
    }
    let values: Vec<f64> = if timeframes.len() >= 2 {
        timeframes
            .iter()
            .map(|tf| {
                let (num, den) = signals
                    .iter()
                    .zip(weights)
                    .filter(|(s, _)| s.timeframe == *tf)
                    .fold((0.0, 0.0), |(n, d), (s, w)| {
                        (n + s.direction.sign() * s.confidence * w, d + w)
                    });
                if den > 0.0 {
                    num / den
                } else {
                    0.0
                }
            })
            .collect()
    } else {
        signals
            .iter()
            .map(|s| s.direction.sign() * s.confidence)
            .collect()
    };
    pairwise_agreement(&values)
}

fn pairwise_agreement(values: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in values.iter().enumerate() {
        for b in &values[i + 1..] {
            pairs += 1;
            if a * b > 0.0 {
                total += a.abs().min(b.abs()) / a.abs().max(b.abs());
            }
        }
    }
    if pairs == 0 {
        0.5
    } else {
        total / pairs as f64
    }
}
