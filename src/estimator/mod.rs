//! Adaptive State Estimator
//!
//! Constant-acceleration Kalman filter over candle closes with state
//! `[level, velocity, acceleration]`. Noise levels adapt to the observed
//! innovations:
//! - the base measurement variance is calibrated from the first few closes
//!   and then tracked with a slow EWMA of squared innovations
//! - a noise scale `qs` (recent mean |innovation| over window mean) inflates
//!   process noise and deflates measurement noise in volatile stretches
//!
//! Uncertainty and velocity are reported relative to the measurement noise,
//! so thresholds do not depend on the instrument's price level.

use ndarray::{arr1, arr2, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::EstimationDegenerate;
use crate::types::{Direction, Regime, Signal, Timeframe};

/// Tag carried by signals produced from estimator state
pub const ESTIMATOR_SOURCE: &str = "estimator";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Sampling interval in filter time units (one candle = 1.0)
    pub dt: f64,
    /// Process noise spectral density relative to measurement variance
    pub process_noise: f64,
    /// Measurements used to calibrate the filter before it reports anything
    pub warmup: usize,
    /// Rolling |innovation| window
    pub innovation_window: usize,
    /// Tail of the window compared against its mean
    pub recent_window: usize,
    /// Diagonal regularizer, relative to measurement variance
    pub regularization: f64,
    /// EWMA weight for measurement-variance tracking
    pub noise_adaptation: f64,
    pub min_noise_scale: f64,
    pub max_noise_scale: f64,
    /// trace(P) / R0 above this is `volatile`
    pub volatile_uncertainty: f64,
    pub trend_confidence: f64,
    /// Normalized |velocity| above this (with enough confidence) is `trending`
    pub trend_velocity: f64,
    pub stable_confidence: f64,
    pub stable_velocity: f64,
    /// |velocity| must exceed this many standard deviations to signal
    pub direction_sigmas: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            process_noise: 1e-6,
            warmup: 5,
            innovation_window: 20,
            recent_window: 5,
            regularization: 1e-9,
            noise_adaptation: 0.05,
            min_noise_scale: 0.1,
            max_noise_scale: 10.0,
            volatile_uncertainty: 8.0,
            trend_confidence: 0.35,
            trend_velocity: 0.1,
            stable_confidence: 0.5,
            stable_velocity: 0.05,
            direction_sigmas: 2.0,
        }
    }
}

/// Read-only view of the filter after an update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSnapshot {
    pub level: f64,
    pub velocity: f64,
    pub acceleration: f64,
    /// trace(P) relative to the calibrated measurement variance
    pub uncertainty: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub direction: Direction,
    pub strength: f64,
    pub updates: usize,
    pub ready: bool,
}

impl EstimatorSnapshot {
    pub fn to_signal(&self, timeframe: Timeframe, ts: i64) -> Signal {
        Signal::new(
            self.direction,
            self.strength,
            self.confidence,
            timeframe,
            ESTIMATOR_SOURCE,
            ts,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveStateEstimator {
    config: EstimatorConfig,
    f: Array2<f64>,
    h: Array1<f64>,
    /// Unit-variance process noise shape for the constant-acceleration model
    g: Array2<f64>,
    x: Array1<f64>,
    p: Array2<f64>,
    calibration: Vec<f64>,
    ready: bool,
    innovations: VecDeque<f64>,
    noise_scale: f64,
    base_r: f64,
    r0: f64,
    updates: usize,
}

impl AdaptiveStateEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let dt = config.dt;
        let f = arr2(&[[1.0, dt, dt * dt / 2.0], [0.0, 1.0, dt], [0.0, 0.0, 1.0]]);
        let g = arr2(&[
            [dt.powi(5) / 20.0, dt.powi(4) / 8.0, dt.powi(3) / 6.0],
            [dt.powi(4) / 8.0, dt.powi(3) / 3.0, dt.powi(2) / 2.0],
            [dt.powi(3) / 6.0, dt.powi(2) / 2.0, dt],
        ]);
        let window = config.innovation_window.max(2);
        Self {
            f,
            h: arr1(&[1.0, 0.0, 0.0]),
            g,
            x: Array1::zeros(3),
            p: Array2::zeros((3, 3)),
            calibration: Vec::with_capacity(config.warmup.max(2)),
            ready: false,
            innovations: VecDeque::with_capacity(window),
            noise_scale: 1.0,
            base_r: 0.0,
            r0: 0.0,
            updates: 0,
            config,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Feed one measurement and return the resulting state.
    ///
    /// Non-finite measurements are ignored.
    pub fn update(&mut self, z: f64) -> EstimatorSnapshot {
        if !z.is_finite() {
            tracing::debug!(measurement = z, "Ignoring non-finite measurement");
            return self.snapshot();
        }
        self.updates += 1;

        if !self.ready {
            self.calibrate(z);
            return self.snapshot();
        }

        let qs = self.noise_scale;
        let q = &self.g * (self.config.process_noise * self.base_r * qs);
        let r = self.base_r / qs;

        // Predict
        let x_pred = self.f.dot(&self.x);
        let p_pred = self.f.dot(&self.p).dot(&self.f.t()) + &q;

        // Correct
        let y = z - self.h.dot(&x_pred);
        let ph = p_pred.dot(&self.h);
        let s = self.h.dot(&ph) + r;
        let k = ph / s;
        self.x = &x_pred + &(&k * y);

        let hp = self.h.dot(&p_pred);
        let kh_p = k.insert_axis(Axis(1)).dot(&hp.insert_axis(Axis(0)));
        let p = p_pred - kh_p;
        let mut p = (&p + &p.t()) * 0.5;
        let reg = self.config.regularization * self.base_r;
        p.diag_mut().mapv_inplace(|d| d + reg);
        self.p = p;

        let alpha = self.config.noise_adaptation;
        self.base_r = ((1.0 - alpha) * self.base_r + alpha * y * y).max(self.r0 * 1e-4);
        self.record_innovation(y.abs());

        self.snapshot()
    }

    fn calibrate(&mut self, z: f64) {
        self.calibration.push(z);
        if self.calibration.len() < self.config.warmup.max(2) {
            return;
        }

        let diffs: Vec<f64> = self.calibration.windows(2).map(|w| w[1] - w[0]).collect();
        let n = diffs.len() as f64;
        let mean = diffs.iter().sum::<f64>() / n;
        let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;

        // Differences of white noise carry twice the measurement variance
        let floor = (z.abs() * 1e-6).powi(2).max(f64::MIN_POSITIVE);
        self.base_r = (var / 2.0).max(floor);
        self.r0 = self.base_r;

        let dt = self.config.dt;
        self.x = arr1(&[z, mean / dt, 0.0]);
        self.p = Array2::from_diag(&arr1(&[
            self.base_r,
            2.0 * self.base_r / (dt * dt),
            self.config.process_noise * self.base_r,
        ]));
        self.ready = true;
        self.calibration.clear();

        tracing::debug!(
            base_r = self.base_r,
            velocity = self.x[1],
            "Estimator calibrated"
        );
    }

    fn record_innovation(&mut self, abs_y: f64) {
        let window = self.config.innovation_window.max(2);
        if self.innovations.len() == window {
            self.innovations.pop_front();
        }
        self.innovations.push_back(abs_y);

        let recent = self.config.recent_window.max(1);
        if self.innovations.len() >= recent {
            let mean = mean(self.innovations.iter().copied());
            let recent_mean = mean_of_tail(&self.innovations, recent);
            let ratio = if mean > 0.0 { recent_mean / mean } else { 1.0 };
            self.noise_scale =
                ratio.clamp(self.config.min_noise_scale, self.config.max_noise_scale);
        }
    }

    /// Ok once warm-up is complete
    pub fn ready(&self) -> Result<(), EstimationDegenerate> {
        if self.ready {
            Ok(())
        } else {
            Err(EstimationDegenerate {
                updates: self.calibration.len(),
                required: self.config.warmup.max(2),
            })
        }
    }

    pub fn uncertainty(&self) -> f64 {
        if !self.ready || self.r0 <= 0.0 {
            return 0.0;
        }
        self.p.diag().sum() / self.r0
    }

    fn normalized_velocity(&self) -> f64 {
        if self.base_r <= 0.0 {
            return 0.0;
        }
        self.x[1].abs() * self.config.dt / self.base_r.sqrt()
    }

    pub fn confidence(&self) -> f64 {
        if !self.ready || self.innovations.len() < 2 {
            return 0.0;
        }
        let m = mean(self.innovations.iter().copied());
        let consistency = if m > 0.0 {
            let var = self.innovations.iter().map(|v| (v - m).powi(2)).sum::<f64>()
                / self.innovations.len() as f64;
            1.0 / (1.0 + var.sqrt() / m)
        } else {
            1.0
        };
        let certainty = 1.0 / (1.0 + self.uncertainty());
        ((consistency + certainty) / 2.0).clamp(0.0, 1.0)
    }

    pub fn regime(&self) -> Regime {
        if !self.ready {
            return Regime::default();
        }
        let c = &self.config;
        let confidence = self.confidence();
        let velocity = self.normalized_velocity();

        if self.uncertainty() > c.volatile_uncertainty {
            Regime::Volatile
        } else if confidence > c.trend_confidence && velocity > c.trend_velocity {
            Regime::Trending
        } else if confidence > c.stable_confidence && velocity < c.stable_velocity {
            Regime::Stable
        } else {
            Regime::MeanReverting
        }
    }

    fn velocity_z(&self) -> f64 {
        let sd = self.p[[1, 1]].max(0.0).sqrt();
        if sd > 0.0 {
            self.x[1].abs() / sd
        } else {
            0.0
        }
    }

    pub fn direction(&self) -> Direction {
        if !self.ready {
            return Direction::Neutral;
        }
        let v = self.x[1];
        let sd = self.p[[1, 1]].max(0.0).sqrt();
        if v.abs() > self.config.direction_sigmas * sd {
            Direction::from_value(v, 0.0)
        } else {
            Direction::Neutral
        }
    }

    pub fn snapshot(&self) -> EstimatorSnapshot {
        if !self.ready {
            return EstimatorSnapshot {
                level: self.calibration.last().copied().unwrap_or(0.0),
                velocity: 0.0,
                acceleration: 0.0,
                uncertainty: 0.0,
                confidence: 0.0,
                regime: Regime::default(),
                direction: Direction::Neutral,
                strength: 0.0,
                updates: self.updates,
                ready: false,
            };
        }
        let direction = self.direction();
        let strength = if direction.is_neutral() {
            0.0
        } else {
            (self.velocity_z() / (2.0 * self.config.direction_sigmas)).min(1.0)
        };
        EstimatorSnapshot {
            level: self.x[0],
            velocity: self.x[1],
            acceleration: self.x[2],
            uncertainty: self.uncertainty(),
            confidence: self.confidence(),
            regime: self.regime(),
            direction,
            strength,
            updates: self.updates,
            ready: true,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn mean_of_tail(values: &VecDeque<f64>, n: usize) -> f64 {
    let skip = values.len().saturating_sub(n);
    mean(values.iter().skip(skip).copied())
}

/// Agreement of per-timeframe directions.
///
/// Fraction of non-neutral directions siding with the majority, times the
/// mean confidence of that majority. Zero when every direction is neutral.
pub fn timeframe_coherence(snapshots: &[EstimatorSnapshot]) -> f64 {
    let active: Vec<&EstimatorSnapshot> = snapshots
        .iter()
        .filter(|s| !s.direction.is_neutral())
        .collect();
    if active.is_empty() {
        return 0.0;
    }
    let longs = active
        .iter()
        .filter(|s| s.direction == Direction::Long)
        .count();
    let shorts = active.len() - longs;
    let majority = match longs.cmp(&shorts) {
        std::cmp::Ordering::Greater => Some(Direction::Long),
        std::cmp::Ordering::Less => Some(Direction::Short),
        std::cmp::Ordering::Equal => None,
    };

    let agreeing: Vec<f64> = active
        .iter()
        .filter(|s| majority.map_or(true, |d| s.direction == d))
        .map(|s| s.confidence)
        .collect();
    let fraction = longs.max(shorts) as f64 / active.len() as f64;
    fraction * mean(agreeing.into_iter())
}

/// One estimator per timeframe
#[derive(Debug, Clone)]
pub struct EstimatorBank {
    estimators: HashMap<Timeframe, AdaptiveStateEstimator>,
}

impl EstimatorBank {
    pub fn new(timeframes: &[Timeframe], config: &EstimatorConfig) -> Self {
        Self {
            estimators: timeframes
                .iter()
                .map(|&tf| (tf, AdaptiveStateEstimator::new(config.clone())))
                .collect(),
        }
    }

    /// Update the estimator for `timeframe`; None if it is not tracked
    pub fn update(&mut self, timeframe: Timeframe, close: f64) -> Option<EstimatorSnapshot> {
        self.estimators
            .get_mut(&timeframe)
            .map(|e| e.update(close))
    }

    pub fn snapshot(&self, timeframe: Timeframe) -> Option<EstimatorSnapshot> {
        self.estimators.get(&timeframe).map(|e| e.snapshot())
    }

    /// Signals from every ready estimator among `timeframes`
    pub fn signals(&self, timeframes: &[Timeframe], ts: i64) -> Vec<Signal> {
        timeframes
            .iter()
            .filter_map(|tf| {
                let est = self.estimators.get(tf)?;
                est.ready().ok()?;
                Some(est.snapshot().to_signal(*tf, ts))
            })
            .collect()
    }

    pub fn coherence(&self, timeframes: &[Timeframe]) -> f64 {
        let snaps: Vec<EstimatorSnapshot> = timeframes
            .iter()
            .filter_map(|tf| self.snapshot(*tf))
            .collect();
        timeframe_coherence(&snaps)
    }
}
