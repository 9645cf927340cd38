//! Tick Aggregator - Builds multi-timeframe OHLCV candles from a trade stream
//!
//! Ticks only touch the finest (base) timeframe. A periodic `finalize(now)`
//! closes elapsed base buckets in order, fills gaps with flat candles and
//! folds each closed base candle upward into every coarser timeframe.
//! Listeners run after all buffers are updated, so they never observe a
//! partially finalized candle.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::oracle::ring::RingBuffer;
use crate::types::{Candle, Tick, Timeframe};

/// Finalized candle delivered to listeners
#[derive(Debug, Clone)]
pub struct CandleEvent {
    pub timeframe: Timeframe,
    pub candle: Candle,
    /// Recent finalized candles, most recent last (includes `candle`)
    pub window: Vec<Candle>,
}

/// Observer for finalized candles of one timeframe.
///
/// Called synchronously from `finalize`; implementations must not call
/// `finalize` themselves and should hand heavy work off to a channel.
pub trait CandleListener: Send + Sync {
    fn on_candle(&self, event: &CandleEvent);
}

impl<F> CandleListener for F
where
    F: Fn(&CandleEvent) + Send + Sync,
{
    fn on_candle(&self, event: &CandleEvent) {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// All timeframes to build; the smallest is the base
    pub timeframes: Vec<Timeframe>,
    /// Ring buffer capacity per timeframe
    pub capacity: usize,
    /// Number of candles handed to listeners with each event
    pub listener_window: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1],
            capacity: 1000,
            listener_window: 200,
        }
    }
}

/// Open base buckets plus the finalization cursor
#[derive(Debug, Default)]
struct Intake {
    open: BTreeMap<i64, Candle>,
    last_finalized: Option<i64>,
    last_close: Option<f64>,
}

#[derive(Debug)]
struct Series {
    buffer: RingBuffer<Candle>,
    /// Coarser timeframes accumulate here until their bucket completes
    building: Option<Candle>,
}

impl Series {
    /// Push keeping timestamps strictly increasing
    fn push(&mut self, candle: Candle, timeframe: Timeframe) -> bool {
        if let Some(last) = self.buffer.last() {
            if candle.ts <= last.ts {
                warn!(
                    timeframe = %timeframe,
                    ts = candle.ts,
                    last_ts = last.ts,
                    "⚠️ Dropping out-of-order candle"
                );
                return false;
            }
        }
        self.buffer.push(candle);
        true
    }
}

pub struct TickAggregator {
    base: Timeframe,
    /// Ascending; `timeframes[0] == base`
    timeframes: Vec<Timeframe>,
    listener_window: usize,
    intake: Mutex<Intake>,
    series: HashMap<Timeframe, Mutex<Series>>,
    listeners: RwLock<HashMap<Timeframe, Vec<Arc<dyn CandleListener>>>>,
    finalize_lock: Mutex<()>,
    rejected: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TickAggregator {
    /// Build an aggregator. Every timeframe must be a multiple of the base.
    pub fn new(config: AggregatorConfig) -> Result<Self, ValidationError> {
        let mut timeframes = config.timeframes.clone();
        timeframes.sort();
        timeframes.dedup();
        let base = *timeframes
            .first()
            .ok_or(ValidationError::UnknownTimeframe(Timeframe::default()))?;
        if let Some(bad) = timeframes.iter().find(|tf| tf.secs() % base.secs() != 0) {
            return Err(ValidationError::UnknownTimeframe(*bad));
        }

        let series = timeframes
            .iter()
            .map(|&tf| {
                (
                    tf,
                    Mutex::new(Series {
                        buffer: RingBuffer::new(config.capacity),
                        building: None,
                    }),
                )
            })
            .collect();

        Ok(Self {
            base,
            timeframes,
            listener_window: config.listener_window.max(1),
            intake: Mutex::new(Intake::default()),
            series,
            listeners: RwLock::new(HashMap::new()),
            finalize_lock: Mutex::new(()),
            rejected: AtomicU64::new(0),
        })
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.base
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Number of ticks rejected so far
    pub fn rejected_ticks(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Add a tick to its open base bucket.
    ///
    /// Invalid and late ticks are logged, counted and returned as an error
    /// for the caller to drop.
    pub fn ingest(&self, tick: &Tick) -> Result<(), ValidationError> {
        let checked = Self::validate(tick).and_then(|_| {
            let bucket = self.base.bucket_start(tick.ts);
            let mut intake = lock(&self.intake);
            if let Some(done) = intake.last_finalized {
                if bucket <= done {
                    return Err(ValidationError::LateTick { ts: tick.ts, bucket });
                }
            }
            intake
                .open
                .entry(bucket)
                .and_modify(|c| c.apply_tick(tick))
                .or_insert_with(|| Candle::from_tick(bucket, tick));
            Ok(())
        });

        if let Err(ref e) = checked {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, ts = tick.ts, "Tick rejected");
        }
        checked
    }

    fn validate(tick: &Tick) -> Result<(), ValidationError> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(ValidationError::InvalidPrice(tick.price));
        }
        if !tick.quantity.is_finite() || tick.quantity < 0.0 {
            return Err(ValidationError::InvalidQuantity(tick.quantity));
        }
        Ok(())
    }

    /// Close every base bucket that ended at or before `now` (ms).
    ///
    /// Returns the number of base candles finalized. Gaps between the last
    /// finalized bucket and `now` are filled with flat candles at the last
    /// close.
    pub fn finalize(&self, now: i64) -> usize {
        let _serial = lock(&self.finalize_lock);
        let closed = self.close_base_buckets(now);
        if closed.is_empty() {
            return 0;
        }

        let mut events = Vec::with_capacity(closed.len() * self.timeframes.len());
        for candle in &closed {
            self.fold(candle, &mut events);
        }
        self.dispatch(&events);
        closed.len()
    }

    fn close_base_buckets(&self, now: i64) -> Vec<Candle> {
        let d = self.base.duration_ms();
        let mut intake = lock(&self.intake);
        let mut closed = Vec::new();

        loop {
            let next = match intake.last_finalized {
                Some(ts) => ts + d,
                None => match intake.open.keys().next() {
                    Some(&ts) => ts,
                    None => break,
                },
            };
            if next + d > now {
                break;
            }
            let candle = match intake.open.remove(&next) {
                Some(c) => c,
                None => match intake.last_close {
                    Some(price) => Candle::flat(next, price),
                    None => break,
                },
            };
            intake.last_finalized = Some(next);
            intake.last_close = Some(candle.close);
            closed.push(candle);
        }
        closed
    }

    /// Push a finalized base candle and fold it into every coarser timeframe
    fn fold(&self, candle: &Candle, events: &mut Vec<CandleEvent>) {
        let base_end = candle.ts + self.base.duration_ms();

        for &tf in &self.timeframes {
            let Some(series) = self.series.get(&tf) else {
                continue;
            };
            let mut series = lock(series);

            if tf == self.base {
                if series.push(*candle, tf) {
                    events.push(self.event(tf, *candle, &series));
                }
                continue;
            }

            let bucket = tf.bucket_start(candle.ts);
            match series.building.as_mut() {
                Some(c) if c.ts == bucket => c.absorb(candle),
                _ => {
                    // A stale partial bucket can only remain after seeding
                    if let Some(stale) = series.building.take() {
                        if series.push(stale, tf) {
                            events.push(self.event(tf, stale, &series));
                        }
                    }
                    series.building = Some(Candle { ts: bucket, ..*candle });
                }
            }

            if base_end >= bucket + tf.duration_ms() {
                if let Some(done) = series.building.take() {
                    if series.push(done, tf) {
                        events.push(self.event(tf, done, &series));
                    }
                }
            }
        }
    }

    fn event(&self, timeframe: Timeframe, candle: Candle, series: &Series) -> CandleEvent {
        CandleEvent {
            timeframe,
            candle,
            window: series.buffer.last_n(self.listener_window),
        }
    }

    fn dispatch(&self, events: &[CandleEvent]) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for event in events {
            if let Some(list) = listeners.get(&event.timeframe) {
                for listener in list {
                    listener.on_candle(event);
                }
            }
        }
    }

    /// Register a listener for finalized candles of `timeframe`
    pub fn subscribe(
        &self,
        timeframe: Timeframe,
        listener: Arc<dyn CandleListener>,
    ) -> Result<(), ValidationError> {
        if !self.series.contains_key(&timeframe) {
            return Err(ValidationError::UnknownTimeframe(timeframe));
        }
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(timeframe)
            .or_default()
            .push(listener);
        Ok(())
    }

    /// Up to `n` most recent finalized candles, oldest first
    pub fn window(&self, timeframe: Timeframe, n: usize) -> Vec<Candle> {
        self.series
            .get(&timeframe)
            .map(|s| lock(s).buffer.last_n(n))
            .unwrap_or_default()
    }

    /// Number of finalized candles held for `timeframe`
    pub fn len(&self, timeframe: Timeframe) -> usize {
        self.series
            .get(&timeframe)
            .map(|s| lock(s).buffer.len())
            .unwrap_or(0)
    }

    pub fn last_close(&self) -> Option<f64> {
        lock(&self.intake).last_close
    }

    /// Pre-populate a timeframe with historical, already-closed candles.
    ///
    /// Candles must be aligned to the timeframe. Seeding the base timeframe
    /// also moves the finalization cursor and rebuilds the partial buckets
    /// of coarser timeframes so live candles continue where history ends.
    /// Listeners are not notified. Returns the candles actually stored;
    /// misaligned and out-of-order ones are skipped.
    pub fn seed(
        &self,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<Vec<Candle>, ValidationError> {
        let series = self
            .series
            .get(&timeframe)
            .ok_or(ValidationError::UnknownTimeframe(timeframe))?;

        let mut accepted = Vec::with_capacity(candles.len());
        {
            let mut series = lock(series);
            for c in candles {
                if timeframe.bucket_start(c.ts) != c.ts {
                    warn!(timeframe = %timeframe, ts = c.ts, "⚠️ Skipping misaligned seed candle");
                    continue;
                }
                if series.push(*c, timeframe) {
                    accepted.push(*c);
                }
            }
        }

        if timeframe == self.base {
            if let Some(last) = accepted.last() {
                {
                    let mut intake = lock(&self.intake);
                    intake.last_finalized = Some(last.ts);
                    intake.last_close = Some(last.close);
                    intake.open.retain(|&bucket, _| bucket > last.ts);
                }
                self.rebuild_partials(&accepted);
            }
        }

        info!(
            timeframe = %timeframe,
            count = accepted.len(),
            "📥 Seeded candle history"
        );
        Ok(accepted)
    }

    fn rebuild_partials(&self, base: &[Candle]) {
        let Some(last) = base.last() else {
            return;
        };
        let base_end = last.ts + self.base.duration_ms();

        for &tf in self.timeframes.iter().skip(1) {
            let Some(series) = self.series.get(&tf) else {
                continue;
            };
            let bucket = tf.bucket_start(last.ts);
            let mut series = lock(series);
            if base_end >= bucket + tf.duration_ms()
                || series.buffer.last().map_or(false, |c| c.ts >= bucket)
            {
                series.building = None;
                continue;
            }
            series.building = base
                .iter()
                .filter(|c| c.ts >= bucket)
                .fold(None, |acc: Option<Candle>, c| match acc {
                    Some(mut b) => {
                        b.absorb(c);
                        Some(b)
                    }
                    None => Some(Candle { ts: bucket, ..*c }),
                });
        }
    }
}
