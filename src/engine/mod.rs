//! Orchestrator
//!
//! Wires the pipeline together and runs the long-lived tasks:
//! - connection loop: one `TickSource` session at a time, reconnecting with
//!   bounded exponential backoff and re-subscribing on every attempt
//! - tick intake: trades into the per-symbol aggregators and price tracker
//! - finalize timer: closes candle buckets once per second
//! - candle processor: estimator updates, fusion, sizing and entries
//! - position monitor: stop-loss / take-profit checks once per second
//! - status reporter: periodic account summary
//!
//! All tasks watch one cancellation channel. Shutdown waits for every task,
//! then closes open positions, flushes state and notifies.

mod backoff;
mod price;

pub use backoff::backoff_delay;
pub use price::PriceTracker;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{ExecutionError, ValidationError};
use crate::estimator::{EstimatorBank, EstimatorConfig};
use crate::execution::ExecutionEngine;
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::oracle::sources::{HistoricalSource, SourceEvent, TickSource};
use crate::oracle::{AggregatorConfig, CandleEvent, TickAggregator};
use crate::risk::{AdaptiveRiskSizer, SizingRequest};
use crate::strategy::{atr_fraction, SignalFusionEngine, SignalSource};
use crate::types::{Candle, Clock, ExitReason, Position, Regime, Timeframe, TradeTick};

/// Session length after which the reconnect attempt counter resets
const STABLE_SESSION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub symbols: Vec<String>,
    pub primary: Timeframe,
    /// Primary first, then auxiliaries
    pub signal_timeframes: Vec<Timeframe>,
    pub min_history: usize,
    pub cooldown_ms: i64,
    pub status_interval: Duration,
    pub swing_lookback: usize,
    pub atr_period: usize,
    /// Candles handed to signal sources
    pub signal_window: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub bootstrap_limit: usize,
    pub tick_channel_size: usize,
    pub candle_channel_size: usize,
    pub finalize_interval: Duration,
    pub monitor_interval: Duration,
}

impl From<&AppConfig> for EngineSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            symbols: cfg.bot.symbols.iter().map(|s| s.trim().to_uppercase()).collect(),
            primary: cfg.bot.primary_timeframe,
            signal_timeframes: cfg.signal_timeframes(),
            min_history: cfg.bot.min_history,
            cooldown_ms: (cfg.bot.cooldown_secs as i64).saturating_mul(1000),
            status_interval: Duration::from_secs(cfg.bot.status_interval_secs),
            swing_lookback: cfg.bot.swing_lookback,
            atr_period: cfg.bot.atr_period,
            signal_window: cfg.oracle.listener_window,
            reconnect_base_ms: cfg.oracle.reconnect_base_ms,
            reconnect_max_ms: cfg.oracle.reconnect_max_ms,
            bootstrap_limit: cfg.oracle.bootstrap_limit,
            tick_channel_size: cfg.oracle.tick_channel_size,
            candle_channel_size: cfg.oracle.candle_channel_size,
            finalize_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Finalized candle tagged with its symbol
#[derive(Debug, Clone)]
struct ClosedCandle {
    symbol: String,
    event: CandleEvent,
}

/// Per-symbol candle and estimator state
struct SymbolPipeline {
    aggregator: Arc<TickAggregator>,
    estimators: Mutex<EstimatorBank>,
}

pub struct Orchestrator {
    settings: EngineSettings,
    pipelines: HashMap<String, SymbolPipeline>,
    sources: Vec<Arc<dyn SignalSource>>,
    fusion: SignalFusionEngine,
    sizer: AdaptiveRiskSizer,
    execution: Arc<ExecutionEngine>,
    prices: PriceTracker,
    /// Per-symbol time of the last evaluation that passed the history gate
    last_evaluation: Mutex<HashMap<String, i64>>,
    candle_rx: tokio::sync::Mutex<mpsc::Receiver<ClosedCandle>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        settings: EngineSettings,
        aggregator: AggregatorConfig,
        estimator: &EstimatorConfig,
        fusion: SignalFusionEngine,
        sizer: AdaptiveRiskSizer,
        execution: Arc<ExecutionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ValidationError> {
        let (candle_tx, candle_rx) = mpsc::channel(settings.candle_channel_size.max(1));

        let mut pipelines = HashMap::new();
        for symbol in &settings.symbols {
            let agg = Arc::new(TickAggregator::new(aggregator.clone())?);
            for &tf in &settings.signal_timeframes {
                let tx = candle_tx.clone();
                let symbol = symbol.clone();
                agg.subscribe(
                    tf,
                    Arc::new(move |event: &CandleEvent| {
                        let msg = ClosedCandle {
                            symbol: symbol.clone(),
                            event: event.clone(),
                        };
                        if tx.try_send(msg).is_err() {
                            warn!(symbol = %symbol, timeframe = %event.timeframe, "⚠️ Candle channel full, dropping candle");
                        }
                    }),
                )?;
            }
            pipelines.insert(
                symbol.clone(),
                SymbolPipeline {
                    aggregator: agg,
                    estimators: Mutex::new(EstimatorBank::new(&settings.signal_timeframes, estimator)),
                },
            );
        }

        Ok(Self {
            settings,
            pipelines,
            sources: Vec::new(),
            fusion,
            sizer,
            execution,
            prices: PriceTracker::new(),
            last_evaluation: Mutex::new(HashMap::new()),
            candle_rx: tokio::sync::Mutex::new(candle_rx),
            notifier: Arc::new(LogNotifier),
            clock,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn execution(&self) -> &Arc<ExecutionEngine> {
        &self.execution
    }

    pub fn sizer(&self) -> &AdaptiveRiskSizer {
        &self.sizer
    }

    pub fn fusion(&self) -> &SignalFusionEngine {
        &self.fusion
    }

    pub fn aggregator(&self, symbol: &str) -> Option<&Arc<TickAggregator>> {
        self.pipelines.get(symbol).map(|p| &p.aggregator)
    }

    pub fn prices(&self) -> &PriceTracker {
        &self.prices
    }

    /// Seed candle buffers and warm the estimators from historical klines.
    ///
    /// The bucket still in progress is dropped so live ticks rebuild it.
    /// Fetch failures are logged and skipped. Returns the candles seeded.
    pub async fn bootstrap(&self, history: &dyn HistoricalSource) -> usize {
        if self.settings.bootstrap_limit == 0 {
            return 0;
        }
        let now = self.clock.now_ms();
        let mut total = 0;

        for (symbol, pipeline) in &self.pipelines {
            let timeframes = pipeline.aggregator.timeframes().to_vec();
            for tf in timeframes {
                let mut candles = match history
                    .fetch_candles(symbol, tf, self.settings.bootstrap_limit)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "⚠️ Bootstrap fetch failed");
                        continue;
                    }
                };
                candles.retain(|c| c.ts + tf.duration_ms() <= now);

                let seeded = match pipeline.aggregator.seed(tf, &candles) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "⚠️ Bootstrap seed rejected");
                        continue;
                    }
                };
                total += seeded.len();

                if self.settings.signal_timeframes.contains(&tf) {
                    let mut bank = pipeline
                        .estimators
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    for c in &seeded {
                        bank.update(tf, c.close);
                    }
                }
                if let Some(last) = seeded.last() {
                    self.prices.record(symbol, last.close);
                }
            }
        }

        info!(candles = total, "📥 Bootstrap complete");
        total
    }

    /// Feed one trade into its symbol's aggregator
    pub fn ingest(&self, trade: &TradeTick) {
        let Some(pipeline) = self.pipelines.get(&trade.symbol) else {
            debug!(symbol = %trade.symbol, "Trade for unconfigured symbol");
            return;
        };
        match pipeline.aggregator.ingest(&trade.tick()) {
            Ok(()) => self.prices.record(&trade.symbol, trade.price),
            Err(ValidationError::LateTick { ts, bucket }) => {
                debug!(symbol = %trade.symbol, ts, bucket, "Late tick dropped");
            }
            Err(e) => warn!(symbol = %trade.symbol, error = %e, "⚠️ Invalid tick dropped"),
        }
    }

    /// Close every candle bucket that ended by `now`
    pub fn finalize(&self, now: i64) -> usize {
        self.pipelines
            .values()
            .map(|p| p.aggregator.finalize(now))
            .sum()
    }

    /// Process every finalized candle queued so far. Estimators see all of
    /// them before any primary close is evaluated.
    pub async fn drain_candles(&self) -> Vec<Position> {
        let mut batch = Vec::new();
        {
            let mut rx = self.candle_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                batch.push(msg);
            }
        }
        self.process_batch(batch).await
    }

    async fn process_batch(&self, batch: Vec<ClosedCandle>) -> Vec<Position> {
        let mut primaries = Vec::new();
        for msg in batch {
            let Some(pipeline) = self.pipelines.get(&msg.symbol) else {
                continue;
            };
            pipeline
                .estimators
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .update(msg.event.timeframe, msg.event.candle.close);
            if msg.event.timeframe == self.settings.primary {
                primaries.push(msg);
            }
        }

        let mut opened = Vec::new();
        for msg in primaries {
            if let Some(pos) = self.evaluate(&msg.symbol, &msg.event.candle).await {
                opened.push(pos);
            }
        }
        opened
    }

    /// Claim an evaluation slot for `symbol`. False while the previous
    /// evaluation is less than the cooldown old.
    fn begin_evaluation(&self, symbol: &str, now: i64) -> bool {
        let mut last = self
            .last_evaluation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&t) = last.get(symbol) {
            if now - t < self.settings.cooldown_ms {
                return false;
            }
        }
        last.insert(symbol.to_string(), now);
        true
    }

    /// Decide on a primary-timeframe close and enter if warranted
    async fn evaluate(&self, symbol: &str, candle: &Candle) -> Option<Position> {
        let pipeline = self.pipelines.get(symbol)?;
        let agg = &pipeline.aggregator;
        let primary = self.settings.primary;

        if agg.len(primary) < self.settings.min_history {
            debug!(symbol, have = agg.len(primary), need = self.settings.min_history, "Warming up");
            return None;
        }
        let now = self.clock.now_ms();
        if !self.begin_evaluation(symbol, now) {
            debug!(symbol, "In cooldown");
            return None;
        }

        let (mut signals, regime, coherence) = {
            let bank = pipeline
                .estimators
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let regime = bank
                .snapshot(primary)
                .filter(|s| s.ready)
                .map_or(Regime::Stable, |s| s.regime);
            (
                bank.signals(&self.settings.signal_timeframes, now),
                regime,
                bank.coherence(&self.settings.signal_timeframes),
            )
        };
        for &tf in &self.settings.signal_timeframes {
            let window = agg.window(tf, self.settings.signal_window);
            for source in &self.sources {
                if window.len() < source.min_history() {
                    continue;
                }
                if let Some(signal) = source.generate(tf, &window) {
                    signals.push(signal);
                }
            }
        }

        let fused = self.fusion.fuse(&signals, regime, now);
        if !fused.is_actionable() {
            debug!(
                symbol,
                signals = signals.len(),
                confidence = fused.confidence,
                coherence = fused.coherence,
                "No trade: neutral fusion"
            );
            return None;
        }
        let side = fused.direction.side()?;
        if self.execution.has_position(symbol).await {
            debug!(symbol, "No trade: position already open");
            return None;
        }

        let entry = self.prices.last(symbol).unwrap_or(candle.close);
        let history = agg.window(
            primary,
            self.settings.swing_lookback.max(self.settings.atr_period + 1),
        );
        let swing_from = history.len().saturating_sub(self.settings.swing_lookback);
        let bracket = self.sizer.compute(&SizingRequest {
            entry,
            side,
            confidence: fused.confidence,
            strength: fused.strength,
            coherence: fused.coherence,
            regime,
            volatility: atr_fraction(&history, self.settings.atr_period),
            swing_window: Some(&history[swing_from..]),
        });

        let capital = self.execution.summary().await.capital;
        let size = AdaptiveRiskSizer::position_size(capital, fused.position_size_fraction, entry);

        info!(
            symbol,
            direction = %fused.direction,
            regime = %regime,
            confidence = %format!("{:.3}", fused.confidence),
            coherence = %format!("{:.3}", fused.coherence),
            estimator_coherence = %format!("{:.3}", coherence),
            size_fraction = %format!("{:.3}", fused.position_size_fraction),
            stop = %format!("{:.2}", bracket.stop_loss),
            target = %format!("{:.2}", bracket.take_profit),
            rr = %format!("{:.2}", bracket.reward_risk),
            snapped = bracket.snapped,
            "🎯 Entry signal"
        );

        match self
            .execution
            .execute_order(symbol, side, size, bracket.stop_loss, bracket.take_profit, entry)
            .await
        {
            Ok(pos) => Some(pos),
            Err(ExecutionError::RiskRejected(r)) => {
                info!(symbol, reason = %r, "Entry blocked by risk limits");
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "Entry failed");
                None
            }
        }
    }

    /// One position-monitor pass over the prices seen since the last pass
    pub async fn monitor_positions(&self) -> usize {
        let bars = self.prices.take_bars();
        if bars.is_empty() {
            return 0;
        }
        let closed = self.execution.update_positions(&bars).await;
        for trade in &closed {
            self.sizer.record_outcome(trade.is_win());
        }
        closed.len()
    }

    pub async fn report_status(&self) {
        let summary = self.execution.summary().await;
        info!("📊 {}", summary);
        self.notifier.notify(Notification::Status(summary));
    }

    /// Run every task until `shutdown` flips, then wind down
    pub async fn run(
        self: Arc<Self>,
        source: Box<dyn TickSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (tick_tx, tick_rx) = mpsc::channel(self.settings.tick_channel_size.max(1));

        let handles: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "connection",
                tokio::spawn(self.clone().connection_loop(source, tick_tx, shutdown.clone())),
            ),
            (
                "intake",
                tokio::spawn(self.clone().intake_loop(tick_rx, shutdown.clone())),
            ),
            (
                "finalize",
                tokio::spawn(self.clone().finalize_loop(shutdown.clone())),
            ),
            (
                "candles",
                tokio::spawn(self.clone().candle_loop(shutdown.clone())),
            ),
            (
                "monitor",
                tokio::spawn(self.clone().monitor_loop(shutdown.clone())),
            ),
            (
                "status",
                tokio::spawn(self.clone().status_loop(shutdown.clone())),
            ),
        ];
        info!(
            symbols = ?self.settings.symbols,
            primary = %self.settings.primary,
            paper = self.execution.is_paper(),
            "🚀 Engine running"
        );

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("🛑 Shutdown requested, stopping tasks");

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        self.wind_down().await;
        Ok(())
    }

    /// Close everything at the last seen prices and persist the result
    pub async fn wind_down(&self) {
        let closed = self
            .execution
            .close_all(&self.prices.last_prices(), ExitReason::Shutdown)
            .await;
        for trade in &closed {
            self.sizer.record_outcome(trade.is_win());
        }
        if let Err(e) = self.execution.flush().await {
            error!(error = %e, "Failed to flush state on shutdown");
        }
        let summary = self.execution.summary().await;
        info!(closed = closed.len(), "💾 Shutdown complete: {}", summary);
        self.notifier.notify(Notification::Info(format!(
            "shutdown complete, {} position(s) closed",
            closed.len()
        )));
        self.notifier.notify(Notification::Status(summary));
    }

    async fn connection_loop(
        self: Arc<Self>,
        mut source: Box<dyn TickSource>,
        tx: mpsc::Sender<SourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = source.subscribe(&self.settings.symbols).await {
                warn!(source = source.name(), error = %e, "Subscribe failed");
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                r = source.connect(tx.clone()) => Some(r),
                _ = shutdown.changed() => None,
            };
            let Some(result) = outcome else {
                let _ = source.disconnect().await;
                break;
            };
            match result {
                Ok(()) => info!(source = source.name(), "Stream session ended"),
                Err(e) => warn!(source = source.name(), error = %e, "⚠️ Stream session lost"),
            }
            if tx.is_closed() {
                break;
            }

            if started.elapsed() >= STABLE_SESSION {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(
                attempt,
                self.settings.reconnect_base_ms,
                self.settings.reconnect_max_ms,
            );
            info!(
                source = source.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "🔄 Reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Connection loop stopped");
    }

    async fn intake_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(SourceEvent::Trade(trade)) => self.ingest(&trade),
                    Some(SourceEvent::Connected(venue)) => info!(source = %venue, "✅ Source connected"),
                    Some(SourceEvent::Disconnected(venue)) => warn!(source = %venue, "Source disconnected"),
                    Some(SourceEvent::Error(venue, msg)) => warn!(source = %venue, error = %msg, "Source error"),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Intake loop stopped");
    }

    async fn finalize_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.finalize_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.finalize(self.clock.now_ms());
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn candle_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let first = {
                let mut rx = self.candle_rx.lock().await;
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = shutdown.changed() => None,
                }
            };
            let Some(first) = first else {
                break;
            };

            let mut batch = vec![first];
            {
                let mut rx = self.candle_rx.lock().await;
                while let Ok(msg) = rx.try_recv() {
                    batch.push(msg);
                }
            }
            self.process_batch(batch).await;
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.monitor_positions().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn status_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.status_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.report_status().await,
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionConfig;
    use crate::oracle::sources::ReplaySource;
    use crate::persistence::MemoryStore;
    use crate::risk::{RiskLimits, SizerConfig};
    use crate::strategy::FusionConfig;
    use crate::types::{Direction, ManualClock, Side, Signal};
    use async_trait::async_trait;

    /// Minute-aligned start time
    const T0: i64 = 1_699_999_980_000;
    const MIN: i64 = 60_000;

    /// Always says the same thing
    struct FixedSource {
        name: &'static str,
        direction: Direction,
    }

    impl SignalSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn generate(&self, timeframe: Timeframe, window: &[Candle]) -> Option<Signal> {
            let ts = window.last()?.ts;
            Some(Signal::new(self.direction, 0.8, 0.9, timeframe, self.name, ts))
        }
    }

    struct StaticHistory(Vec<Candle>);

    #[async_trait]
    impl HistoricalSource for StaticHistory {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            timeframe: Timeframe,
            _limit: usize,
        ) -> anyhow::Result<Vec<Candle>> {
            if timeframe == Timeframe::M1 {
                Ok(self.0.clone())
            } else {
                anyhow::bail!("no data for {}", timeframe)
            }
        }
    }

    fn settings(min_history: usize) -> EngineSettings {
        EngineSettings {
            symbols: vec!["BTCUSDT".to_string()],
            primary: Timeframe::M1,
            signal_timeframes: vec![Timeframe::M1],
            min_history,
            cooldown_ms: 10 * MIN,
            status_interval: Duration::from_secs(3600),
            swing_lookback: 20,
            atr_period: 3,
            signal_window: 50,
            reconnect_base_ms: 1,
            reconnect_max_ms: 5,
            bootstrap_limit: 100,
            tick_channel_size: 64,
            candle_channel_size: 64,
            finalize_interval: Duration::from_millis(10),
            monitor_interval: Duration::from_millis(10),
        }
    }

    fn orchestrator(
        min_history: usize,
        direction: Direction,
        clock: Arc<ManualClock>,
    ) -> Orchestrator {
        let execution = ExecutionEngine::open(
            ExecutionConfig::default(),
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();
        // Keep the filter silent so only the fixed sources speak
        let estimator = EstimatorConfig {
            warmup: 10_000,
            ..Default::default()
        };
        Orchestrator::new(
            settings(min_history),
            AggregatorConfig {
                timeframes: vec![Timeframe::M1],
                capacity: 100,
                listener_window: 50,
            },
            &estimator,
            SignalFusionEngine::new(FusionConfig::default()),
            AdaptiveRiskSizer::new(SizerConfig::default()),
            Arc::new(execution),
            clock,
        )
        .unwrap()
        .with_source(Arc::new(FixedSource {
            name: "fixed_a",
            direction,
        }))
        .with_source(Arc::new(FixedSource {
            name: "fixed_b",
            direction,
        }))
    }

    fn trade(minute: i64, price: f64) -> TradeTick {
        TradeTick {
            symbol: "BTCUSDT".to_string(),
            ts: T0 + minute * MIN + 1_000,
            price,
            quantity: 1.0,
            side: Side::Buy,
        }
    }

    fn candle(minute: i64, close: f64) -> Candle {
        Candle {
            ts: T0 + minute * MIN,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    /// Trade once per minute in `[from, to)` and close those buckets
    async fn run_minutes(
        orch: &Orchestrator,
        clock: &ManualClock,
        from: i64,
        to: i64,
    ) -> Vec<Position> {
        for m in from..to {
            orch.ingest(&trade(m, 100.0 + m as f64 * 0.1));
        }
        clock.set(T0 + to * MIN);
        orch.finalize(T0 + to * MIN);
        orch.drain_candles().await
    }

    #[tokio::test]
    async fn test_no_entry_before_min_history() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(5, Direction::Long, clock.clone());

        assert!(run_minutes(&orch, &clock, 0, 4).await.is_empty());
        assert_eq!(orch.aggregator("BTCUSDT").unwrap().len(Timeframe::M1), 4);

        let opened = run_minutes(&orch, &clock, 4, 5).await;
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].side, Side::Buy);
        assert!(opened[0].stop_loss < opened[0].entry_price);
        assert!(opened[0].take_profit > opened[0].entry_price);
    }

    #[tokio::test]
    async fn test_short_signal_opens_short() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(3, Direction::Short, clock.clone());

        let opened = run_minutes(&orch, &clock, 0, 3).await;
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].side, Side::Sell);
        assert!(opened[0].stop_loss > opened[0].entry_price);
    }

    #[tokio::test]
    async fn test_single_position_and_cooldown() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(3, Direction::Long, clock.clone());

        assert_eq!(run_minutes(&orch, &clock, 0, 3).await.len(), 1);
        assert!(run_minutes(&orch, &clock, 3, 4).await.is_empty());

        orch.wind_down().await;
        assert_eq!(orch.execution().open_position_count().await, 0);

        // Flat again but still inside the cooldown window
        assert!(run_minutes(&orch, &clock, 4, 6).await.is_empty());
        // Cooldown is 10 minutes from the evaluation at minute 3
        assert_eq!(run_minutes(&orch, &clock, 6, 14).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_applies_to_every_evaluation() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(2, Direction::Neutral, clock.clone());

        // Ten closes at once: only the first is evaluated
        assert!(run_minutes(&orch, &clock, 0, 10).await.is_empty());
        assert_eq!(orch.fusion().history_stats().count, 1);

        // Neutral outcomes still start the window
        assert!(run_minutes(&orch, &clock, 10, 12).await.is_empty());
        assert_eq!(orch.fusion().history_stats().count, 1);

        assert!(run_minutes(&orch, &clock, 12, 20).await.is_empty());
        assert_eq!(orch.fusion().history_stats().count, 2);
    }

    #[tokio::test]
    async fn test_position_open_skip_starts_cooldown() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(3, Direction::Long, clock.clone());

        assert_eq!(run_minutes(&orch, &clock, 0, 3).await.len(), 1);
        // Evaluated at minute 13 with the position still open
        assert!(run_minutes(&orch, &clock, 3, 13).await.is_empty());
        assert_eq!(orch.fusion().history_stats().count, 2);

        orch.wind_down().await;
        // Minute 20 is inside the window started at minute 13
        assert!(run_minutes(&orch, &clock, 13, 20).await.is_empty());
        assert_eq!(run_minutes(&orch, &clock, 20, 23).await.len(), 1);
    }

    #[tokio::test]
    async fn test_neutral_sources_never_trade() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(2, Direction::Neutral, clock.clone());

        assert!(run_minutes(&orch, &clock, 0, 10).await.is_empty());
        assert_eq!(orch.fusion().history_stats().neutrals, 1);
    }

    #[tokio::test]
    async fn test_unknown_symbol_and_bad_ticks_ignored() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(3, Direction::Long, clock.clone());

        let mut other = trade(0, 100.0);
        other.symbol = "ETHUSDT".to_string();
        orch.ingest(&other);
        orch.ingest(&trade(0, f64::NAN));
        assert_eq!(orch.prices().last("BTCUSDT"), None);
        assert_eq!(orch.aggregator("BTCUSDT").unwrap().rejected_ticks(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_drops_in_progress_candle() {
        let clock = Arc::new(ManualClock::new(T0 + 10 * MIN + 30_000));
        let orch = orchestrator(3, Direction::Long, clock.clone());

        // Minute 10 is still open at the current time
        let history = StaticHistory((0..=10).map(|m| candle(m, 100.0 + m as f64)).collect());
        assert_eq!(orch.bootstrap(&history).await, 10);

        let agg = orch.aggregator("BTCUSDT").unwrap();
        assert_eq!(agg.len(Timeframe::M1), 10);
        assert_eq!(orch.prices().last("BTCUSDT"), Some(109.0));

        // The live tick for minute 10 is still accepted
        orch.ingest(&trade(10, 111.0));
        assert_eq!(agg.rejected_ticks(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_warms_only_from_stored_candles() {
        let clock = Arc::new(ManualClock::new(T0 + 10 * MIN));
        let orch = orchestrator(3, Direction::Long, clock.clone());

        let mut off_grid = candle(4, 900.0);
        off_grid.ts += 7_000;
        let mut history: Vec<Candle> = (0..5).map(|m| candle(m, 100.0 + m as f64)).collect();
        history.push(candle(2, 500.0));
        history.push(off_grid);
        assert_eq!(orch.bootstrap(&StaticHistory(history)).await, 5);

        let updates = orch.pipelines["BTCUSDT"]
            .estimators
            .lock()
            .unwrap()
            .snapshot(Timeframe::M1)
            .map(|s| s.updates);
        assert_eq!(updates, Some(5));
        assert_eq!(orch.prices().last("BTCUSDT"), Some(104.0));
    }

    #[tokio::test]
    async fn test_monitor_closes_on_stop() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = orchestrator(3, Direction::Long, clock.clone());
        let pos = run_minutes(&orch, &clock, 0, 3).await.remove(0);

        // Drain the bars accumulated during entry
        orch.monitor_positions().await;
        orch.ingest(&trade(3, pos.stop_loss * 0.99));
        assert_eq!(orch.monitor_positions().await, 1);
        assert_eq!(orch.execution().open_position_count().await, 0);
        assert!(orch.execution().summary().await.total_pnl < 0.0);
    }

    #[tokio::test]
    async fn test_run_streams_and_shuts_down_cleanly() {
        let clock = Arc::new(ManualClock::new(T0));
        let orch = Arc::new(orchestrator(3, Direction::Long, clock.clone()));
        let trades = (0..5).map(|m| trade(m, 100.0)).collect();
        let source = ReplaySource::new(trades).with_drop_after(2);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(orch.clone().run(Box::new(source), stop_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orch.prices().last("BTCUSDT"), Some(100.0));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(orch.execution().open_position_count().await, 0);
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = AppConfig::from_env().unwrap();
        let s = EngineSettings::from(&cfg);
        assert_eq!(s.primary, cfg.bot.primary_timeframe);
        assert_eq!(s.signal_timeframes[0], s.primary);
        assert_eq!(s.cooldown_ms, cfg.bot.cooldown_secs as i64 * 1000);
    }
}
