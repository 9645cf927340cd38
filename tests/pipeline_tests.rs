//! End-to-end tests: ticks in, candles, fusion, execution, persistence out

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    use fusionbot::engine::{EngineSettings, Orchestrator};
    use fusionbot::error::ExchangeError;
    use fusionbot::estimator::EstimatorConfig;
    use fusionbot::execution::{ExecutionConfig, ExecutionEngine, Fill, OrderPlacer, OrderStatus};
    use fusionbot::notify::{ChannelNotifier, Notification};
    use fusionbot::oracle::sources::ReplaySource;
    use fusionbot::oracle::AggregatorConfig;
    use fusionbot::persistence::{JsonFileStore, MemoryStore, StateStore, TradeJournal};
    use fusionbot::risk::{AdaptiveRiskSizer, RiskLimits, SizerConfig};
    use fusionbot::strategy::{FusionConfig, SignalFusionEngine, SignalSource};
    use fusionbot::types::{Candle, Direction, ManualClock, Side, Signal, Timeframe, TradeTick};

    /// Minute-aligned start time
    const T0: i64 = 1_699_999_980_000;
    const MIN: i64 = 60_000;

    mock! {
        pub Placer {}

        #[async_trait]
        impl OrderPlacer for Placer {
            async fn place_market_order(
                &self,
                symbol: &str,
                side: Side,
                size: f64,
            ) -> Result<Fill, ExchangeError>;
            async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;
        }
    }

    struct FixedSource(&'static str);

    impl SignalSource for FixedSource {
        fn name(&self) -> &str {
            self.0
        }

        fn generate(&self, timeframe: Timeframe, window: &[Candle]) -> Option<Signal> {
            let ts = window.last()?.ts;
            Some(Signal::new(Direction::Long, 0.8, 0.9, timeframe, self.0, ts))
        }
    }

    // ============================================================================
    // Helpers
    // ============================================================================

    fn settings() -> EngineSettings {
        EngineSettings {
            symbols: vec!["BTCUSDT".to_string()],
            primary: Timeframe::M1,
            signal_timeframes: vec![Timeframe::M1],
            min_history: 3,
            cooldown_ms: 10 * MIN,
            status_interval: Duration::from_secs(3600),
            swing_lookback: 20,
            atr_period: 3,
            signal_window: 50,
            reconnect_base_ms: 1,
            reconnect_max_ms: 5,
            bootstrap_limit: 0,
            tick_channel_size: 64,
            candle_channel_size: 64,
            finalize_interval: Duration::from_millis(10),
            monitor_interval: Duration::from_millis(10),
        }
    }

    fn build(execution: Arc<ExecutionEngine>, clock: Arc<ManualClock>) -> Orchestrator {
        let estimator = EstimatorConfig {
            warmup: 10_000,
            ..Default::default()
        };
        Orchestrator::new(
            settings(),
            AggregatorConfig {
                timeframes: vec![Timeframe::M1],
                capacity: 100,
                listener_window: 50,
            },
            &estimator,
            SignalFusionEngine::new(FusionConfig::default()),
            AdaptiveRiskSizer::new(SizerConfig::default()),
            execution,
            clock,
        )
        .unwrap()
        .with_source(Arc::new(FixedSource("fixed_a")))
        .with_source(Arc::new(FixedSource("fixed_b")))
    }

    fn trade(minute: i64, price: f64) -> TradeTick {
        TradeTick {
            symbol: "BTCUSDT".to_string(),
            ts: T0 + minute * MIN + 1_000,
            price,
            quantity: 0.5,
            side: Side::Buy,
        }
    }

    // ============================================================================
    // Live routing
    // ============================================================================

    #[tokio::test]
    async fn test_live_entry_uses_exchange_fill() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut placer = MockPlacer::new();
        placer
            .expect_place_market_order()
            .withf(|symbol, side, size| symbol == "BTCUSDT" && *side == Side::Buy && *size > 0.0)
            .times(1)
            .returning(|_, _, size| Ok(Fill { price: 100.5, size }));

        let execution = ExecutionEngine::open(
            ExecutionConfig {
                paper: false,
                ..Default::default()
            },
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap()
        .with_placer(Arc::new(placer));
        let orch = build(Arc::new(execution), clock.clone());

        for m in 0..3 {
            orch.ingest(&trade(m, 100.0));
        }
        clock.set(T0 + 3 * MIN);
        orch.finalize(T0 + 3 * MIN);
        let opened = orch.drain_candles().await;

        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].entry_price, 100.5);
        assert!(!orch.execution().is_paper());
    }

    #[tokio::test]
    async fn test_live_rejection_leaves_no_position() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut placer = MockPlacer::new();
        placer.expect_place_market_order().returning(|_, _, _| {
            Err(ExchangeError::Rejected {
                status: 400,
                body: "insufficient balance".into(),
            })
        });

        let (notifier, mut rx) = ChannelNotifier::new(16);
        let execution = ExecutionEngine::open(
            ExecutionConfig {
                paper: false,
                ..Default::default()
            },
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap()
        .with_placer(Arc::new(placer))
        .with_notifier(Arc::new(notifier));
        let orch = build(Arc::new(execution), clock.clone());

        for m in 0..3 {
            orch.ingest(&trade(m, 100.0));
        }
        clock.set(T0 + 3 * MIN);
        orch.finalize(T0 + 3 * MIN);

        assert!(orch.drain_candles().await.is_empty());
        assert_eq!(orch.execution().open_position_count().await, 0);
        let orders = orch.execution().orders(10).await;
        assert!(!orders.is_empty());
        assert!(orders.iter().all(|o| o.status == OrderStatus::Rejected));

        let mut rejected = 0;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::Rejected { .. }) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, orders.len());
    }

    // ============================================================================
    // Full run with persistence
    // ============================================================================

    #[tokio::test]
    async fn test_replay_session_trades_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("engine_state.json");
        let journal_path = dir.path().join("trades.csv");
        let clock = Arc::new(ManualClock::new(T0));

        let execution = ExecutionEngine::open(
            ExecutionConfig::default(),
            RiskLimits::default(),
            Arc::new(JsonFileStore::new(&state_path)),
            clock.clone(),
        )
        .unwrap()
        .with_journal(TradeJournal::new(&journal_path));
        let orch = Arc::new(build(Arc::new(execution), clock.clone()));

        let trades = (0..5).map(|m| trade(m, 100.0 + m as f64 * 0.1)).collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(orch.clone().run(Box::new(ReplaySource::new(trades)), stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.set(T0 + 5 * MIN);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let positions = orch.execution().positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Buy);
        let saved = JsonFileStore::new(&state_path).load().unwrap().unwrap();
        assert_eq!(saved.positions.len(), 1);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap()
            .unwrap();

        let before = orch.execution().summary().await;
        assert_eq!(before.open_positions, 0);
        assert_eq!(before.closed_trades, 1);

        let journal = TradeJournal::new(&journal_path).read_all().unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].exit_reason, "SHUTDOWN");

        // Restart from the persisted state
        let restored = ExecutionEngine::open(
            ExecutionConfig::default(),
            RiskLimits::default(),
            Arc::new(JsonFileStore::new(&state_path)),
            clock.clone(),
        )
        .unwrap();
        let after = restored.summary().await;
        assert!((after.capital - before.capital).abs() < 1e-9);
        assert_eq!(after.closed_trades, 1);
        assert_eq!(after.open_positions, 0);
    }
}
