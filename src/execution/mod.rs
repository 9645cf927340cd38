//! Execution Module
//!
//! Owns capital, positions and the order log. One async mutex covers the
//! whole risk check -> fill -> persist sequence so concurrent callers can
//! never both pass the gate on the same capital.
//!
//! Paper and live trading share every line of risk and accounting code;
//! only the fill source differs.

pub mod binance;
pub mod order;
pub mod placer;

pub use binance::BinanceRestClient;
pub use order::{Order, OrderIntent, OrderStatus};
pub use placer::{Fill, OrderPlacer};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, PersistenceError, ValidationError};
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::persistence::{PersistedState, StateStore, TradeJournal, STATE_VERSION};
use crate::risk::{DailyLossWindow, RiskLimits, RiskSnapshot};
use crate::types::{ClosedTrade, Clock, ExitReason, Position, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub paper: bool,
    /// Fraction of notional charged per fill
    pub commission_rate: f64,
    /// Adverse price move applied to paper fills
    pub slippage: f64,
    pub order_timeout_ms: u64,
    /// Orders kept in the in-memory log
    pub order_log_size: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            paper: true,
            commission_rate: 0.001,
            slippage: 0.0005,
            order_timeout_ms: 5_000,
            order_log_size: 500,
        }
    }
}

/// Price observations for one symbol since the last monitor pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBar {
    pub last: f64,
    pub high: f64,
    pub low: f64,
}

impl PriceBar {
    /// Bar where the last price stands in for the extremes
    pub fn flat(last: f64) -> Self {
        Self {
            last,
            high: last,
            low: last,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub capital: f64,
    pub equity: f64,
    pub total_pnl: f64,
    pub unrealized_pnl: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub open_positions: usize,
    pub closed_trades: u64,
    pub win_rate: Option<f64>,
    pub daily_pnl: f64,
    pub paper: bool,
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}capital ${:.2} | equity ${:.2} | pnl {:+.2} (unrealized {:+.2}, today {:+.2}) | dd {:.2}% | open {} | trades {}",
            if self.paper { "[PAPER] " } else { "" },
            self.capital,
            self.equity,
            self.total_pnl,
            self.unrealized_pnl,
            self.daily_pnl,
            self.drawdown * 100.0,
            self.open_positions,
            self.closed_trades,
        )?;
        if let Some(wr) = self.win_rate {
            write!(f, " | win {:.1}%", wr * 100.0)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EngineState {
    capital: f64,
    total_pnl: f64,
    peak_equity: f64,
    positions: Vec<Position>,
    orders: VecDeque<Order>,
    daily: DailyLossWindow,
    closed_trades: u64,
    winning_trades: u64,
    /// Last save failed; retried on the next change
    dirty: bool,
}

impl EngineState {
    fn fresh(capital: f64) -> Self {
        Self {
            capital,
            total_pnl: 0.0,
            peak_equity: capital,
            positions: Vec::new(),
            orders: VecDeque::new(),
            daily: DailyLossWindow::default(),
            closed_trades: 0,
            winning_trades: 0,
            dirty: false,
        }
    }

    fn restore(saved: PersistedState) -> Self {
        Self {
            capital: saved.capital,
            total_pnl: saved.total_pnl,
            peak_equity: saved.peak_capital,
            positions: saved.positions,
            orders: VecDeque::new(),
            daily: saved.daily,
            closed_trades: saved.closed_trades,
            winning_trades: saved.winning_trades,
            dirty: false,
        }
    }

    fn unrealized(&self) -> f64 {
        self.positions.iter().map(Position::unrealized_pnl).sum()
    }

    fn equity(&self) -> f64 {
        self.capital + self.unrealized()
    }

    fn mark_peak(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    fn risk_snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            open_positions: self.positions.len(),
            daily_pnl: self.daily.pnl(),
            capital: self.capital,
            equity: self.equity(),
            peak_equity: self.peak_equity,
        }
    }

    fn log_order(&mut self, order: Order, max: usize) {
        if self.orders.len() >= max.max(1) {
            self.orders.pop_front();
        }
        self.orders.push_back(order);
    }

    fn to_persisted(&self, now: i64) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            capital: self.capital,
            total_pnl: self.total_pnl,
            peak_capital: self.peak_equity,
            positions: self.positions.clone(),
            timestamp: now,
            daily: self.daily.clone(),
            closed_trades: self.closed_trades,
            winning_trades: self.winning_trades,
        }
    }
}

fn validate_entry(
    side: Side,
    size: f64,
    price: f64,
    stop_loss: f64,
    take_profit: f64,
) -> Result<(), ValidationError> {
    if !size.is_finite() || size <= 0.0 {
        return Err(ValidationError::InvalidSize(size));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(ValidationError::InvalidPrice(price));
    }
    let ordered = match side {
        Side::Buy => stop_loss < price && price < take_profit,
        Side::Sell => take_profit < price && price < stop_loss,
    };
    if !ordered || !stop_loss.is_finite() || !take_profit.is_finite() {
        return Err(ValidationError::InvalidBracket {
            entry: price,
            stop: stop_loss,
            target: take_profit,
        });
    }
    Ok(())
}

pub struct ExecutionEngine {
    config: ExecutionConfig,
    limits: RiskLimits,
    state: Mutex<EngineState>,
    store: Arc<dyn StateStore>,
    placer: Option<Arc<dyn OrderPlacer>>,
    notifier: Arc<dyn Notifier>,
    journal: Option<TradeJournal>,
    clock: Arc<dyn Clock>,
}

impl ExecutionEngine {
    /// Restore from `store` or start fresh at the configured capital.
    ///
    /// An unreadable or corrupted snapshot is an error: starting over would
    /// silently forget open positions.
    pub fn open(
        config: ExecutionConfig,
        limits: RiskLimits,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        let state = match store.load()? {
            Some(saved) => {
                info!(
                    source = %store.describe(),
                    capital = %format!("${:.2}", saved.capital),
                    positions = saved.positions.len(),
                    "💾 Restored execution state"
                );
                EngineState::restore(saved)
            }
            None => EngineState::fresh(limits.initial_capital),
        };

        Ok(Self {
            config,
            limits,
            state: Mutex::new(state),
            store,
            placer: None,
            notifier: Arc::new(LogNotifier),
            journal: None,
            clock,
        })
    }

    pub fn with_placer(mut self, placer: Arc<dyn OrderPlacer>) -> Self {
        self.placer = Some(placer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_journal(mut self, journal: TradeJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn is_paper(&self) -> bool {
        self.config.paper
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Evaluate the risk gate for an entry of `size` at `price` without
    /// placing anything
    pub async fn check_risk(&self, size: f64, price: f64) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().await;
        state.daily.roll(self.clock.now_ms());
        self.limits.check(&state.risk_snapshot(), size * price)?;
        Ok(())
    }

    async fn fill(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        price: f64,
    ) -> Result<Fill, ExecutionError> {
        if self.config.paper {
            return Ok(Fill {
                price: price * (1.0 + side.sign() * self.config.slippage),
                size,
            });
        }

        let placer = self.placer.as_ref().ok_or_else(|| {
            ExecutionError::ExchangeRejected("no order placer configured for live trading".into())
        })?;
        let timeout_ms = self.config.order_timeout_ms;
        let fill = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            placer.place_market_order(symbol, side, size),
        )
        .await
        .map_err(|_| ExecutionError::Timeout(timeout_ms))??;

        let usable = fill.price.is_finite()
            && fill.price > 0.0
            && fill.size.is_finite()
            && fill.size > 0.0;
        if !usable {
            return Err(ExecutionError::ExchangeRejected(format!(
                "unusable fill {:?}",
                fill
            )));
        }
        Ok(fill)
    }

    fn persist(&self, state: &mut EngineState) {
        let snapshot = state.to_persisted(self.clock.now_ms());
        match self.store.save(&snapshot) {
            Ok(()) => {
                if state.dirty {
                    info!("💾 State persisted after earlier failure");
                }
                state.dirty = false;
            }
            Err(e) => {
                error!(error = %e, store = %self.store.describe(), "Failed to persist execution state");
                state.dirty = true;
            }
        }
    }

    /// Validate, risk-check, fill and record an entry. On any failure no
    /// position exists and the order is logged as rejected.
    pub async fn execute_order(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        stop_loss: f64,
        take_profit: f64,
        price: f64,
    ) -> Result<Position, ExecutionError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();
        let mut order = Order::new(symbol, side, size, OrderIntent::Entry, price, now);

        let outcome = match validate_entry(side, size, price, stop_loss, take_profit) {
            Err(e) => Err(ExecutionError::from(e)),
            Ok(()) => {
                state.daily.roll(now);
                match self.limits.check(&state.risk_snapshot(), size * price) {
                    Err(rejection) => Err(ExecutionError::from(rejection)),
                    Ok(()) => self.fill(symbol, side, size, price).await,
                }
            }
        };

        let fill = match outcome {
            Ok(fill) => fill,
            Err(e) => {
                let reason = match &e {
                    ExecutionError::RiskRejected(r) => r.code().to_string(),
                    other => other.to_string(),
                };
                warn!(symbol, side = %side, size, price, reason = %e, "Order rejected");
                let _ = order.reject(reason, self.clock.now_ms());
                state.log_order(order, self.config.order_log_size);
                self.notifier.notify(Notification::Rejected {
                    symbol: symbol.to_string(),
                    side,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let filled_at = self.clock.now_ms();
        let commission = fill.price * fill.size * self.config.commission_rate;
        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            size: fill.size,
            entry_price: fill.price,
            current_price: fill.price,
            stop_loss,
            take_profit,
            entry_ts: filled_at,
            entry_commission: commission,
        };

        order.fill(fill.price, fill.size, filled_at)?;
        state.capital -= commission;
        state.positions.push(position.clone());
        state.log_order(order, self.config.order_log_size);
        self.persist(&mut state);

        info!(
            position_id = %position.id,
            symbol,
            side = %side,
            size = %format!("{:.6}", position.size),
            entry = %format!("${:.2}", position.entry_price),
            stop = %format!("${:.2}", stop_loss),
            target = %format!("${:.2}", take_profit),
            commission = %format!("${:.4}", commission),
            capital = %format!("${:.2}", state.capital),
            "{}POSITION OPENED",
            if self.config.paper { "[PAPER] " } else { "" }
        );
        self.notifier.notify(Notification::Fill {
            symbol: symbol.to_string(),
            side,
            size: position.size,
            price: position.entry_price,
            paper: self.config.paper,
        });

        Ok(position)
    }

    async fn close_locked(
        &self,
        state: &mut EngineState,
        position_id: &str,
        price: f64,
        reason: ExitReason,
    ) -> Result<ClosedTrade, ExecutionError> {
        let idx = state
            .positions
            .iter()
            .position(|p| p.id == position_id)
            .ok_or_else(|| ExecutionError::PositionNotFound(position_id.to_string()))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ValidationError::InvalidPrice(price).into());
        }

        let pos = state.positions[idx].clone();
        let exit_side = pos.side.opposite();
        let now = self.clock.now_ms();
        let mut order = Order::new(&pos.symbol, exit_side, pos.size, OrderIntent::Exit, price, now);

        let fill = match self.fill(&pos.symbol, exit_side, pos.size, price).await {
            Ok(fill) => fill,
            Err(e) => {
                error!(position_id, symbol = %pos.symbol, error = %e, "Failed to close position");
                let _ = order.reject(e.to_string(), self.clock.now_ms());
                state.log_order(order, self.config.order_log_size);
                self.notifier.notify(Notification::Error(format!(
                    "close of {} {} failed: {}",
                    pos.symbol, position_id, e
                )));
                return Err(e);
            }
        };

        let exit_ts = self.clock.now_ms();
        let gross = pos.side.sign() * (fill.price - pos.entry_price) * pos.size;
        let exit_commission = fill.price * pos.size * self.config.commission_rate;
        let pnl = gross - pos.entry_commission - exit_commission;

        state.positions.remove(idx);
        state.capital += gross - exit_commission;
        state.total_pnl += pnl;
        state.daily.record(pnl, exit_ts);
        state.closed_trades += 1;
        if pnl > 0.0 {
            state.winning_trades += 1;
        }
        order.fill(fill.price, fill.size, exit_ts)?;
        state.log_order(order, self.config.order_log_size);

        let trade = ClosedTrade {
            position_id: pos.id.clone(),
            symbol: pos.symbol.clone(),
            side: pos.side,
            size: pos.size,
            entry_price: pos.entry_price,
            exit_price: fill.price,
            entry_ts: pos.entry_ts,
            exit_ts,
            pnl,
            commission: pos.entry_commission + exit_commission,
            exit_reason: reason,
        };

        info!(
            position_id = %trade.position_id,
            symbol = %trade.symbol,
            side = %trade.side,
            entry = %format!("${:.2}", trade.entry_price),
            exit = %format!("${:.2}", trade.exit_price),
            pnl = %format!("{:+.2}", trade.pnl),
            reason = %reason,
            capital = %format!("${:.2}", state.capital),
            "{}POSITION CLOSED",
            if self.config.paper { "[PAPER] " } else { "" }
        );

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&trade) {
                warn!(error = %e, "Failed to append trade journal");
            }
        }
        self.notifier.notify(Notification::Closed(trade.clone()));
        Ok(trade)
    }

    /// Mark open positions to market and close any whose stop or target
    /// was touched by the bar
    pub async fn update_positions(&self, prices: &HashMap<String, PriceBar>) -> Vec<ClosedTrade> {
        let mut state = self.state.lock().await;

        let mut exits: Vec<(String, f64, ExitReason)> = Vec::new();
        for pos in state.positions.iter_mut() {
            let Some(bar) = prices.get(&pos.symbol) else {
                continue;
            };
            if !bar.last.is_finite() || bar.last <= 0.0 {
                continue;
            }
            pos.current_price = bar.last;
            let high = bar.high.max(bar.last);
            let low = bar.low.min(bar.last);

            match pos.exit_trigger(high, low) {
                Some(ExitReason::StopLoss) => {
                    // Gapped through the stop: the last price is the best available
                    let exit = match pos.side {
                        Side::Buy => pos.stop_loss.min(bar.last),
                        Side::Sell => pos.stop_loss.max(bar.last),
                    };
                    exits.push((pos.id.clone(), exit, ExitReason::StopLoss));
                }
                Some(reason) => exits.push((pos.id.clone(), pos.take_profit, reason)),
                None => {}
            }
        }

        let mut closed = Vec::with_capacity(exits.len());
        for (id, price, reason) in exits {
            if let Ok(trade) = self.close_locked(&mut state, &id, price, reason).await {
                closed.push(trade);
            }
        }

        state.mark_peak();
        if !closed.is_empty() || state.dirty {
            self.persist(&mut state);
        }
        closed
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        price: f64,
        reason: ExitReason,
    ) -> Result<ClosedTrade, ExecutionError> {
        let mut state = self.state.lock().await;
        let trade = self.close_locked(&mut state, position_id, price, reason).await?;
        state.mark_peak();
        self.persist(&mut state);
        Ok(trade)
    }

    /// Close every open position. Symbols missing from `prices` close at
    /// their last marked price.
    pub async fn close_all(
        &self,
        prices: &HashMap<String, f64>,
        reason: ExitReason,
    ) -> Vec<ClosedTrade> {
        let mut state = self.state.lock().await;
        let targets: Vec<(String, f64)> = state
            .positions
            .iter()
            .map(|p| {
                let price = prices.get(&p.symbol).copied().unwrap_or(p.current_price);
                (p.id.clone(), price)
            })
            .collect();

        let mut closed = Vec::with_capacity(targets.len());
        for (id, price) in targets {
            match self.close_locked(&mut state, &id, price, reason).await {
                Ok(trade) => closed.push(trade),
                Err(e) => warn!(position_id = %id, error = %e, "Position left open"),
            }
        }
        state.mark_peak();
        self.persist(&mut state);
        closed
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| ExecutionError::OrderNotFound(order_id.to_string()))?;
        order.cancel(now)?;
        debug!(order_id, "Order cancelled");
        Ok(())
    }

    pub async fn has_position(&self, symbol: &str) -> bool {
        self.state
            .lock()
            .await
            .positions
            .iter()
            .any(|p| p.symbol == symbol)
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.clone()
    }

    pub async fn open_position_count(&self) -> usize {
        self.state.lock().await.positions.len()
    }

    /// Most recent `n` orders, oldest first
    pub async fn orders(&self, n: usize) -> Vec<Order> {
        let state = self.state.lock().await;
        let skip = state.orders.len().saturating_sub(n);
        state.orders.iter().skip(skip).cloned().collect()
    }

    pub async fn summary(&self) -> AccountSummary {
        let mut state = self.state.lock().await;
        state.daily.roll(self.clock.now_ms());
        state.mark_peak();
        let equity = state.equity();
        let drawdown = if state.peak_equity > 0.0 {
            ((state.peak_equity - equity) / state.peak_equity).max(0.0)
        } else {
            0.0
        };
        AccountSummary {
            capital: state.capital,
            equity,
            total_pnl: state.total_pnl,
            unrealized_pnl: state.unrealized(),
            peak_equity: state.peak_equity,
            drawdown,
            open_positions: state.positions.len(),
            closed_trades: state.closed_trades,
            win_rate: (state.closed_trades > 0)
                .then(|| state.winning_trades as f64 / state.closed_trades as f64),
            daily_pnl: state.daily.pnl(),
            paper: self.config.paper,
        }
    }

    /// Write the current state regardless of the dirty flag
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let snapshot = state.to_persisted(self.clock.now_ms());
        self.store.save(&snapshot)?;
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExchangeError, RiskRejection};
    use crate::persistence::MemoryStore;
    use crate::types::ManualClock;
    use placer::MockOrderPlacer;

    const T0: i64 = 1_700_000_000_000;

    fn paper_engine(store: Arc<MemoryStore>) -> ExecutionEngine {
        ExecutionEngine::open(
            ExecutionConfig::default(),
            RiskLimits::default(),
            store,
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap()
    }

    fn bars(symbol: &str, bar: PriceBar) -> HashMap<String, PriceBar> {
        HashMap::from([(symbol.to_string(), bar)])
    }

    #[tokio::test]
    async fn test_paper_entry_applies_slippage_and_commission() {
        let store = Arc::new(MemoryStore::new());
        let engine = paper_engine(store.clone());

        let pos = engine
            .execute_order("BTCUSDT", Side::Buy, 0.02, 98_000.0, 105_000.0, 100_000.0)
            .await
            .unwrap();
        assert!((pos.entry_price - 100_050.0).abs() < 1e-6);
        assert!((pos.entry_commission - 2.001).abs() < 1e-9);

        let summary = engine.summary().await;
        assert!((summary.capital - (10_000.0 - 2.001)).abs() < 1e-9);
        assert_eq!(summary.open_positions, 1);
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().unwrap().positions.len(), 1);
        assert_eq!(engine.orders(10).await[0].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_without_position() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));

        let err = engine
            .execute_order("BTCUSDT", Side::Buy, 0.0, 90.0, 110.0, 100.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Validation(ValidationError::InvalidSize(_))
        ));

        let err = engine
            .execute_order("BTCUSDT", Side::Sell, 1.0, 90.0, 110.0, 100.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Validation(ValidationError::InvalidBracket { .. })
        ));

        assert_eq!(engine.open_position_count().await, 0);
        let orders = engine.orders(10).await;
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.status == OrderStatus::Rejected));
    }

    #[tokio::test]
    async fn test_risk_rejection_reports_reason() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        // 30 * 100 = 3000 > 25% of 10000
        let err = engine
            .execute_order("ETHUSDT", Side::Buy, 30.0, 95.0, 110.0, 100.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::RiskRejected(RiskRejection::PositionTooLarge { .. })
        ));
        assert_eq!(
            engine.orders(1).await[0].reason.as_deref(),
            Some("POSITION_TOO_LARGE")
        );
        assert!(engine.check_risk(30.0, 100.0).await.is_err());
        assert!(engine.check_risk(20.0, 100.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_max_concurrent_positions() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        for _ in 0..3 {
            engine
                .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
                .await
                .unwrap();
        }
        let err = engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::RiskRejected(RiskRejection::MaxConcurrentPositions { open: 3, max: 3 })
        ));
    }

    #[tokio::test]
    async fn test_stop_wins_when_both_levels_touched() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        engine
            .execute_order("ETHUSDT", Side::Buy, 10.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();

        let closed = engine
            .update_positions(&bars(
                "ETHUSDT",
                PriceBar {
                    last: 100.0,
                    high: 111.0,
                    low: 94.0,
                },
            ))
            .await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, ExitReason::StopLoss);
        assert!(closed[0].pnl < 0.0);
        assert_eq!(engine.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn test_short_take_profit_and_pnl_accounting() {
        let config = ExecutionConfig {
            slippage: 0.0,
            ..ExecutionConfig::default()
        };
        let engine = ExecutionEngine::open(
            config,
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap();

        engine
            .execute_order("ETHUSDT", Side::Sell, 10.0, 105.0, 90.0, 100.0)
            .await
            .unwrap();
        let closed = engine
            .update_positions(&bars("ETHUSDT", PriceBar::flat(89.0)))
            .await;
        assert_eq!(closed.len(), 1);
        let trade = &closed[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_price, 90.0);
        // gross 100, commissions 1.0 + 0.9
        assert!((trade.pnl - 98.1).abs() < 1e-9);

        let summary = engine.summary().await;
        assert!((summary.capital - 10_098.1).abs() < 1e-9);
        assert!((summary.total_pnl - 98.1).abs() < 1e-9);
        assert_eq!(summary.win_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_gap_through_stop_fills_at_last() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
        let closed = engine
            .update_positions(&bars("ETHUSDT", PriceBar::flat(90.0)))
            .await;
        // exit sells at 90 less slippage
        assert!((closed[0].exit_price - 90.0 * (1.0 - 0.0005)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_daily_loss_blocks_entries_until_window_rolls() {
        let clock = Arc::new(ManualClock::new(T0));
        let limits = RiskLimits {
            max_drawdown_fraction: 0.9,
            ..RiskLimits::default()
        };
        let engine = ExecutionEngine::open(
            ExecutionConfig::default(),
            limits,
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap();

        // Lose ~600 on one trade: 24 * (100 - 75)
        let pos = engine
            .execute_order("ETHUSDT", Side::Buy, 24.0, 75.0, 110.0, 100.0)
            .await
            .unwrap();
        engine
            .close_position(&pos.id, 75.0, ExitReason::Manual)
            .await
            .unwrap();

        let err = engine.check_risk(1.0, 100.0).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::RiskRejected(RiskRejection::DailyLossLimit { .. })
        ));

        clock.advance(crate::risk::DAY_MS);
        assert!(engine.check_risk(1.0, 100.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let engine = paper_engine(store.clone());
        store.set_failing(true);
        let pos = engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
        assert!(store.snapshot().is_none());

        store.set_failing(false);
        // Nothing closes, but the dirty state is written on this pass
        engine
            .update_positions(&bars("ETHUSDT", PriceBar::flat(101.0)))
            .await;
        let saved = store.snapshot().unwrap();
        assert_eq!(saved.positions[0].id, pos.id);
    }

    #[tokio::test]
    async fn test_restart_restores_positions() {
        let store = Arc::new(MemoryStore::new());
        let engine = paper_engine(store.clone());
        engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
        drop(engine);

        let restored = paper_engine(store);
        assert!(restored.has_position("ETHUSDT").await);
        assert!(!restored.has_position("BTCUSDT").await);
    }

    #[tokio::test]
    async fn test_close_all_uses_last_mark_when_price_missing() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
        engine
            .execute_order("SOLUSDT", Side::Sell, 10.0, 22.0, 18.0, 20.0)
            .await
            .unwrap();

        let prices = HashMap::from([("ETHUSDT".to_string(), 101.0)]);
        let closed = engine.close_all(&prices, ExitReason::Shutdown).await;
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|t| t.exit_reason == ExitReason::Shutdown));
        assert_eq!(engine.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_only_pending_orders() {
        let engine = paper_engine(Arc::new(MemoryStore::new()));
        engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
        let filled = engine.orders(1).await.remove(0);
        assert!(matches!(
            engine.cancel_order(&filled.id).await,
            Err(ExecutionError::NotPending(_))
        ));
        assert!(matches!(
            engine.cancel_order("missing").await,
            Err(ExecutionError::OrderNotFound(_))
        ));

        let pending = Order::new("ETHUSDT", Side::Buy, 1.0, OrderIntent::Entry, 100.0, T0);
        let id = pending.id.clone();
        engine.state.lock().await.log_order(pending, 10);
        engine.cancel_order(&id).await.unwrap();
        assert_eq!(engine.orders(1).await[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_live_fill_uses_placer() {
        let mut placer = MockOrderPlacer::new();
        placer
            .expect_place_market_order()
            .withf(|symbol, side, size| symbol == "BTCUSDT" && *side == Side::Buy && *size == 0.01)
            .times(1)
            .returning(|_, _, size| {
                Ok(Fill {
                    price: 50_010.0,
                    size,
                })
            });

        let engine = ExecutionEngine::open(
            ExecutionConfig {
                paper: false,
                ..ExecutionConfig::default()
            },
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap()
        .with_placer(Arc::new(placer));

        let pos = engine
            .execute_order("BTCUSDT", Side::Buy, 0.01, 49_000.0, 52_000.0, 50_000.0)
            .await
            .unwrap();
        assert_eq!(pos.entry_price, 50_010.0);
    }

    #[tokio::test]
    async fn test_live_exchange_rejection_leaves_no_position() {
        let mut placer = MockOrderPlacer::new();
        placer.expect_place_market_order().returning(|_, _, _| {
            Err(ExchangeError::Rejected {
                status: 400,
                body: "insufficient balance".into(),
            })
        });

        let engine = ExecutionEngine::open(
            ExecutionConfig {
                paper: false,
                ..ExecutionConfig::default()
            },
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap()
        .with_placer(Arc::new(placer));

        let err = engine
            .execute_order("BTCUSDT", Side::Buy, 0.01, 49_000.0, 52_000.0, 50_000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExchangeRejected(_)));
        assert_eq!(engine.open_position_count().await, 0);
        assert_eq!(engine.orders(1).await[0].status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_live_fill_with_nan_size_is_rejected() {
        let mut placer = MockOrderPlacer::new();
        placer
            .expect_place_market_order()
            .times(1)
            .returning(|_, _, _| Ok(Fill { price: 50_000.0, size: f64::NAN }));

        let engine = ExecutionEngine::open(
            ExecutionConfig {
                paper: false,
                ..ExecutionConfig::default()
            },
            RiskLimits::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(T0)),
        )
        .unwrap()
        .with_placer(Arc::new(placer));

        let err = engine
            .execute_order("BTCUSDT", Side::Buy, 0.01, 49_000.0, 52_000.0, 50_000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExchangeRejected(_)));
        assert_eq!(engine.open_position_count().await, 0);
        assert_eq!(engine.orders(1).await[0].status, OrderStatus::Rejected);
        assert_eq!(engine.summary().await.capital, RiskLimits::default().initial_capital);
    }

    #[tokio::test]
    async fn test_paper_mode_never_calls_placer() {
        let mut placer = MockOrderPlacer::new();
        placer.expect_place_market_order().times(0);
        let engine = paper_engine(Arc::new(MemoryStore::new())).with_placer(Arc::new(placer));
        engine
            .execute_order("ETHUSDT", Side::Buy, 1.0, 95.0, 110.0, 100.0)
            .await
            .unwrap();
    }
}
