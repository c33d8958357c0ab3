use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::exit_rules::ExitRuleEngine;
use super::position_store::PositionStore;
use super::sources::{OrderSink, PriceSource};
use crate::config::MonitorConfig;
use crate::error::{ConfigError, PersistenceError, StoreError};
use crate::events::{AlertSeverity, EventBus, MonitorEvent};
use crate::models::{
    realized_pnl, ExitReason, OrderResult, Position, PositionStatus, SellInstruction,
};
use crate::persistence::StateFiles;
use crate::risk::AccountRiskGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Summary of one price-refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Position updates applied
    pub updated: usize,
    /// Tokens whose fetch failed
    pub failed: usize,
    /// Tokens suspended from polling during this cycle
    pub suspended: Vec<String>,
}

/// Result of one dispatched exit
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed { id: Uuid, pnl: i64 },
    Failed { id: Uuid, error: String },
}

#[derive(Default)]
struct PriceHealth {
    failures: HashMap<String, u32>,
    suspended: HashSet<String>,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct MonitorInner {
    config: MonitorConfig,
    store: PositionStore,
    engine: ExitRuleEngine,
    guard: Arc<AccountRiskGuard>,
    prices: Arc<dyn PriceSource>,
    orders: Arc<dyn OrderSink>,
    events: EventBus,
    state_files: Option<StateFiles>,
    price_health: Mutex<PriceHealth>,
    persist_lock: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
}

/// Watches open positions and closes them when an exit rule fires
///
/// Two loops run while started: price refresh pulls quotes for every open
/// position, analysis evaluates the exit rules and dispatches sells. Each exit
/// runs on its own task, so a slow order never holds up the other positions.
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct PositionMonitor {
    inner: Arc<MonitorInner>,
}

impl PositionMonitor {
    pub fn new(
        config: MonitorConfig,
        engine: ExitRuleEngine,
        guard: Arc<AccountRiskGuard>,
        prices: Arc<dyn PriceSource>,
        orders: Arc<dyn OrderSink>,
        events: EventBus,
        state_files: Option<StateFiles>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = PositionStore::new(engine.history_capacity());

        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                store,
                engine,
                guard,
                prices,
                orders,
                events,
                state_files,
                price_health: Mutex::new(PriceHealth::default()),
                persist_lock: Mutex::new(()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    pub fn engine(&self) -> &ExitRuleEngine {
        &self.inner.engine
    }

    pub fn guard(&self) -> &Arc<AccountRiskGuard> {
        &self.inner.guard
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &PositionStore {
        &self.inner.store
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.inner.store.all().await
    }

    pub async fn has_open_position(&self, token_address: &str) -> bool {
        self.inner.store.has_position_for(token_address).await
    }

    pub async fn state(&self) -> MonitorState {
        if self.inner.lifecycle.lock().await.cancel.is_some() {
            MonitorState::Running
        } else {
            MonitorState::Stopped
        }
    }

    /// Start the price-refresh and analysis loops; no-op when already running
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.cancel.is_some() {
            tracing::debug!("Position monitor already running");
            return;
        }

        let cancel = CancellationToken::new();

        let monitor = self.clone();
        let token = cancel.clone();
        let price_period = Duration::from_secs(self.inner.config.price_refresh_secs);
        lifecycle.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(price_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.refresh_prices().await;
                    }
                }
            }
            tracing::debug!("Price refresh loop stopped");
        }));

        let monitor = self.clone();
        let token = cancel.clone();
        let analysis_period = Duration::from_secs(self.inner.config.analysis_secs);
        lifecycle.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(analysis_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Exits run detached; the loop does not wait on orders
                        monitor.run_analysis_cycle().await;
                    }
                }
            }
            tracing::debug!("Analysis loop stopped");
        }));

        lifecycle.cancel = Some(cancel);

        tracing::info!(
            "Position monitor started (prices every {}s, analysis every {}s)",
            self.inner.config.price_refresh_secs,
            self.inner.config.analysis_secs
        );
    }

    /// Stop both loops and wait for any in-flight cycle to finish
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(cancel) = lifecycle.cancel.take() else {
            return;
        };

        cancel.cancel();
        for task in lifecycle.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Monitor loop ended abnormally: {}", e);
            }
        }

        tracing::info!("Position monitor stopped");
    }

    /// Track a new position
    pub async fn add_position(&self, position: Position) -> Result<(), StoreError> {
        self.inner.store.add(position.clone()).await?;
        self.inner.guard.register_open().await;

        tracing::info!(
            position_id = %position.id,
            token = %position.token_symbol,
            entry_price = position.entry_price,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "Position added"
        );

        self.inner
            .events
            .publish(MonitorEvent::PositionAdded(position));
        self.persist_positions().await;
        Ok(())
    }

    /// Stop tracking a position without selling it
    pub async fn remove_position(&self, id: Uuid) -> Option<Position> {
        let position = self.inner.store.remove(id).await?;
        self.inner.guard.register_close().await;

        tracing::info!(
            position_id = %id,
            token = %position.token_symbol,
            "Position removed"
        );

        self.inner.events.publish(MonitorEvent::PositionRemoved {
            id,
            token_symbol: position.token_symbol.clone(),
        });
        self.persist_positions().await;
        Some(position)
    }

    /// Reload positions saved by a previous run
    ///
    /// Restored positions count toward the position limit but not toward the
    /// trade-rate window. The active count is resynced to every tracked
    /// position, restored or not. Run this before admitting anything new: each
    /// admission rewrites the positions file this reads.
    pub async fn restore_from_disk(&self) -> Result<usize, PersistenceError> {
        let Some(files) = &self.inner.state_files else {
            return Ok(0);
        };

        let mut restored = 0;
        for position in files.positions.load().await? {
            let id = position.id;
            match self.inner.store.add(position).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!(position_id = %id, "Skipping restored position: {}", e),
            }
        }

        self.inner
            .guard
            .sync_active_positions(self.inner.store.len().await)
            .await;

        tracing::info!(
            "Restored {} positions from {}",
            restored,
            files.positions.path().display()
        );
        Ok(restored)
    }

    /// Put a suspended token back into the price-refresh rotation
    pub async fn resume_price_monitoring(&self, token_address: &str) -> bool {
        let mut health = self.inner.price_health.lock().await;
        health.failures.remove(token_address);
        let resumed = health.suspended.remove(token_address);
        if resumed {
            tracing::info!(token = %token_address, "Price monitoring resumed");
        }
        resumed
    }

    pub async fn suspended_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .inner
            .price_health
            .lock()
            .await
            .suspended
            .iter()
            .cloned()
            .collect();
        tokens.sort();
        tokens
    }

    /// One price-refresh cycle
    ///
    /// Fetches each distinct token once, concurrently. A failed fetch leaves the
    /// affected positions at their last price.
    pub async fn refresh_prices(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        let mut by_token: HashMap<String, Vec<Uuid>> = HashMap::new();
        for handle in self.inner.store.handles().await {
            let position = handle.lock().await;
            if position.is_open() {
                by_token
                    .entry(position.token_address.clone())
                    .or_default()
                    .push(position.id);
            }
        }

        {
            let health = self.inner.price_health.lock().await;
            by_token.retain(|token, _| !health.suspended.contains(token));
        }

        if by_token.is_empty() {
            return report;
        }

        let fetches = by_token.keys().cloned().map(|token| {
            let prices = Arc::clone(&self.inner.prices);
            async move {
                let result = prices.get_price(&token).await;
                (token, result)
            }
        });
        let results = join_all(fetches).await;
        let fetched_at = Utc::now();

        for (token, result) in results {
            let price = result.and_then(|price| {
                if price.is_finite() && price > 0.0 {
                    Ok(price)
                } else {
                    Err(anyhow::anyhow!("invalid price {}", price))
                }
            });

            match price {
                Ok(price) => {
                    self.inner.price_health.lock().await.failures.remove(&token);

                    for id in by_token.get(&token).into_iter().flatten() {
                        match self.inner.store.update_price(*id, price, fetched_at).await {
                            Ok(_) => report.updated += 1,
                            // Closed while the fetch was in flight
                            Err(StoreError::NotFound(_)) => {}
                            Err(e) => tracing::warn!(position_id = %id, "Price update rejected: {}", e),
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(token = %token, "Price fetch failed: {:#}", e);
                    if self.record_price_failure(&token).await {
                        report.suspended.push(token);
                    }
                }
            }
        }

        if report.updated > 0 {
            self.persist_positions().await;
        }

        report
    }

    /// Count a failure; returns true when the token just got suspended
    async fn record_price_failure(&self, token_address: &str) -> bool {
        let max = self.inner.config.max_consecutive_price_failures;
        let failures = {
            let mut health = self.inner.price_health.lock().await;
            let count = health
                .failures
                .entry(token_address.to_string())
                .or_insert(0);
            *count += 1;
            let failures = *count;

            if failures < max {
                return false;
            }
            health.failures.remove(token_address);
            health.suspended.insert(token_address.to_string());
            failures
        };

        self.inner.events.alert(
            AlertSeverity::Warning,
            "Price Monitoring Suspended",
            format!(
                "{}: {} consecutive price fetch failures, polling suspended (position stays open)",
                token_address, failures
            ),
        );
        true
    }

    /// One analysis cycle
    ///
    /// Returns the handles of the exits dispatched during this cycle.
    pub async fn run_analysis_cycle(&self) -> Vec<JoinHandle<ExitOutcome>> {
        let now = Utc::now();
        let mut exits = Vec::new();

        for handle in self.inner.store.handles().await {
            let position = handle.lock().await.clone();
            if !position.is_open() {
                continue;
            }

            let history = self
                .inner
                .store
                .price_history(&position.token_address)
                .await;

            let Some(reason) = self.inner.engine.evaluate(&position, &history, now) else {
                if let Some(level) = self.inner.engine.tightened_stop_loss(&position, now) {
                    if let Err(e) = self.inner.store.tighten_stop_loss(position.id, level).await {
                        tracing::debug!(position_id = %position.id, "Stop not tightened: {}", e);
                    }
                }
                continue;
            };

            match self.inner.store.try_begin_exit(position.id).await {
                Ok(true) => {
                    tracing::info!(
                        position_id = %position.id,
                        token = %position.token_symbol,
                        price = position.current_price,
                        pnl_percent = position.pnl_percent(),
                        "Exit signal: {}",
                        reason
                    );
                    let monitor = self.clone();
                    exits.push(tokio::spawn(async move {
                        monitor.execute_exit(position.id, reason).await
                    }));
                }
                Ok(false) => {
                    tracing::debug!(position_id = %position.id, "Exit already in flight");
                }
                Err(e) => {
                    tracing::debug!(position_id = %position.id, "Skipping exit: {}", e);
                }
            }
        }

        exits
    }

    async fn execute_exit(&self, id: Uuid, reason: ExitReason) -> ExitOutcome {
        let Some(position) = self.inner.store.get(id).await else {
            return ExitOutcome::Failed {
                id,
                error: "position no longer tracked".to_string(),
            };
        };

        let instruction = SellInstruction {
            position_id: id,
            token_address: position.token_address.clone(),
            quantity: position.quantity,
            price: position.current_price,
            expected_proceeds: position.estimated_proceeds(),
        };

        let failure = match self.inner.orders.execute_order(instruction).await {
            Ok(result) if result.success => {
                return self.complete_exit(position, reason, result).await;
            }
            Ok(result) => result
                .error
                .unwrap_or_else(|| "order rejected".to_string()),
            Err(e) => format!("{:#}", e),
        };

        if let Err(e) = self.inner.store.mark_open(id).await {
            tracing::warn!(position_id = %id, "Could not reopen position: {}", e);
        }

        self.inner.events.alert(
            AlertSeverity::Warning,
            "Exit Failed",
            format!(
                "{} ({}): sell for '{}' failed: {}. Will retry next cycle",
                position.token_symbol, id, reason, failure
            ),
        );

        ExitOutcome::Failed { id, error: failure }
    }

    async fn complete_exit(
        &self,
        position: Position,
        reason: ExitReason,
        result: OrderResult,
    ) -> ExitOutcome {
        let id = position.id;
        let expected = position.estimated_proceeds();
        let proceeds = result.proceeds.unwrap_or_else(|| {
            tracing::warn!(
                position_id = %id,
                "Order filled without reported proceeds, using quoted {}",
                expected
            );
            expected
        });

        if let Some(filled) = result.filled_quantity {
            if filled < position.quantity {
                tracing::warn!(
                    position_id = %id,
                    filled,
                    quantity = position.quantity,
                    "Partial fill treated as full exit"
                );
            }
        }

        let pnl = realized_pnl(proceeds, position.initial_cost_basis);

        // An operator may have dropped the position while the sell was in flight
        let removed = self.inner.store.remove(id).await.is_some();
        self.inner.guard.record_trade(pnl).await;
        if removed {
            self.inner.guard.register_close().await;
        }

        tracing::info!(
            position_id = %id,
            token = %position.token_symbol,
            proceeds,
            cost_basis = position.initial_cost_basis,
            pnl,
            "Position closed: {}",
            reason
        );

        let mut closed = position;
        closed.status = PositionStatus::Closed;
        let token_symbol = closed.token_symbol.clone();

        self.inner.events.publish(MonitorEvent::PositionClosed {
            position: closed,
            reason,
            pnl,
        });
        if removed {
            self.inner
                .events
                .publish(MonitorEvent::PositionRemoved { id, token_symbol });
        }

        self.persist_positions().await;
        self.persist_account().await;

        ExitOutcome::Closed { id, pnl }
    }

    async fn persist_positions(&self) {
        let Some(files) = &self.inner.state_files else {
            return;
        };
        let _guard = self.inner.persist_lock.lock().await;
        let positions = self.inner.store.all().await;
        if let Err(e) = files.positions.save(&positions).await {
            tracing::error!("Failed to persist positions: {}", e);
        }
    }

    /// Save the account snapshot (also called by the binary on shutdown)
    pub async fn persist_account(&self) {
        let Some(files) = &self.inner.state_files else {
            return;
        };
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = self.inner.guard.snapshot().await;
        if let Err(e) = files.account.save(&snapshot).await {
            tracing::error!("Failed to persist account state: {}", e);
        }
    }
}
