use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::RwLock;

use super::circuit_breakers::{BreakerReason, BreakerState, BreakerStatus, CircuitBreakers};
use crate::config::RiskConfig;
use crate::error::ConfigError;
use crate::events::{AlertSeverity, EventBus, MonitorEvent};
use crate::models::{Lamports, TradeRecord};

const LEDGER_CAPACITY: usize = 1_000;

/// Why a new position was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionDenied {
    #[error("emergency stop is active")]
    EmergencyStop,

    #[error("max positions reached ({active}/{max})")]
    MaxPositions { active: usize, max: usize },

    #[error("position size {size} exceeds max {max} lamports")]
    PositionTooLarge { size: Lamports, max: Lamports },

    #[error("circuit breaker {0} is active")]
    CircuitBreaker(BreakerReason),

    #[error("trade rate limit reached: {count} trades in the last {window}")]
    RateLimited { window: &'static str, count: usize },

    #[error("invalid entry price {0}")]
    InvalidPrice(f64),
}

/// Drawdown and daily loss computed by a health check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub drawdown_percent: f64,
    pub daily_loss_percent: f64,
}

/// Read-only snapshot for `/metrics`-style consumers
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub balance: i64,
    pub high_water_mark: i64,
    pub daily_start_balance: i64,
    pub drawdown_percent: f64,
    pub daily_loss_percent: f64,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub consecutive_losses: u32,
    pub active_positions: usize,
    pub emergency_stop_active: bool,
    pub circuit_breakers: Vec<BreakerStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted account state, used to resume after a restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub current_balance: i64,
    pub high_water_mark: i64,
    pub daily_start_balance: i64,
    pub daily_start_date: NaiveDate,
    pub emergency_stop_active: bool,
    pub circuit_breakers: Vec<(BreakerReason, BreakerState)>,
    pub trade_timestamps: Vec<DateTime<Utc>>,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub consecutive_losses: u32,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AccountState {
    current_balance: i64,
    high_water_mark: i64,
    daily_start_balance: i64,
    daily_start_date: NaiveDate,
    active_position_count: usize,
    trade_timestamps: VecDeque<DateTime<Utc>>,
    circuit_breakers: CircuitBreakers,
    emergency_stop_active: bool,
    ledger: VecDeque<TradeRecord>,
    total_trades: u64,
    wins: u64,
    losses: u64,
    consecutive_losses: u32,
    drawdown_alert_latched: bool,
}

impl AccountState {
    fn drawdown_percent(&self) -> f64 {
        percent_below(self.high_water_mark, self.current_balance)
    }

    fn daily_loss_percent(&self) -> f64 {
        percent_below(self.daily_start_balance, self.current_balance)
    }

    /// Start a new trading day on UTC date change
    fn roll_daily(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_start_date {
            tracing::info!(
                "New trading day {}: daily start balance {} -> {}",
                today,
                self.daily_start_balance,
                self.current_balance
            );
            self.daily_start_date = today;
            self.daily_start_balance = self.current_balance;
        }
    }

    fn prune_trade_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        while self
            .trade_timestamps
            .front()
            .map(|ts| *ts <= cutoff)
            .unwrap_or(false)
        {
            self.trade_timestamps.pop_front();
        }
    }

    fn trades_since(&self, since: DateTime<Utc>) -> usize {
        self.trade_timestamps.iter().filter(|ts| **ts > since).count()
    }
}

/// Percentage decline of `current` below `reference` (0 when reference is not positive)
pub fn percent_below(reference: i64, current: i64) -> f64 {
    if reference <= 0 {
        return 0.0;
    }
    (reference - current) as f64 / reference as f64 * 100.0
}

/// Account-level guardrails
///
/// Tracks balance, high-water mark and trade counters, trips circuit breakers on
/// policy violations and latches the emergency stop on catastrophic drawdown.
/// Breakers only gate *new* admissions; open positions keep being monitored.
pub struct AccountRiskGuard {
    config: RiskConfig,
    state: RwLock<AccountState>,
    events: EventBus,
}

impl AccountRiskGuard {
    pub fn new(config: RiskConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;

        let now = Utc::now();
        let balance = config.initial_balance_lamports;
        let state = AccountState {
            current_balance: balance,
            high_water_mark: balance,
            daily_start_balance: balance,
            daily_start_date: now.date_naive(),
            active_position_count: 0,
            trade_timestamps: VecDeque::new(),
            circuit_breakers: CircuitBreakers::new(Self::cooldown(&config)),
            emergency_stop_active: false,
            ledger: VecDeque::new(),
            total_trades: 0,
            wins: 0,
            losses: 0,
            consecutive_losses: 0,
            drawdown_alert_latched: false,
        };

        Ok(Self {
            config,
            state: RwLock::new(state),
            events,
        })
    }

    /// Resume from a persisted snapshot
    pub fn hydrate(
        config: RiskConfig,
        events: EventBus,
        snapshot: AccountSnapshot,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::info!(
            "Restored account state: balance {} (high-water mark {}, {} trades, emergency stop: {})",
            snapshot.current_balance,
            snapshot.high_water_mark,
            snapshot.total_trades,
            snapshot.emergency_stop_active
        );

        let state = AccountState {
            current_balance: snapshot.current_balance,
            high_water_mark: snapshot.high_water_mark.max(snapshot.current_balance),
            daily_start_balance: snapshot.daily_start_balance,
            daily_start_date: snapshot.daily_start_date,
            active_position_count: 0,
            trade_timestamps: snapshot.trade_timestamps.into_iter().collect(),
            circuit_breakers: CircuitBreakers::with_states(
                Self::cooldown(&config),
                snapshot.circuit_breakers,
            ),
            emergency_stop_active: snapshot.emergency_stop_active,
            ledger: VecDeque::new(),
            total_trades: snapshot.total_trades,
            wins: snapshot.wins,
            losses: snapshot.losses,
            consecutive_losses: snapshot.consecutive_losses,
            drawdown_alert_latched: false,
        };

        Ok(Self {
            config,
            state: RwLock::new(state),
            events,
        })
    }

    fn cooldown(config: &RiskConfig) -> Duration {
        Duration::hours(config.circuit_breaker_cooldown_hours as i64)
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub async fn snapshot(&self) -> AccountSnapshot {
        let state = self.state.read().await;
        AccountSnapshot {
            current_balance: state.current_balance,
            high_water_mark: state.high_water_mark,
            daily_start_balance: state.daily_start_balance,
            daily_start_date: state.daily_start_date,
            emergency_stop_active: state.emergency_stop_active,
            circuit_breakers: state.circuit_breakers.entries(),
            trade_timestamps: state.trade_timestamps.iter().copied().collect(),
            total_trades: state.total_trades,
            wins: state.wins,
            losses: state.losses,
            consecutive_losses: state.consecutive_losses,
            saved_at: Utc::now(),
        }
    }

    /// True when a new position of `size` lamports may be opened
    pub async fn can_open_position(&self, size: Lamports, token_symbol: &str, price: f64) -> bool {
        self.check_admission(size, token_symbol, price).await.is_ok()
    }

    pub async fn check_admission(
        &self,
        size: Lamports,
        token_symbol: &str,
        price: f64,
    ) -> Result<(), AdmissionDenied> {
        self.check_admission_at(size, token_symbol, price, Utc::now())
            .await
    }

    /// Admission check with explicit timestamp (for tests and replays)
    pub async fn check_admission_at(
        &self,
        size: Lamports,
        token_symbol: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionDenied> {
        let result = {
            let state = self.state.read().await;
            self.admission_verdict(&state, size, price, now)
        };

        if let Err(ref denied) = result {
            tracing::info!(
                token = %token_symbol,
                size,
                price,
                "Admission denied: {}",
                denied
            );
        }

        result
    }

    fn admission_verdict(
        &self,
        state: &AccountState,
        size: Lamports,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionDenied> {
        if state.emergency_stop_active {
            return Err(AdmissionDenied::EmergencyStop);
        }

        if state.active_position_count >= self.config.max_positions {
            return Err(AdmissionDenied::MaxPositions {
                active: state.active_position_count,
                max: self.config.max_positions,
            });
        }

        if size > self.config.max_position_size_lamports {
            return Err(AdmissionDenied::PositionTooLarge {
                size,
                max: self.config.max_position_size_lamports,
            });
        }

        if let Some(reason) = state.circuit_breakers.first_blocking(now) {
            return Err(AdmissionDenied::CircuitBreaker(reason.clone()));
        }

        if !(price.is_finite() && price > 0.0) {
            return Err(AdmissionDenied::InvalidPrice(price));
        }

        let windows = [
            ("minute", Duration::minutes(1), self.config.max_trades_per_minute),
            ("hour", Duration::hours(1), self.config.max_trades_per_hour),
            ("day", Duration::days(1), self.config.max_trades_per_day),
        ];
        for (window, span, limit) in windows {
            let count = state.trades_since(now - span);
            if count >= limit {
                return Err(AdmissionDenied::RateLimited { window, count });
            }
        }

        Ok(())
    }

    /// Count a newly opened position against the position and rate limits
    pub async fn register_open(&self) {
        self.register_open_at(Utc::now()).await
    }

    pub async fn register_open_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.active_position_count += 1;
        state.trade_timestamps.push_back(now);
        state.prune_trade_window(now);
    }

    pub async fn register_close(&self) {
        let mut state = self.state.write().await;
        state.active_position_count = state.active_position_count.saturating_sub(1);
    }

    /// Align the active count with positions restored from disk
    pub async fn sync_active_positions(&self, count: usize) {
        self.state.write().await.active_position_count = count;
    }

    /// Book a completed trade and re-run the performance checks
    pub async fn record_trade(&self, pnl: i64) -> PerformanceReport {
        self.record_trade_at(pnl, Utc::now()).await
    }

    pub async fn record_trade_at(&self, pnl: i64, now: DateTime<Utc>) -> PerformanceReport {
        let consecutive_losses = {
            let mut state = self.state.write().await;
            state.roll_daily(now);

            state.current_balance = state.current_balance.saturating_add(pnl);
            if state.current_balance > state.high_water_mark {
                state.high_water_mark = state.current_balance;
            }

            state.total_trades += 1;
            if pnl < 0 {
                state.losses += 1;
                state.consecutive_losses += 1;
            } else {
                state.wins += 1;
                state.consecutive_losses = 0;
            }

            let record = TradeRecord {
                pnl,
                balance_after: state.current_balance,
                timestamp: now,
            };
            state.ledger.push_back(record);
            while state.ledger.len() > LEDGER_CAPACITY {
                state.ledger.pop_front();
            }

            tracing::info!(
                pnl,
                balance = state.current_balance,
                high_water_mark = state.high_water_mark,
                "Trade recorded"
            );

            state.consecutive_losses
        };

        if pnl < 0 && consecutive_losses >= self.config.max_consecutive_losses {
            self.events.alert(
                AlertSeverity::Warning,
                "Consecutive Losses",
                format!(
                    "{} consecutive losses (limit {})",
                    consecutive_losses, self.config.max_consecutive_losses
                ),
            );
        }

        self.check_performance_metrics_at(now).await
    }

    /// Periodic health check; also runs after every trade
    pub async fn check_performance_metrics(&self) -> PerformanceReport {
        self.check_performance_metrics_at(Utc::now()).await
    }

    pub async fn check_performance_metrics_at(&self, now: DateTime<Utc>) -> PerformanceReport {
        let mut trips = Vec::new();
        let mut emergency = None;
        let mut drawdown_alert = false;

        let report = {
            let mut state = self.state.write().await;
            state.roll_daily(now);
            state.prune_trade_window(now);

            let report = PerformanceReport {
                drawdown_percent: state.drawdown_percent(),
                daily_loss_percent: state.daily_loss_percent(),
            };

            if report.daily_loss_percent >= self.config.max_daily_loss_percent
                && !state
                    .circuit_breakers
                    .is_blocking(&BreakerReason::HighDailyLoss, now)
            {
                state
                    .circuit_breakers
                    .trip(BreakerReason::HighDailyLoss, now);
                trips.push((BreakerReason::HighDailyLoss, report.daily_loss_percent));
            }

            if report.drawdown_percent >= self.config.max_drawdown_percent
                && !state
                    .circuit_breakers
                    .is_blocking(&BreakerReason::HighDrawdown, now)
            {
                state.circuit_breakers.trip(BreakerReason::HighDrawdown, now);
                trips.push((BreakerReason::HighDrawdown, report.drawdown_percent));
            }

            if report.drawdown_percent >= self.config.emergency_stop_threshold_percent
                && !state.emergency_stop_active
            {
                state.emergency_stop_active = true;
                emergency = Some(report.drawdown_percent);
            }

            if report.drawdown_percent >= self.config.loss_alert_threshold_percent {
                if !state.drawdown_alert_latched {
                    state.drawdown_alert_latched = true;
                    drawdown_alert = true;
                }
            } else {
                state.drawdown_alert_latched = false;
            }

            report
        };

        for (reason, value) in trips {
            self.announce_breaker(&reason, &format!("{:.2}% crossed the limit", value));
        }

        if let Some(drawdown) = emergency {
            let reason = format!(
                "drawdown {:.2}% reached emergency threshold {:.2}%",
                drawdown, self.config.emergency_stop_threshold_percent
            );
            self.events.alert(AlertSeverity::Critical, "Emergency Stop", reason.clone());
            self.events.publish(MonitorEvent::EmergencyStop { reason });
        }

        if drawdown_alert {
            self.check_loss_alert(
                -report.drawdown_percent,
                self.config.loss_alert_threshold_percent,
            );
        }

        report
    }

    /// Alert when a loss (negative percent) breaches `threshold_percent`
    pub fn check_loss_alert(&self, pnl_percent: f64, threshold_percent: f64) -> bool {
        if pnl_percent <= -threshold_percent {
            self.events.alert(
                AlertSeverity::Warning,
                "Drawdown Breach",
                format!(
                    "drawdown {:.2}% breached threshold {:.2}%",
                    pnl_percent, threshold_percent
                ),
            );
            true
        } else {
            false
        }
    }

    /// Manual override
    pub async fn trigger_circuit_breaker(&self, reason: BreakerReason) {
        self.trigger_circuit_breaker_at(reason, Utc::now()).await
    }

    pub async fn trigger_circuit_breaker_at(&self, reason: BreakerReason, now: DateTime<Utc>) {
        self.state
            .write()
            .await
            .circuit_breakers
            .trip(reason.clone(), now);
        self.announce_breaker(&reason, "triggered manually");
    }

    pub async fn reset_circuit_breaker(&self, reason: &BreakerReason) -> bool {
        let cleared = self.state.write().await.circuit_breakers.reset(reason);
        if cleared {
            tracing::info!("Circuit breaker {} reset", reason);
        }
        cleared
    }

    /// Explicit operator reset; the emergency stop never clears on its own
    pub async fn reset_emergency_stop(&self) {
        let mut state = self.state.write().await;
        if state.emergency_stop_active {
            state.emergency_stop_active = false;
            tracing::warn!("Emergency stop reset by operator");
        }
    }

    pub async fn is_emergency_stop_active(&self) -> bool {
        self.state.read().await.emergency_stop_active
    }

    pub async fn consecutive_losses(&self) -> u32 {
        self.state.read().await.consecutive_losses
    }

    pub async fn recent_trades(&self) -> Vec<TradeRecord> {
        self.state.read().await.ledger.iter().cloned().collect()
    }

    pub async fn metrics(&self) -> RiskMetrics {
        self.metrics_at(Utc::now()).await
    }

    pub async fn metrics_at(&self, now: DateTime<Utc>) -> RiskMetrics {
        let state = self.state.read().await;
        let win_rate = if state.total_trades > 0 {
            state.wins as f64 / state.total_trades as f64 * 100.0
        } else {
            0.0
        };

        RiskMetrics {
            balance: state.current_balance,
            high_water_mark: state.high_water_mark,
            daily_start_balance: state.daily_start_balance,
            drawdown_percent: state.drawdown_percent(),
            daily_loss_percent: state.daily_loss_percent(),
            total_trades: state.total_trades,
            wins: state.wins,
            losses: state.losses,
            win_rate,
            consecutive_losses: state.consecutive_losses,
            active_positions: state.active_position_count,
            emergency_stop_active: state.emergency_stop_active,
            circuit_breakers: state.circuit_breakers.statuses(now),
            timestamp: now,
        }
    }

    fn announce_breaker(&self, reason: &BreakerReason, detail: &str) {
        self.events.alert(
            AlertSeverity::Critical,
            "Circuit Breaker",
            format!("{} tripped: {}", reason, detail),
        );
        self.events.publish(MonitorEvent::CircuitBreaker {
            reason: reason.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Alert, MonitorEvent};
    use chrono::TimeZone;
    use tokio::sync::broadcast::Receiver;

    fn test_config() -> RiskConfig {
        RiskConfig {
            initial_balance_lamports: 1_000,
            max_positions: 3,
            max_position_size_lamports: 500,
            max_daily_loss_percent: 5.0,
            max_drawdown_percent: 20.0,
            emergency_stop_threshold_percent: 35.0,
            circuit_breaker_cooldown_hours: 8,
            max_consecutive_losses: 3,
            loss_alert_threshold_percent: 10.0,
            max_trades_per_minute: 100,
            max_trades_per_hour: 100,
            max_trades_per_day: 100,
        }
    }

    fn guard_with(config: RiskConfig) -> (AccountRiskGuard, Receiver<MonitorEvent>) {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        (AccountRiskGuard::new(config, bus).unwrap(), rx)
    }

    fn drain_alerts(rx: &mut Receiver<MonitorEvent>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MonitorEvent::Alert(alert) = event {
                alerts.push(alert);
            }
        }
        alerts
    }

    /// Straightforward replay of a balance path, independent of the guard
    fn reference_drawdown(balances: &[i64]) -> f64 {
        let mut peak = balances[0];
        let mut last = balances[0];
        for &b in balances {
            if b > peak {
                peak = b;
            }
            last = b;
        }
        (peak - last) as f64 / peak as f64 * 100.0
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.max_drawdown_percent = -1.0;
        assert!(AccountRiskGuard::new(config, EventBus::default()).is_err());
    }

    #[tokio::test]
    async fn test_drawdown_matches_reference() {
        let sequences: [&[i64]; 3] = [
            &[1_000, 1_100, 1_050, 990],
            &[1_000, 900, 950, 1_200, 1_080],
            &[1_000, 1_000, 1_300, 1_250, 1_400, 1_330],
        ];

        for balances in sequences {
            let mut config = test_config();
            config.initial_balance_lamports = balances[0];
            // Keep breakers quiet; only the arithmetic is under test
            config.max_daily_loss_percent = 100.0;
            config.max_drawdown_percent = 99.0;
            config.emergency_stop_threshold_percent = 100.0;
            config.loss_alert_threshold_percent = 100.0;
            let (guard, _rx) = guard_with(config);

            for pair in balances.windows(2) {
                guard.record_trade(pair[1] - pair[0]).await;
            }

            let metrics = guard.metrics().await;
            let expected = reference_drawdown(balances);
            assert!(
                (metrics.drawdown_percent - expected).abs() < 1e-9,
                "{:?}: got {}, expected {}",
                balances,
                metrics.drawdown_percent,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_high_water_mark_tracks_new_highs() {
        let (guard, _rx) = guard_with(test_config());

        guard.record_trade(200).await;
        guard.record_trade(-50).await;

        let metrics = guard.metrics().await;
        assert_eq!(metrics.balance, 1_150);
        assert_eq!(metrics.high_water_mark, 1_200);
        assert_eq!(metrics.wins, 1);
        assert_eq!(metrics.losses, 1);
        assert_eq!(metrics.win_rate, 50.0);
    }

    #[tokio::test]
    async fn test_max_positions_blocks_regardless() {
        let (guard, _rx) = guard_with(test_config());

        for _ in 0..3 {
            assert!(guard.can_open_position(100, "SOL", 1.0).await);
            guard.register_open().await;
        }

        // Tiny, valid request still refused at capacity
        assert!(!guard.can_open_position(1, "SOL", 1.0).await);
        assert_eq!(
            guard.check_admission(1, "SOL", 1.0).await,
            Err(AdmissionDenied::MaxPositions { active: 3, max: 3 })
        );

        guard.register_close().await;
        assert!(guard.can_open_position(1, "SOL", 1.0).await);
    }

    #[tokio::test]
    async fn test_position_size_limit() {
        let (guard, _rx) = guard_with(test_config());

        assert!(guard.can_open_position(500, "SOL", 1.0).await);
        assert_eq!(
            guard.check_admission(501, "SOL", 1.0).await,
            Err(AdmissionDenied::PositionTooLarge { size: 501, max: 500 })
        );
    }

    #[tokio::test]
    async fn test_bad_price_is_denied_not_fatal() {
        let (guard, _rx) = guard_with(test_config());

        assert!(!guard.can_open_position(100, "SOL", f64::NAN).await);
        assert!(!guard.can_open_position(100, "SOL", 0.0).await);
    }

    #[tokio::test]
    async fn test_daily_loss_breaker_boundary() {
        let now = Utc::now();

        // 4.9% loss: just under the 5% limit
        let (guard, _rx) = guard_with(test_config());
        let report = guard.record_trade_at(-49, now).await;
        assert!(report.daily_loss_percent < 5.0);
        assert!(guard.can_open_position(100, "SOL", 1.0).await);

        // 5.1% loss: over the limit
        let (guard, mut rx) = guard_with(test_config());
        let report = guard.record_trade_at(-51, now).await;
        assert!(report.daily_loss_percent > 5.0);
        assert_eq!(
            guard.check_admission_at(100, "SOL", 1.0, now).await,
            Err(AdmissionDenied::CircuitBreaker(BreakerReason::HighDailyLoss))
        );

        let mut saw_breaker = false;
        while let Ok(event) = rx.try_recv() {
            if let MonitorEvent::CircuitBreaker { reason } = event {
                assert_eq!(reason, BreakerReason::HighDailyLoss);
                saw_breaker = true;
            }
        }
        assert!(saw_breaker);
    }

    #[tokio::test]
    async fn test_breaker_cools_down_after_window() {
        let (guard, _rx) = guard_with(test_config());
        let now = Utc::now();

        guard.record_trade_at(-60, now).await;
        assert!(guard
            .check_admission_at(100, "SOL", 1.0, now + Duration::hours(7))
            .await
            .is_err());
        assert!(guard
            .check_admission_at(100, "SOL", 1.0, now + Duration::hours(8))
            .await
            .is_ok());

        // Expiry does not clear the entry
        let metrics = guard.metrics_at(now + Duration::hours(9)).await;
        let daily = metrics
            .circuit_breakers
            .iter()
            .find(|b| b.reason == "HIGH_DAILY_LOSS")
            .unwrap();
        assert!(daily.tripped);
        assert!(!daily.blocking);
    }

    #[tokio::test]
    async fn test_daily_loss_breaker_rearms_on_later_breach() {
        let (guard, mut rx) = guard_with(test_config());
        let day1 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let day2 = day1 + Duration::days(1);

        guard.record_trade_at(-60, day1).await;
        assert!(guard.check_admission_at(100, "SOL", 1.0, day1).await.is_err());
        drain_alerts(&mut rx);

        // Day 1 breaker has cooled down
        assert!(guard.check_admission_at(100, "SOL", 1.0, day2).await.is_ok());

        let report = guard.record_trade_at(-60, day2).await;
        assert!(report.daily_loss_percent > 5.0);
        assert_eq!(
            guard.check_admission_at(100, "SOL", 1.0, day2).await,
            Err(AdmissionDenied::CircuitBreaker(BreakerReason::HighDailyLoss))
        );

        let alerts = drain_alerts(&mut rx);
        assert!(alerts.iter().any(|a| a.title == "Circuit Breaker"));

        let metrics = guard.metrics_at(day2).await;
        let daily = metrics
            .circuit_breakers
            .iter()
            .find(|b| b.reason == "HIGH_DAILY_LOSS")
            .unwrap();
        assert_eq!(daily.tripped_at, day2);
        assert!(daily.blocking);
    }

    #[tokio::test]
    async fn test_blocking_breaker_not_announced_twice() {
        let (guard, mut rx) = guard_with(test_config());
        let now = Utc::now();

        guard.record_trade_at(-60, now).await;
        guard.check_performance_metrics_at(now).await;

        let breaker_alerts = drain_alerts(&mut rx)
            .into_iter()
            .filter(|a| a.title == "Circuit Breaker")
            .count();
        assert_eq!(breaker_alerts, 1);
    }

    #[tokio::test]
    async fn test_manual_breaker_and_reset() {
        let (guard, _rx) = guard_with(test_config());
        let reason = BreakerReason::Manual("maintenance".to_string());

        guard.trigger_circuit_breaker(reason.clone()).await;
        assert!(!guard.can_open_position(100, "SOL", 1.0).await);

        assert!(guard.reset_circuit_breaker(&reason).await);
        assert!(guard.can_open_position(100, "SOL", 1.0).await);
    }

    #[tokio::test]
    async fn test_emergency_stop_requires_explicit_reset() {
        let (guard, mut rx) = guard_with(test_config());
        let now = Utc::now();

        // 40% drawdown: past both the 20% breaker and the 35% emergency threshold
        guard.record_trade_at(-400, now).await;
        assert!(guard.is_emergency_stop_active().await);

        // Breakers cooled down, emergency stop still blocks
        assert_eq!(
            guard
                .check_admission_at(100, "SOL", 1.0, now + Duration::days(2))
                .await,
            Err(AdmissionDenied::EmergencyStop)
        );

        let mut saw_emergency = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, MonitorEvent::EmergencyStop { .. }) {
                saw_emergency = true;
            }
        }
        assert!(saw_emergency);

        guard.reset_emergency_stop().await;
        assert!(!guard.is_emergency_stop_active().await);
    }

    #[tokio::test]
    async fn test_drawdown_breaker_distinct_from_emergency() {
        let (guard, _rx) = guard_with(RiskConfig {
            max_daily_loss_percent: 100.0,
            ..test_config()
        });
        let now = Utc::now();

        // 25% drawdown: breaker, but no emergency stop
        guard.record_trade_at(-250, now).await;
        assert!(!guard.is_emergency_stop_active().await);
        assert_eq!(
            guard.check_admission_at(100, "SOL", 1.0, now).await,
            Err(AdmissionDenied::CircuitBreaker(BreakerReason::HighDrawdown))
        );
    }

    #[tokio::test]
    async fn test_consecutive_losses_and_drawdown_alert() {
        let (guard, mut rx) = guard_with(RiskConfig {
            max_daily_loss_percent: 50.0,
            ..test_config()
        });

        for _ in 0..3 {
            guard.record_trade(-10).await;
        }

        assert_eq!(guard.consecutive_losses().await, 3);
        let alerts = drain_alerts(&mut rx);
        assert!(alerts
            .iter()
            .any(|a| a.message.contains("3 consecutive losses")));

        assert!(guard.check_loss_alert(-15.0, 10.0));
        let alerts = drain_alerts(&mut rx);
        assert!(alerts.iter().any(|a| a.title == "Drawdown Breach"));

        // Within threshold: silent
        assert!(!guard.check_loss_alert(-5.0, 10.0));
    }

    #[tokio::test]
    async fn test_win_resets_consecutive_losses() {
        let (guard, _rx) = guard_with(test_config());

        guard.record_trade(-5).await;
        guard.record_trade(-5).await;
        guard.record_trade(20).await;

        assert_eq!(guard.consecutive_losses().await, 0);
    }

    #[tokio::test]
    async fn test_trade_rate_limit_per_minute() {
        let (guard, _rx) = guard_with(RiskConfig {
            max_trades_per_minute: 2,
            max_positions: 10,
            ..test_config()
        });
        let now = Utc::now();

        guard.register_open_at(now).await;
        guard.register_open_at(now).await;

        assert_eq!(
            guard.check_admission_at(100, "SOL", 1.0, now).await,
            Err(AdmissionDenied::RateLimited {
                window: "minute",
                count: 2
            })
        );
        assert!(guard
            .check_admission_at(100, "SOL", 1.0, now + Duration::seconds(61))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_daily_start_rolls_over_at_utc_midnight() {
        let (guard, _rx) = guard_with(RiskConfig {
            max_daily_loss_percent: 50.0,
            ..test_config()
        });
        let now = Utc::now();

        guard.record_trade_at(-40, now).await;
        let report = guard.check_performance_metrics_at(now).await;
        assert!((report.daily_loss_percent - 4.0).abs() < 1e-9);

        let tomorrow = now + Duration::days(1);
        let report = guard.check_performance_metrics_at(tomorrow).await;
        assert_eq!(report.daily_loss_percent, 0.0);
        // Drawdown is measured from the high-water mark, not the day
        assert!((report.drawdown_percent - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_hydrate_round_trip() {
        let (guard, _rx) = guard_with(test_config());
        guard.record_trade(120).await;
        guard.record_trade(-30).await;
        guard
            .trigger_circuit_breaker(BreakerReason::Manual("ops".into()))
            .await;

        let snapshot = guard.snapshot().await;
        let restored =
            AccountRiskGuard::hydrate(test_config(), EventBus::default(), snapshot.clone())
                .unwrap();

        let metrics = restored.metrics().await;
        assert_eq!(metrics.balance, 1_090);
        assert_eq!(metrics.high_water_mark, 1_120);
        assert_eq!(metrics.total_trades, 2);
        assert!(!restored.can_open_position(100, "SOL", 1.0).await);
    }
}
