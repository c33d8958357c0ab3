use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level engine configuration
///
/// Every section has documented defaults, so an empty file (or no file at all)
/// yields a runnable configuration. Values are validated once, by
/// [`Config::validate`], before any component is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub exit_rules: ExitRules,
    /// Per-pattern overrides keyed by pattern tag
    pub patterns: HashMap<String, PatternRules>,
    pub risk: RiskConfig,
    pub monitor: MonitorConfig,
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load configuration from an optional TOML file plus `RISKGUARD__*` env overrides
    ///
    /// Nested keys use a double underscore, e.g. `RISKGUARD__RISK__MAX_POSITIONS=3`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RISKGUARD")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Config = builder.build()?.try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(patterns = loaded.patterns.len(), "Configuration loaded");

        Ok(loaded)
    }

    /// Validate every section, including each pattern override patched onto the globals
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.exit_rules.validate("exit_rules")?;

        for (tag, patch) in &self.patterns {
            self.exit_rules
                .patched(patch)
                .validate(&format!("patterns.{}", tag))?;
        }

        self.risk.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

/// Global exit rules applied to every position unless a pattern overrides them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExitRules {
    /// Stop-loss distance from entry, negative (-10 = 10% below entry)
    pub stop_loss_percent: f64,
    /// Take-profit distance from entry, positive
    pub take_profit_percent: f64,
    pub trailing_stop_enabled: bool,
    /// Allowed pullback from the highest price seen
    pub trailing_stop_percent: f64,
    /// Unrealized profit required before the trailing stop arms
    pub trailing_activation_percent: f64,
    pub max_holding_minutes: u64,
    /// Minutes held before the stop loss is tightened (None disables tightening)
    pub tighten_after_minutes: Option<u64>,
    /// Stop-loss distance used once tightening kicks in
    pub tightened_stop_loss_percent: f64,
    pub volatility_exit_enabled: bool,
    pub volatility_lookback: usize,
    pub volatility_std_dev_multiplier: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            stop_loss_percent: -10.0,
            take_profit_percent: 25.0,
            trailing_stop_enabled: true,
            trailing_stop_percent: 5.0,        // 5% below the high
            trailing_activation_percent: 12.0, // arms at +12%
            max_holding_minutes: 240,
            tighten_after_minutes: Some(120),
            tightened_stop_loss_percent: -5.0,
            volatility_exit_enabled: true,
            volatility_lookback: 20,
            volatility_std_dev_multiplier: 2.0,
        }
    }
}

impl ExitRules {
    /// Apply a pattern override field by field
    pub fn patched(&self, patch: &PatternRules) -> ExitRules {
        ExitRules {
            stop_loss_percent: patch.stop_loss_percent.unwrap_or(self.stop_loss_percent),
            take_profit_percent: patch
                .take_profit_percent
                .unwrap_or(self.take_profit_percent),
            trailing_stop_percent: patch
                .trailing_stop_percent
                .unwrap_or(self.trailing_stop_percent),
            trailing_activation_percent: patch
                .trailing_activation_percent
                .unwrap_or(self.trailing_activation_percent),
            max_holding_minutes: patch
                .max_holding_minutes
                .unwrap_or(self.max_holding_minutes),
            volatility_lookback: patch
                .volatility_lookback
                .unwrap_or(self.volatility_lookback),
            volatility_std_dev_multiplier: patch
                .volatility_std_dev_multiplier
                .unwrap_or(self.volatility_std_dev_multiplier),
            ..self.clone()
        }
    }

    pub(crate) fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let field = |name: &str| format!("{}.{}", section, name);

        if !(self.stop_loss_percent < 0.0 && self.stop_loss_percent > -100.0) {
            return Err(ConfigError::invalid(
                field("stop_loss_percent"),
                "must be between -100 and 0 (exclusive)",
            ));
        }
        if !(self.take_profit_percent > 0.0) {
            return Err(ConfigError::invalid(
                field("take_profit_percent"),
                "must be positive",
            ));
        }
        if !(self.trailing_stop_percent > 0.0 && self.trailing_stop_percent < 100.0) {
            return Err(ConfigError::invalid(
                field("trailing_stop_percent"),
                "must be between 0 and 100 (exclusive)",
            ));
        }
        if !(self.trailing_activation_percent >= 0.0) {
            return Err(ConfigError::invalid(
                field("trailing_activation_percent"),
                "must not be negative",
            ));
        }
        if self.max_holding_minutes == 0 {
            return Err(ConfigError::invalid(
                field("max_holding_minutes"),
                "must be positive",
            ));
        }
        if self.tighten_after_minutes.is_some()
            && !(self.tightened_stop_loss_percent > self.stop_loss_percent
                && self.tightened_stop_loss_percent < self.take_profit_percent)
        {
            return Err(ConfigError::invalid(
                field("tightened_stop_loss_percent"),
                "must sit between stop_loss_percent and take_profit_percent",
            ));
        }
        if self.volatility_lookback < 2 {
            return Err(ConfigError::invalid(
                field("volatility_lookback"),
                "needs at least 2 samples",
            ));
        }
        if !(self.volatility_std_dev_multiplier > 0.0) {
            return Err(ConfigError::invalid(
                field("volatility_std_dev_multiplier"),
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Partial override of [`ExitRules`] selected by a position's pattern tag
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatternRules {
    pub stop_loss_percent: Option<f64>,
    pub take_profit_percent: Option<f64>,
    pub trailing_stop_percent: Option<f64>,
    pub trailing_activation_percent: Option<f64>,
    pub max_holding_minutes: Option<u64>,
    pub volatility_lookback: Option<usize>,
    pub volatility_std_dev_multiplier: Option<f64>,
}

/// Account-level guardrails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    pub initial_balance_lamports: i64,
    pub max_positions: usize,
    pub max_position_size_lamports: u64,
    pub max_daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    /// Drawdown that latches the emergency stop, stricter than `max_drawdown_percent`
    pub emergency_stop_threshold_percent: f64,
    pub circuit_breaker_cooldown_hours: u64,
    pub max_consecutive_losses: u32,
    pub loss_alert_threshold_percent: f64,
    pub max_trades_per_minute: usize,
    pub max_trades_per_hour: usize,
    pub max_trades_per_day: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_balance_lamports: 10_000_000_000,  // 10 SOL
            max_positions: 5,
            max_position_size_lamports: 1_000_000_000, // 1 SOL
            max_daily_loss_percent: 10.0,
            max_drawdown_percent: 20.0,
            emergency_stop_threshold_percent: 35.0,
            circuit_breaker_cooldown_hours: 8,
            max_consecutive_losses: 3,
            loss_alert_threshold_percent: 10.0,
            max_trades_per_minute: 3,
            max_trades_per_hour: 20,
            max_trades_per_day: 100,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balance_lamports <= 0 {
            return Err(ConfigError::invalid(
                "risk.initial_balance_lamports",
                "must be positive",
            ));
        }
        if self.max_positions == 0 {
            return Err(ConfigError::invalid("risk.max_positions", "must be positive"));
        }
        if self.max_position_size_lamports == 0 {
            return Err(ConfigError::invalid(
                "risk.max_position_size_lamports",
                "must be positive",
            ));
        }
        for (name, value) in [
            ("risk.max_daily_loss_percent", self.max_daily_loss_percent),
            ("risk.max_drawdown_percent", self.max_drawdown_percent),
            (
                "risk.emergency_stop_threshold_percent",
                self.emergency_stop_threshold_percent,
            ),
            ("risk.loss_alert_threshold_percent", self.loss_alert_threshold_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::invalid(name, "must be in (0, 100]"));
            }
        }
        if self.emergency_stop_threshold_percent <= self.max_drawdown_percent {
            return Err(ConfigError::invalid(
                "risk.emergency_stop_threshold_percent",
                "must be larger than max_drawdown_percent",
            ));
        }
        if self.circuit_breaker_cooldown_hours == 0 {
            return Err(ConfigError::invalid(
                "risk.circuit_breaker_cooldown_hours",
                "must be positive",
            ));
        }
        if self.max_consecutive_losses == 0 {
            return Err(ConfigError::invalid(
                "risk.max_consecutive_losses",
                "must be positive",
            ));
        }
        if self.max_trades_per_minute == 0
            || self.max_trades_per_hour == 0
            || self.max_trades_per_day == 0
        {
            return Err(ConfigError::invalid(
                "risk.max_trades_per_*",
                "trade rate limits must be positive",
            ));
        }
        Ok(())
    }
}

/// Scheduling for the monitor loops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub price_refresh_secs: u64,
    pub analysis_secs: u64,
    pub health_check_secs: u64,
    /// Consecutive failed fetches before a token is dropped from polling
    pub max_consecutive_price_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            price_refresh_secs: 10,
            analysis_secs: 30,
            health_check_secs: 60,
            max_consecutive_price_failures: 5,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.price_refresh_secs == 0 || self.analysis_secs == 0 || self.health_check_secs == 0 {
            return Err(ConfigError::invalid("monitor", "intervals must be positive"));
        }
        if self.max_consecutive_price_failures == 0 {
            return Err(ConfigError::invalid(
                "monitor.max_consecutive_price_failures",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub positions_path: PathBuf,
    pub account_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            positions_path: PathBuf::from("data/positions.json"),
            account_path: PathBuf::from("data/account.json"),
        }
    }
}
