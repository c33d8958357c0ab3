use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{ExitRules, PatternRules};
use crate::error::ConfigError;
use crate::models::{
    pnl_percent, ExitReason, Lamports, Position, PositionStatus, TrailingRule, TrailingStop,
};

/// Profit above which any volatility spike closes the position
const VOLATILITY_PROFIT_FLOOR_PERCENT: f64 = 5.0;
/// Spike size (in thresholds) that closes the position regardless of profit
const VOLATILITY_SEVERE_FACTOR: f64 = 1.5;

/// Parameters for a position about to be opened
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub token_address: String,
    pub token_symbol: String,
    pub entry_price: f64,
    pub quantity: u64,
    pub initial_cost_basis: Lamports,
    pub pattern_tag: Option<String>,
    /// Latest quote, if it already moved away from the fill
    pub current_price: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
}

/// Decides when an open position has to be closed
///
/// Pure: holds only the resolved rule sets (global plus one per pattern tag)
/// and never mutates positions.
#[derive(Debug, Clone)]
pub struct ExitRuleEngine {
    global: ExitRules,
    patterns: HashMap<String, ExitRules>,
}

impl ExitRuleEngine {
    pub fn new(
        global: ExitRules,
        patterns: HashMap<String, PatternRules>,
    ) -> Result<Self, ConfigError> {
        global.validate("exit_rules")?;

        let mut resolved = HashMap::with_capacity(patterns.len());
        for (tag, patch) in patterns {
            let rules = global.patched(&patch);
            rules.validate(&format!("patterns.{}", tag))?;
            resolved.insert(tag, rules);
        }

        Ok(Self {
            global,
            patterns: resolved,
        })
    }

    /// Rules for a pattern tag; unknown or missing tags use the global rules
    pub fn rules_for(&self, pattern_tag: Option<&str>) -> &ExitRules {
        pattern_tag
            .and_then(|tag| self.patterns.get(tag))
            .unwrap_or(&self.global)
    }

    /// Largest volatility lookback of any rule set
    pub fn history_capacity(&self) -> usize {
        self.patterns
            .values()
            .map(|r| r.volatility_lookback)
            .fold(self.global.volatility_lookback, usize::max)
    }

    /// Build a new position with its exit levels resolved from the rules
    pub fn apply_exit_rules(&self, params: NewPosition) -> Position {
        let rules = self.rules_for(params.pattern_tag.as_deref());
        let entry_time = params.entry_time.unwrap_or_else(Utc::now);
        let entry_price = params.entry_price;
        let current_price = params
            .current_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(entry_price);

        let trailing_rule = rules.trailing_stop_enabled.then(|| TrailingRule {
            percent: rules.trailing_stop_percent,
            activation_percent: rules.trailing_activation_percent,
        });

        // Already past activation at fill time: arm right away
        let trailing_stop = trailing_rule
            .filter(|rule| pnl_percent(entry_price, current_price) >= rule.activation_percent)
            .map(|rule| TrailingStop::new(rule.percent, current_price));

        let position = Position {
            id: Uuid::new_v4(),
            token_address: params.token_address,
            token_symbol: params.token_symbol,
            entry_price,
            entry_time,
            quantity: params.quantity,
            current_price,
            last_update: entry_time,
            stop_loss: entry_price * (1.0 + rules.stop_loss_percent / 100.0),
            take_profit: entry_price * (1.0 + rules.take_profit_percent / 100.0),
            trailing_rule,
            trailing_stop,
            initial_cost_basis: params.initial_cost_basis,
            pattern_tag: params.pattern_tag,
            status: PositionStatus::Open,
        };

        tracing::debug!(
            position_id = %position.id,
            token = %position.token_symbol,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            trailing_armed = position.trailing_stop.is_some(),
            "Exit rules applied"
        );

        position
    }

    /// Evaluate one position; the first matching rule wins
    ///
    /// Order: take profit, stop loss, trailing stop, max holding time, volatility.
    pub fn evaluate(
        &self,
        position: &Position,
        history: &[f64],
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        let rules = self.rules_for(position.pattern_tag.as_deref());
        let price = position.current_price;

        if price >= position.take_profit {
            return Some(ExitReason::TakeProfit {
                level: position.take_profit,
            });
        }
        if price <= position.stop_loss {
            return Some(ExitReason::StopLoss {
                level: position.stop_loss,
            });
        }

        if let Some(trailing) = &position.trailing_stop {
            if price <= trailing.stop_price {
                return Some(ExitReason::TrailingStop {
                    stop_price: trailing.stop_price,
                });
            }
        }

        let held_minutes = (now - position.entry_time).num_minutes();
        if held_minutes >= rules.max_holding_minutes as i64 {
            return Some(ExitReason::MaxHoldingTime { held_minutes });
        }

        if rules.volatility_exit_enabled {
            return volatility_exit(history, rules, position.pnl_percent());
        }

        None
    }

    /// Tightened stop level once the position has been held long enough
    ///
    /// Returns a level only when it is above the current stop.
    pub fn tightened_stop_loss(&self, position: &Position, now: DateTime<Utc>) -> Option<f64> {
        let rules = self.rules_for(position.pattern_tag.as_deref());
        let after = rules.tighten_after_minutes?;

        if (now - position.entry_time).num_minutes() < after as i64 {
            return None;
        }

        let level = position.entry_price * (1.0 + rules.tightened_stop_loss_percent / 100.0);
        (level > position.stop_loss).then_some(level)
    }
}

/// Percent returns between consecutive samples
fn returns(samples: &[f64]) -> Vec<f64> {
    samples
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect()
}

fn volatility_exit(history: &[f64], rules: &ExitRules, pnl_percent: f64) -> Option<ExitReason> {
    let lookback = rules.volatility_lookback;
    if history.len() < 2 || history.len() < lookback {
        return None;
    }

    let window = &history[history.len() - lookback..];
    let returns = returns(window);
    let last = *returns.last()?;

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let threshold = variance.sqrt() * rules.volatility_std_dev_multiplier;

    if last.abs() <= threshold {
        return None;
    }

    // Spikes close profitable positions; losing ones only on a severe spike
    if pnl_percent > VOLATILITY_PROFIT_FLOOR_PERCENT
        || last.abs() > VOLATILITY_SEVERE_FACTOR * threshold
    {
        Some(ExitReason::Volatility {
            last_return_pct: last,
            threshold_pct: threshold,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> ExitRuleEngine {
        ExitRuleEngine::new(ExitRules::default(), HashMap::new()).unwrap()
    }

    fn open(engine: &ExitRuleEngine, entry_price: f64, pattern_tag: Option<&str>) -> Position {
        engine.apply_exit_rules(NewPosition {
            token_address: "BONK-mint".to_string(),
            token_symbol: "BONK".to_string(),
            entry_price,
            quantity: 1_000_000,
            initial_cost_basis: 500_000_000,
            pattern_tag: pattern_tag.map(str::to_string),
            current_price: None,
            entry_time: None,
        })
    }

    #[test]
    fn test_levels_from_percentages() {
        let engine = engine();
        let position = open(&engine, 100.0, None);

        assert!((position.stop_loss - 90.0).abs() < 1e-9);
        assert!((position.take_profit - 125.0).abs() < 1e-9);
        assert!(position.trailing_rule.is_some());
        assert!(position.trailing_stop.is_none());
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[test]
    fn test_stop_loss_reason_text() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.current_price = 70.0;

        let reason = engine.evaluate(&position, &[], Utc::now()).unwrap();
        assert_eq!(reason.to_string(), "stop loss hit at price 90.000000");
    }

    #[test]
    fn test_take_profit() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.current_price = 126.0;

        assert!(matches!(
            engine.evaluate(&position, &[], Utc::now()),
            Some(ExitReason::TakeProfit { .. })
        ));
    }

    #[test]
    fn test_stop_loss_beats_trailing_stop() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.trailing_stop = Some(TrailingStop::new(5.0, 100.0)); // stop at 95
        position.current_price = 85.0;

        assert!(matches!(
            engine.evaluate(&position, &[], Utc::now()),
            Some(ExitReason::StopLoss { .. })
        ));
    }

    #[test]
    fn test_trailing_stop_hit() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.trailing_stop = Some(TrailingStop::new(5.0, 120.0)); // stop at 114
        position.current_price = 113.0;

        let reason = engine.evaluate(&position, &[], Utc::now()).unwrap();
        assert_eq!(reason.to_string(), "trailing stop hit at price 114.000000");
    }

    #[test]
    fn test_armed_at_creation_when_already_in_profit() {
        let engine = engine();
        let position = engine.apply_exit_rules(NewPosition {
            token_address: "WIF-mint".to_string(),
            token_symbol: "WIF".to_string(),
            entry_price: 100.0,
            quantity: 10,
            initial_cost_basis: 1_000,
            pattern_tag: None,
            current_price: Some(115.0),
            entry_time: None,
        });

        let trailing = position.trailing_stop.unwrap();
        assert_eq!(trailing.highest_price_seen, 115.0);
        assert!((trailing.stop_price - 109.25).abs() < 1e-9);
    }

    #[test]
    fn test_max_holding_time() {
        let engine = engine();
        let position = open(&engine, 100.0, None);
        let now = position.entry_time;

        assert!(engine
            .evaluate(&position, &[], now + Duration::minutes(239))
            .is_none());
        let reason = engine
            .evaluate(&position, &[], now + Duration::minutes(241))
            .unwrap();
        assert_eq!(reason.to_string(), "max holding time reached (241 minutes)");
    }

    #[test]
    fn test_pattern_overrides_holding_and_stop() {
        let mut patterns = HashMap::new();
        patterns.insert(
            "scalp".to_string(),
            PatternRules {
                stop_loss_percent: Some(-3.0),
                max_holding_minutes: Some(15),
                ..Default::default()
            },
        );
        let engine = ExitRuleEngine::new(ExitRules::default(), patterns).unwrap();

        let scalp = open(&engine, 100.0, Some("scalp"));
        assert!((scalp.stop_loss - 97.0).abs() < 1e-9);
        // Untouched field falls back to global
        assert!((scalp.take_profit - 125.0).abs() < 1e-9);

        let later = scalp.entry_time + Duration::minutes(16);
        assert!(matches!(
            engine.evaluate(&scalp, &[], later),
            Some(ExitReason::MaxHoldingTime { .. })
        ));

        // Unknown tag uses global rules
        let other = open(&engine, 100.0, Some("unknown"));
        assert!((other.stop_loss - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut patterns = HashMap::new();
        patterns.insert(
            "broken".to_string(),
            PatternRules {
                take_profit_percent: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(ExitRuleEngine::new(ExitRules::default(), patterns).is_err());
    }

    #[test]
    fn test_history_capacity_is_largest_lookback() {
        let mut patterns = HashMap::new();
        patterns.insert(
            "slow".to_string(),
            PatternRules {
                volatility_lookback: Some(50),
                ..Default::default()
            },
        );
        let engine = ExitRuleEngine::new(ExitRules::default(), patterns).unwrap();
        assert_eq!(engine.history_capacity(), 50);
    }

    #[test]
    fn test_stop_tightens_after_hold() {
        let engine = engine();
        let position = open(&engine, 100.0, None);
        let start = position.entry_time;

        assert!(engine
            .tightened_stop_loss(&position, start + Duration::minutes(60))
            .is_none());

        let level = engine
            .tightened_stop_loss(&position, start + Duration::minutes(121))
            .unwrap();
        assert!((level - 95.0).abs() < 1e-9);

        // Already tighter: nothing to do
        let mut tight = position.clone();
        tight.stop_loss = 96.0;
        assert!(engine
            .tightened_stop_loss(&tight, start + Duration::minutes(121))
            .is_none());
    }

    #[test]
    fn test_volatility_crash_exits_losing_position() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.current_price = 92.0;

        let mut history = vec![100.0; 19];
        history.push(92.0);

        match engine.evaluate(&position, &history, Utc::now()) {
            Some(ExitReason::Volatility {
                last_return_pct,
                threshold_pct,
            }) => {
                assert!((last_return_pct + 8.0).abs() < 1e-9);
                assert!(last_return_pct.abs() > threshold_pct);
            }
            other => panic!("expected volatility exit, got {:?}", other),
        }
    }

    /// Steady ±1% chop, then a +3% move: above 2σ but under the severe band
    fn moderate_spike_history() -> Vec<f64> {
        let mut price = 100.0;
        let mut history = vec![price];
        for i in 0..18 {
            price *= if i % 2 == 0 { 1.01 } else { 0.99 };
            history.push(price);
        }
        history.push(price * 1.03);
        history
    }

    #[test]
    fn test_moderate_spike_exits_profitable_position() {
        let engine = engine();
        let history = moderate_spike_history();
        let mut position = open(&engine, 95.0, None);
        position.current_price = *history.last().unwrap();
        assert!(position.pnl_percent() > 5.0);

        match engine.evaluate(&position, &history, Utc::now()) {
            Some(ExitReason::Volatility {
                last_return_pct,
                threshold_pct,
            }) => {
                assert!((last_return_pct - 3.0).abs() < 1e-6);
                assert!(last_return_pct > threshold_pct);
                assert!(last_return_pct <= 1.5 * threshold_pct);
            }
            other => panic!("expected volatility exit, got {:?}", other),
        }
    }

    #[test]
    fn test_moderate_spike_keeps_small_gain_open() {
        let engine = engine();
        let history = moderate_spike_history();
        let mut position = open(&engine, 100.0, None);
        position.current_price = *history.last().unwrap();
        assert!(position.pnl_percent() <= 5.0);

        assert!(engine.evaluate(&position, &history, Utc::now()).is_none());
    }

    #[test]
    fn test_volatility_ignores_steady_chop() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.current_price = 101.0;

        let history: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();

        assert!(engine.evaluate(&position, &history, Utc::now()).is_none());
    }

    #[test]
    fn test_volatility_needs_full_lookback() {
        let engine = engine();
        let mut position = open(&engine, 100.0, None);
        position.current_price = 92.0;

        let history = vec![100.0, 100.0, 100.0, 92.0];
        assert!(engine.evaluate(&position, &history, Utc::now()).is_none());
    }
}
