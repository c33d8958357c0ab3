use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Named condition that blocks new positions while tripped
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerReason {
    HighDailyLoss,
    HighDrawdown,
    /// Operator-triggered, with a free-form label
    Manual(String),
}

impl fmt::Display for BreakerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerReason::HighDailyLoss => write!(f, "HIGH_DAILY_LOSS"),
            BreakerReason::HighDrawdown => write!(f, "HIGH_DRAWDOWN"),
            BreakerReason::Manual(label) => write!(f, "MANUAL:{}", label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub tripped: bool,
    pub tripped_at: DateTime<Utc>,
}

/// Observability view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub reason: String,
    pub tripped: bool,
    pub tripped_at: DateTime<Utc>,
    /// Tripped and still inside the cooldown window
    pub blocking: bool,
}

/// Circuit breakers to prevent catastrophic losses
///
/// A tripped breaker blocks admissions until `cooldown` has elapsed since it
/// tripped. Expiry only stops the blocking: the entry stays tripped until an
/// explicit [`CircuitBreakers::reset`].
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    cooldown: Duration,
    states: HashMap<BreakerReason, BreakerState>,
}

impl CircuitBreakers {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: HashMap::new(),
        }
    }

    /// Rebuild from persisted entries
    pub fn with_states(cooldown: Duration, states: Vec<(BreakerReason, BreakerState)>) -> Self {
        Self {
            cooldown,
            states: states.into_iter().collect(),
        }
    }

    /// Trip (or re-arm) a breaker; returns true if it was not tripped before
    pub fn trip(&mut self, reason: BreakerReason, now: DateTime<Utc>) -> bool {
        let was_tripped = self.is_tripped(&reason);
        self.states.insert(
            reason,
            BreakerState {
                tripped: true,
                tripped_at: now,
            },
        );
        !was_tripped
    }

    /// Clear a breaker; returns true if it was tripped
    pub fn reset(&mut self, reason: &BreakerReason) -> bool {
        match self.states.get_mut(reason) {
            Some(state) if state.tripped => {
                state.tripped = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_tripped(&self, reason: &BreakerReason) -> bool {
        self.states.get(reason).map(|s| s.tripped).unwrap_or(false)
    }

    /// Tripped and not yet cooled down
    pub fn is_blocking(&self, reason: &BreakerReason, now: DateTime<Utc>) -> bool {
        self.states
            .get(reason)
            .map(|s| self.state_blocks(s, now))
            .unwrap_or(false)
    }

    /// First breaker currently blocking admissions, if any
    pub fn first_blocking(&self, now: DateTime<Utc>) -> Option<&BreakerReason> {
        self.states
            .iter()
            .find(|(_, state)| self.state_blocks(state, now))
            .map(|(reason, _)| reason)
    }

    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> = self
            .states
            .iter()
            .map(|(reason, state)| BreakerStatus {
                reason: reason.to_string(),
                tripped: state.tripped,
                tripped_at: state.tripped_at,
                blocking: self.state_blocks(state, now),
            })
            .collect();
        statuses.sort_by(|a, b| a.reason.cmp(&b.reason));
        statuses
    }

    pub fn entries(&self) -> Vec<(BreakerReason, BreakerState)> {
        self.states
            .iter()
            .map(|(reason, state)| (reason.clone(), *state))
            .collect()
    }

    fn state_blocks(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        state.tripped && now - state.tripped_at < self.cooldown
    }
}
