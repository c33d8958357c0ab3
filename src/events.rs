use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ExitReason, Position};
use crate::risk::BreakerReason;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing notification; delivery is up to whoever subscribes
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the engine announces to the outside world
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    PositionAdded(Position),
    PositionRemoved {
        id: Uuid,
        token_symbol: String,
    },
    PositionClosed {
        position: Position,
        reason: ExitReason,
        pnl: i64,
    },
    CircuitBreaker {
        reason: BreakerReason,
    },
    EmergencyStop {
        reason: String,
    },
    Alert(Alert),
}

/// Broadcast channel shared by the guard and the monitor
///
/// Cloning is cheap; all clones publish into the same channel. Publishing with
/// no live subscriber simply drops the event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Log and publish an operator alert
    pub fn alert(&self, severity: AlertSeverity, title: &str, message: impl Into<String>) {
        let message = message.into();

        match severity {
            AlertSeverity::Info => tracing::info!(alert = title, "{}", message),
            AlertSeverity::Warning => tracing::warn!(alert = title, "{}", message),
            AlertSeverity::Critical => tracing::error!(alert = title, "{}", message),
        }

        self.publish(MonitorEvent::Alert(Alert {
            severity,
            title: title.to_string(),
            message,
            timestamp: Utc::now(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
