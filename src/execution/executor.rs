use tokio::sync::Mutex;
use uuid::Uuid;

use super::exit_rules::NewPosition;
use super::monitor::PositionMonitor;
use crate::models::Lamports;

/// A filled buy that should become a monitored position
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub token_address: String,
    pub token_symbol: String,
    pub entry_price: f64,
    pub quantity: u64,
    pub cost_basis: Lamports,
    pub pattern_tag: Option<String>,
    pub current_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Opened { position_id: Uuid },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

/// Admission path for new positions
pub struct Executor {
    monitor: PositionMonitor,
    // One admission at a time, so two requests can't both pass the limits
    admission: Mutex<()>,
}

impl Executor {
    pub fn new(monitor: PositionMonitor) -> Self {
        Self {
            monitor,
            admission: Mutex::new(()),
        }
    }

    /// Decide whether to open a position and hand it to the monitor if so
    pub async fn open_position(&self, request: OpenRequest) -> anyhow::Result<ExecutionDecision> {
        let _admission = self.admission.lock().await;

        // Check 1: Do we already hold this token?
        if self.monitor.has_open_position(&request.token_address).await {
            return Ok(ExecutionDecision {
                action: ExecutionAction::Skip,
                reason: "Already have open position".to_string(),
            });
        }

        // Check 2: Account guardrails
        if let Err(denied) = self
            .monitor
            .guard()
            .check_admission(
                request.cost_basis,
                &request.token_symbol,
                request.entry_price,
            )
            .await
        {
            return Ok(ExecutionDecision {
                action: ExecutionAction::Skip,
                reason: format!("Risk guard: {}", denied),
            });
        }

        let position = self.monitor.engine().apply_exit_rules(NewPosition {
            token_address: request.token_address,
            token_symbol: request.token_symbol,
            entry_price: request.entry_price,
            quantity: request.quantity,
            initial_cost_basis: request.cost_basis,
            pattern_tag: request.pattern_tag,
            current_price: request.current_price,
            entry_time: None,
        });
        let position_id = position.id;
        let symbol = position.token_symbol.clone();

        self.monitor.add_position(position).await?;

        Ok(ExecutionDecision {
            action: ExecutionAction::Opened { position_id },
            reason: format!("Opened {} position", symbol),
        })
    }

    pub fn monitor(&self) -> &PositionMonitor {
        &self.monitor
    }
}
