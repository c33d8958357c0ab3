// Position monitoring and exit execution module
pub mod executor;
pub mod exit_rules;
pub mod monitor;
pub mod position_store;
pub mod sources;

pub use executor::{ExecutionAction, ExecutionDecision, Executor, OpenRequest};
pub use exit_rules::{ExitRuleEngine, NewPosition};
pub use monitor::{ExitOutcome, MonitorState, PositionMonitor, RefreshReport};
pub use position_store::{PositionHandle, PositionStore, PriceUpdate};
pub use sources::{OrderSink, PaperOrderSink, PriceSource};
