// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod risk;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, PersistenceError, StoreError};
pub use events::{Alert, AlertSeverity, EventBus, MonitorEvent};
pub use models::*;
