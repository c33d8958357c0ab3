// Risk management module
pub mod circuit_breakers;
pub mod guard;

pub use circuit_breakers::{BreakerReason, BreakerState, BreakerStatus, CircuitBreakers};
pub use guard::{AccountRiskGuard, AccountSnapshot, AdmissionDenied, PerformanceReport, RiskMetrics};
