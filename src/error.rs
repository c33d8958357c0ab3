use thiserror::Error;
use uuid::Uuid;

/// Invalid or unloadable configuration. Always fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while reading or writing the JSON state files
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the in-memory position store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {0} is already tracked")]
    Duplicate(Uuid),

    #[error("rejected price {price} for position {id}")]
    InvalidPrice { id: Uuid, price: f64 },
}
