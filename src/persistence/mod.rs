use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::models::{Position, PositionStatus};
use crate::risk::AccountSnapshot;

const POSITIONS_FORMAT_VERSION: u32 = 1;

/// One JSON document on disk
///
/// Writes go to a sibling `.tmp` file that is then renamed over the target, so a
/// crash mid-write leaves the previous document intact. An unreadable document is
/// moved aside to `<name>.corrupt-<timestamp>` and treated as absent.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; `None` when missing or corrupt
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No state file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let backup = self.corrupt_backup_path(Utc::now());
                tracing::warn!(
                    "Corrupt state file {} ({}), moving it to {}",
                    self.path.display(),
                    e,
                    backup.display()
                );
                tokio::fs::rename(&self.path, &backup).await?;
                Ok(None)
            }
        }
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(value)?;
        let tmp = self.sibling("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }

    fn corrupt_backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.sibling(&format!("corrupt-{}", now.format("%Y%m%dT%H%M%S%.3fZ")))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", suffix));
        self.path.with_file_name(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PositionsDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    positions: Vec<Position>,
}

/// Open positions document
#[derive(Debug, Clone)]
pub struct PositionFile {
    store: JsonStore,
}

impl PositionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub async fn save(&self, positions: &[Position]) -> Result<(), PersistenceError> {
        let document = PositionsDocument {
            version: POSITIONS_FORMAT_VERSION,
            saved_at: Utc::now(),
            positions: positions.to_vec(),
        };
        self.store.save(&document).await?;

        tracing::debug!(
            "Saved {} positions to {}",
            positions.len(),
            self.path().display()
        );
        Ok(())
    }

    /// Load positions to resume monitoring
    ///
    /// An exit that was in flight at shutdown is retried: `Closing` comes back as
    /// `Open`. `Closed` entries are dropped.
    pub async fn load(&self) -> Result<Vec<Position>, PersistenceError> {
        let Some(document) = self.store.load::<PositionsDocument>().await? else {
            return Ok(Vec::new());
        };

        let positions = document
            .positions
            .into_iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .map(|mut p| {
                if p.status == PositionStatus::Closing {
                    tracing::warn!(
                        position_id = %p.id,
                        token = %p.token_symbol,
                        "Position was closing at shutdown, restoring as open"
                    );
                    p.status = PositionStatus::Open;
                }
                p
            })
            .collect();

        Ok(positions)
    }
}

/// Account snapshot document
#[derive(Debug, Clone)]
pub struct AccountFile {
    store: JsonStore,
}

impl AccountFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub async fn save(&self, snapshot: &AccountSnapshot) -> Result<(), PersistenceError> {
        self.store.save(snapshot).await
    }

    pub async fn load(&self) -> Result<Option<AccountSnapshot>, PersistenceError> {
        self.store.load().await
    }
}

/// Both state documents, as configured
#[derive(Debug, Clone)]
pub struct StateFiles {
    pub positions: PositionFile,
    pub account: AccountFile,
}

impl StateFiles {
    pub fn new(positions_path: impl Into<PathBuf>, account_path: impl Into<PathBuf>) -> Self {
        Self {
            positions: PositionFile::new(positions_path),
            account: AccountFile::new(account_path),
        }
    }

    /// `None` when persistence is disabled
    pub fn from_config(config: &PersistenceConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(&config.positions_path, &config.account_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::events::EventBus;
    use crate::models::TrailingStop;
    use crate::risk::{AccountRiskGuard, BreakerReason};
    use uuid::Uuid;

    fn test_position(symbol: &str, status: PositionStatus) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            token_address: format!("{}-mint", symbol),
            token_symbol: symbol.to_string(),
            entry_price: 0.5,
            entry_time: now,
            quantity: 2_000,
            current_price: 0.6,
            last_update: now,
            stop_loss: 0.45,
            take_profit: 0.625,
            trailing_rule: None,
            trailing_stop: Some(TrailingStop::new(5.0, 0.6)),
            initial_cost_basis: 1_000_000_000,
            pattern_tag: Some("breakout".to_string()),
            status,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = PositionFile::new(dir.path().join("positions.json"));

        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_positions_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = PositionFile::new(dir.path().join("state/positions.json"));
        let positions = vec![
            test_position("BONK", PositionStatus::Open),
            test_position("WIF", PositionStatus::Open),
        ];

        tokio_test::assert_ok!(file.save(&positions).await);
        let loaded = tokio_test::assert_ok!(file.load().await);

        assert_eq!(loaded, positions);
        assert!(!dir.path().join("state/positions.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_closing_restored_as_open_closed_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let file = PositionFile::new(dir.path().join("positions.json"));
        let closing = test_position("BONK", PositionStatus::Closing);
        let closed = test_position("WIF", PositionStatus::Closed);

        file.save(&[closing.clone(), closed]).await.unwrap();
        let loaded = file.load().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, closing.id);
        assert_eq!(loaded[0].status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_account_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::new(
            dir.path().join("positions.json"),
            dir.path().join("account.json"),
        );
        assert!(tokio_test::assert_ok!(files.account.load().await).is_none());

        let guard = AccountRiskGuard::new(RiskConfig::default(), EventBus::default()).unwrap();
        guard.record_trade(-25_000_000).await;
        guard
            .trigger_circuit_breaker(BreakerReason::Manual("ops".into()))
            .await;
        let snapshot = guard.snapshot().await;

        tokio_test::assert_ok!(files.account.save(&snapshot).await);
        let loaded = files.account.load().await.unwrap();

        assert_eq!(loaded, Some(snapshot));
    }

    #[test]
    fn test_disabled_persistence_has_no_files() {
        let config = PersistenceConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(StateFiles::from_config(&config).is_none());
        assert!(StateFiles::from_config(&PersistenceConfig::default()).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let file = PositionFile::new(&path);
        assert!(file.load().await.unwrap().is_empty());
        assert!(!path.exists());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("positions.json.corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
