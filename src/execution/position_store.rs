use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Position, PositionStatus, TrailingStop};

/// Shared handle to one tracked position
pub type PositionHandle = Arc<Mutex<Position>>;

/// Trailing-stop side effects of a price update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceUpdate {
    pub trailing_activated: bool,
    pub trailing_raised: bool,
}

struct Entry {
    token_address: String,
    position: PositionHandle,
}

#[derive(Default)]
struct TokenHistory {
    samples: VecDeque<f64>,
    last_sample_at: Option<DateTime<Utc>>,
}

/// In-memory table of open positions plus a rolling price history per token
///
/// The map lock only guards membership. Each position sits behind its own mutex,
/// so the price and analysis cycles can work on different positions at once.
pub struct PositionStore {
    positions: RwLock<HashMap<Uuid, Entry>>,
    history: RwLock<HashMap<String, TokenHistory>>,
    history_capacity: usize,
}

impl PositionStore {
    /// Create a store keeping at most `history_capacity` samples per token
    pub fn new(history_capacity: usize) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            history_capacity: history_capacity.max(2),
        }
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub async fn add(&self, position: Position) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        if positions.contains_key(&position.id) {
            return Err(StoreError::Duplicate(position.id));
        }

        positions.insert(
            position.id,
            Entry {
                token_address: position.token_address.clone(),
                position: Arc::new(Mutex::new(position)),
            },
        );
        Ok(())
    }

    /// Drop a position; the token's history goes with the last position on it
    pub async fn remove(&self, id: Uuid) -> Option<Position> {
        let (removed, token_still_tracked) = {
            let mut positions = self.positions.write().await;
            let entry = positions.remove(&id)?;
            let still_tracked = positions
                .values()
                .any(|e| e.token_address == entry.token_address);
            (entry, still_tracked)
        };

        if !token_still_tracked {
            self.clear_history(&removed.token_address).await;
        }

        let position = removed.position.lock().await.clone();
        Some(position)
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        let handle = self.handle(id).await?;
        let position = handle.lock().await.clone();
        Some(position)
    }

    /// Snapshot of every tracked position
    pub async fn all(&self) -> Vec<Position> {
        let mut snapshot = Vec::new();
        for handle in self.handles().await {
            snapshot.push(handle.lock().await.clone());
        }
        snapshot
    }

    /// Cloned handles; the map lock is released before the caller touches them
    pub async fn handles(&self) -> Vec<PositionHandle> {
        self.positions
            .read()
            .await
            .values()
            .map(|e| e.position.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    pub async fn has_position_for(&self, token_address: &str) -> bool {
        self.positions
            .read()
            .await
            .values()
            .any(|e| e.token_address == token_address)
    }

    async fn handle(&self, id: Uuid) -> Option<PositionHandle> {
        self.positions
            .read()
            .await
            .get(&id)
            .map(|e| e.position.clone())
    }

    /// Apply a fresh quote to one position
    ///
    /// Records the sample in the token's history (once per timestamp), arms the
    /// trailing stop when the position's activation threshold is met, and raises
    /// an armed stop when the price sets a new high.
    pub async fn update_price(
        &self,
        id: Uuid,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<PriceUpdate, StoreError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(StoreError::InvalidPrice { id, price });
        }

        let handle = self.handle(id).await.ok_or(StoreError::NotFound(id))?;
        let mut update = PriceUpdate::default();

        let token_address = {
            let mut position = handle.lock().await;
            position.current_price = price;
            position.last_update = timestamp;

            let pnl_percent = position.pnl_percent();
            let armable = position
                .trailing_rule
                .filter(|rule| pnl_percent >= rule.activation_percent);

            if let Some(trailing) = position.trailing_stop.as_mut() {
                update.trailing_raised = trailing.observe(price);
            } else if let Some(rule) = armable {
                position.trailing_stop = Some(TrailingStop::new(rule.percent, price));
                update.trailing_activated = true;
            }

            if update.trailing_activated {
                tracing::info!(
                    position_id = %position.id,
                    token = %position.token_symbol,
                    price,
                    "Trailing stop activated"
                );
            } else if update.trailing_raised {
                tracing::debug!(
                    position_id = %position.id,
                    token = %position.token_symbol,
                    price,
                    "Trailing stop raised"
                );
            }

            position.token_address.clone()
        };

        self.record_sample(&token_address, price, timestamp).await;

        Ok(update)
    }

    async fn record_sample(&self, token_address: &str, price: f64, timestamp: DateTime<Utc>) {
        let mut history = self.history.write().await;

        // The last position on the token may have been removed since the quote was applied
        if !self.has_position_for(token_address).await {
            return;
        }

        let token_history = history.entry(token_address.to_string()).or_default();

        // Positions sharing a token see the same quote; keep one sample per fetch
        if token_history.last_sample_at == Some(timestamp) {
            return;
        }

        token_history.samples.push_back(price);
        token_history.last_sample_at = Some(timestamp);
        while token_history.samples.len() > self.history_capacity {
            token_history.samples.pop_front();
        }
    }

    /// Price samples for a token, oldest first
    pub async fn price_history(&self, token_address: &str) -> Vec<f64> {
        self.history
            .read()
            .await
            .get(token_address)
            .map(|h| h.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn clear_history(&self, token_address: &str) {
        self.history.write().await.remove(token_address);
    }

    /// Atomically move `Open -> Closing`; false when an exit is already in flight
    pub async fn try_begin_exit(&self, id: Uuid) -> Result<bool, StoreError> {
        let handle = self.handle(id).await.ok_or(StoreError::NotFound(id))?;
        let mut position = handle.lock().await;

        if position.status != PositionStatus::Open {
            return Ok(false);
        }
        position.status = PositionStatus::Closing;
        Ok(true)
    }

    /// Roll a failed exit back to `Open` so the next cycle retries it
    pub async fn mark_open(&self, id: Uuid) -> Result<(), StoreError> {
        let handle = self.handle(id).await.ok_or(StoreError::NotFound(id))?;
        let mut position = handle.lock().await;

        if position.status == PositionStatus::Closing {
            position.status = PositionStatus::Open;
        }
        Ok(())
    }

    /// Raise the stop loss of an open position; never lowers it
    pub async fn tighten_stop_loss(&self, id: Uuid, level: f64) -> Result<bool, StoreError> {
        let handle = self.handle(id).await.ok_or(StoreError::NotFound(id))?;
        let mut position = handle.lock().await;

        if !position.is_open() || !(level > position.stop_loss) {
            return Ok(false);
        }

        tracing::info!(
            position_id = %position.id,
            token = %position.token_symbol,
            old_stop = position.stop_loss,
            new_stop = level,
            "Stop loss tightened"
        );
        position.stop_loss = level;
        Ok(true)
    }
}
