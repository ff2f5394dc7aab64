use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use algo_trade_core::{NewPosition, PnlSnapshot, Position, PositionStatus, PositionStore};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Process-local position store for paper sessions and tests.
#[derive(Debug)]
pub struct MemoryPositionStore {
    rows: RwLock<BTreeMap<i64, Position>>,
    next_id: AtomicI64,
}

impl Default for MemoryPositionStore {
    fn default() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryPositionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, terminal ones included.
    #[must_use]
    pub fn all(&self) -> Vec<Position> {
        self.rows.read().values().cloned().collect()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn insert(&self, new: NewPosition, now: DateTime<Utc>) -> Result<Position> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let position = Position::pending(id, new, now)?;
        self.rows.write().insert(id, position.clone());
        Ok(position)
    }

    async fn get(&self, id: i64) -> Result<Option<Position>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    /// Same columns as the Postgres store: pnl belongs to `update_pnl` and
    /// exit fields to `finalize_exit`.
    async fn update(&self, position: &Position) -> Result<()> {
        let mut rows = self.rows.write();
        let Some(row) = rows.get_mut(&position.id) else {
            bail!("position {} does not exist", position.id);
        };
        row.status = position.status;
        row.entry_price = position.entry_price;
        row.entered_at = position.entered_at;
        row.peak_pnl_pct = position.peak_pnl_pct;
        row.peak_pnl_rupees = position.peak_pnl_rupees;
        row.metadata.clone_from(&position.metadata);
        Ok(())
    }

    async fn finalize_exit(
        &self,
        position: &Position,
        final_pnl: Option<&PnlSnapshot>,
    ) -> Result<()> {
        let mut rows = self.rows.write();
        let Some(row) = rows.get_mut(&position.id) else {
            bail!("position {} does not exist", position.id);
        };
        if row.status != PositionStatus::Active {
            bail!("position {} is {} in store, not active", position.id, row.status);
        }
        let mut finalized = position.clone();
        if let Some(pnl) = final_pnl {
            finalized.last_pnl = Some(pnl.clone());
        }
        *row = finalized;
        Ok(())
    }

    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(&snapshot.position_id) {
            if row.is_active() {
                row.last_pnl = Some(snapshot.clone());
            }
        }
        Ok(())
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algo_trade_core::{InstrumentKey, PnlSource};
    use rust_decimal_macros::dec;

    async fn active(store: &MemoryPositionStore) -> Position {
        let now = Utc::now();
        let mut position = store
            .insert(
                NewPosition::long(InstrumentKey::new("NSE_FNO", "43251"), dec!(100), 50),
                now,
            )
            .await
            .unwrap();
        position.activate(None, now).unwrap();
        store.update(&position).await.unwrap();
        position
    }

    #[tokio::test]
    async fn update_keeps_newer_pnl() {
        let store = MemoryPositionStore::new();
        let mut loaded = active(&store).await;

        let tick = loaded
            .pnl_at(dec!(112), Utc::now(), PnlSource::Tick)
            .unwrap();
        store.update_pnl(&tick).await.unwrap();

        // Copy loaded before the pnl write, persisted after it.
        assert!(loaded.raise_peak(dec!(8), dec!(400)));
        store.update(&loaded).await.unwrap();

        let stored = store.get(loaded.id).await.unwrap().unwrap();
        assert_eq!(stored.peak_pnl_pct, dec!(8));
        assert_eq!(stored.last_pnl, Some(tick));
    }

    #[tokio::test]
    async fn pnl_writes_stop_at_exit() {
        let store = MemoryPositionStore::new();
        let mut position = active(&store).await;
        let now = Utc::now();

        position.mark_exited(dec!(90), "SL HIT", now).unwrap();
        let realized = position.pnl_at(dec!(90), now, PnlSource::Fill).unwrap();
        store.finalize_exit(&position, Some(&realized)).await.unwrap();
        assert!(store.finalize_exit(&position, Some(&realized)).await.is_err());

        let late = position.pnl_at(dec!(130), now, PnlSource::Tick).unwrap();
        store.update_pnl(&late).await.unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Exited);
        assert_eq!(stored.exit_price, Some(dec!(90)));
        assert_eq!(stored.last_pnl, Some(realized));
        assert!(store.active_positions().await.unwrap().is_empty());
    }
}
