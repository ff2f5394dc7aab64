//! Per-position async locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One mutex per position id, created on first use.
#[derive(Debug, Default)]
pub struct PositionLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

/// Proof that the caller holds a position's lock.
#[derive(Debug)]
pub struct PositionGuard {
    position_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl PositionGuard {
    #[must_use]
    pub fn position_id(&self) -> i64 {
        self.position_id
    }
}

impl PositionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, position_id: i64) -> PositionGuard {
        // Clone the Arc out so no map shard is held across the await.
        let mutex = self
            .locks
            .entry(position_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PositionGuard {
            position_id,
            _guard: mutex.lock_owned().await,
        }
    }

    /// Drops the lock entry if nobody holds or waits on it.
    pub fn prune(&self, position_id: i64) {
        self.locks
            .remove_if(&position_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
