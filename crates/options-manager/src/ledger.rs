//! Position lifecycle owner.
//!
//! Every mutation of a position runs under its lock as load, transition,
//! persist, then publish. Subscribers (caches, feed coverage, bracket
//! registry) learn about transitions only through [`PositionEvent`]s.

use std::sync::Arc;

use algo_trade_core::{
    ExitTransition, NewPosition, PnlSnapshot, Position, PositionError, PositionEvent,
    PositionStore,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::PnlCache;
use crate::locks::{PositionGuard, PositionLocks};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("position {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Synchronous subscriber, called in registration order while the
/// position's lock is held.
pub trait PositionObserver: Send + Sync {
    fn on_event(&self, event: &PositionEvent);
}

pub struct PositionLedger {
    store: Arc<dyn PositionStore>,
    pnl: Arc<PnlCache>,
    locks: PositionLocks,
    observers: RwLock<Vec<Arc<dyn PositionObserver>>>,
    events: broadcast::Sender<PositionEvent>,
}

impl PositionLedger {
    #[must_use]
    pub fn new(store: Arc<dyn PositionStore>, pnl: Arc<PnlCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            pnl,
            locks: PositionLocks::new(),
            observers: RwLock::new(Vec::new()),
            events,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub fn register(&self, observer: Arc<dyn PositionObserver>) {
        self.observers.write().push(observer);
    }

    /// Async stream of every published event, for consumers outside the
    /// lock (audit, notifications).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    pub async fn lock(&self, position_id: i64) -> PositionGuard {
        self.locks.acquire(position_id).await
    }

    pub fn prune_lock(&self, position_id: i64) {
        self.locks.prune(position_id);
    }

    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn publish(&self, event: PositionEvent) {
        debug!(
            position_id = event.position().id,
            event = event.name(),
            "Position event"
        );
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_event(&event);
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn load(&self, position_id: i64) -> Result<Position, LedgerError> {
        self.store
            .get(position_id)
            .await?
            .ok_or(LedgerError::NotFound(position_id))
    }

    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn get(&self, position_id: i64) -> Result<Position, LedgerError> {
        self.load(position_id).await
    }

    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn active_positions(&self) -> Result<Vec<Position>, LedgerError> {
        Ok(self.store.active_positions().await?)
    }

    /// Records a new pending position (entry order placed, not yet filled).
    ///
    /// # Errors
    ///
    /// Returns an error for invalid entry data or a store failure.
    pub async fn open(&self, new: NewPosition, now: DateTime<Utc>) -> Result<Position, LedgerError> {
        new.validate()?;
        let position = self.store.insert(new, now).await?;
        info!(
            position_id = position.id,
            instrument = %position.instrument,
            side = position.side.as_str(),
            quantity = position.quantity,
            "Position opened"
        );
        Ok(position)
    }

    /// `pending -> active` on entry fill.
    ///
    /// # Errors
    ///
    /// Returns an error for an illegal transition or a store failure.
    pub async fn activate(
        &self,
        position_id: i64,
        fill_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let _guard = self.lock(position_id).await;
        let mut position = self.load(position_id).await?;
        position.activate(fill_price, at)?;
        self.store.update(&position).await?;
        info!(
            position_id,
            entry_price = %position.entry_price,
            "Position activated"
        );
        self.publish(PositionEvent::Activated(position.clone()));
        Ok(position)
    }

    /// `pending|active -> cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error for an illegal transition or a store failure.
    pub async fn cancel(
        &self,
        position_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let position = {
            let _guard = self.lock(position_id).await;
            let mut position = self.load(position_id).await?;
            position.cancel(reason, at)?;
            self.store.update(&position).await?;
            info!(position_id, reason, "Position cancelled");
            self.publish(PositionEvent::Cancelled(position.clone()));
            position
        };
        self.pnl.purge(position_id).await;
        self.prune_lock(position_id);
        Ok(position)
    }

    /// Idempotent `active -> exited`.
    ///
    /// # Errors
    ///
    /// Returns an error for an illegal transition or a store failure.
    pub async fn mark_exited(
        &self,
        position_id: i64,
        exit_price: Decimal,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ExitTransition, LedgerError> {
        let result = {
            let guard = self.lock(position_id).await;
            self.mark_exited_locked(&guard, exit_price, reason, at).await
        };
        self.prune_lock(position_id);
        result
    }

    /// [`Self::mark_exited`] for a caller that already holds the lock.
    ///
    /// The terminal row and the final pnl (flushed from Tier 1) are written
    /// in one store transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for an illegal transition or a store failure; in
    /// both cases nothing was persisted.
    pub async fn mark_exited_locked(
        &self,
        guard: &PositionGuard,
        exit_price: Decimal,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ExitTransition, LedgerError> {
        let position_id = guard.position_id();
        let mut position = self.load(position_id).await?;
        let transition = position.mark_exited(exit_price, reason, at)?;
        if !transition.is_new() {
            debug!(position_id, "Exit already recorded");
            return Ok(transition);
        }

        let final_pnl: Option<PnlSnapshot> = self.pnl.final_snapshot(&position, exit_price, at).await;
        position.last_pnl.clone_from(&final_pnl);
        self.store.finalize_exit(&position, final_pnl.as_ref()).await?;
        self.pnl.settle(&position, final_pnl.as_ref()).await;

        info!(
            position_id,
            exit_price = %exit_price,
            reason,
            pnl_rupees = ?final_pnl.as_ref().map(|p| p.pnl_rupees),
            "Position exited"
        );
        self.publish(PositionEvent::Exited(position));
        Ok(transition)
    }

    /// Raises the stored high-water marks. Returns the position as stored
    /// after the call, raised or not.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn raise_peak(
        &self,
        position_id: i64,
        pnl_pct: Decimal,
        pnl_rupees: Decimal,
    ) -> Result<Position, LedgerError> {
        let _guard = self.lock(position_id).await;
        let mut position = self.load(position_id).await?;
        if position.raise_peak(pnl_pct, pnl_rupees) {
            self.store.update(&position).await?;
            self.publish(PositionEvent::Updated(position.clone()));
        }
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTier1;
    use crate::store::MemoryPositionStore;
    use algo_trade_core::{InstrumentKey, PositionStatus};
    use chrono::Duration;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl PositionObserver for Recorder {
        fn on_event(&self, event: &PositionEvent) {
            self.0.lock().push(event.name());
        }
    }

    fn ledger() -> (PositionLedger, Arc<MemoryPositionStore>) {
        let store = Arc::new(MemoryPositionStore::new());
        let pnl = Arc::new(PnlCache::new(
            Arc::new(InMemoryTier1::new()),
            store.clone(),
            tokio::sync::watch::channel(algo_trade_core::AppConfig::default()).1,
        ));
        (PositionLedger::new(store.clone(), pnl), store)
    }

    fn new_position() -> NewPosition {
        NewPosition::long(InstrumentKey::new("NSE_FNO", "43251"), dec!(100), 50)
    }

    #[tokio::test]
    async fn lifecycle_publishes_events_in_order() {
        let (ledger, _) = ledger();
        let recorder = Arc::new(Recorder::default());
        ledger.register(recorder.clone());
        let mut stream = ledger.subscribe();
        let now = Utc::now();

        let pos = ledger.open(new_position(), now).await.unwrap();
        ledger.activate(pos.id, Some(dec!(101)), now).await.unwrap();
        ledger.raise_peak(pos.id, dec!(5), dec!(250)).await.unwrap();
        ledger.raise_peak(pos.id, dec!(4), dec!(200)).await.unwrap();
        ledger.mark_exited(pos.id, dec!(104), "TP HIT", now).await.unwrap();

        assert_eq!(*recorder.0.lock(), vec!["activated", "updated", "exited"]);
        assert_eq!(stream.recv().await.unwrap().name(), "activated");
    }

    #[tokio::test]
    async fn exit_flushes_realized_pnl() {
        let (ledger, store) = ledger();
        let now = Utc::now();
        let pos = ledger.open(new_position(), now).await.unwrap();
        ledger.activate(pos.id, None, now).await.unwrap();
        ledger.mark_exited(pos.id, dec!(90), "SL HIT", now).await.unwrap();

        let stored = store.get(pos.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PositionStatus::Exited);
        let pnl = stored.last_pnl.unwrap();
        assert_eq!(pnl.pnl_rupees, dec!(-500));
        assert_eq!(pnl.pnl_pct, dec!(-10));
        assert_eq!(ledger.lock_count(), 0);
    }

    #[tokio::test]
    async fn second_exit_returns_first_record() {
        let (ledger, _) = ledger();
        let now = Utc::now();
        let pos = ledger.open(new_position(), now).await.unwrap();
        ledger.activate(pos.id, None, now).await.unwrap();

        let first = ledger.mark_exited(pos.id, dec!(120), "TP HIT", now).await.unwrap();
        let second = ledger
            .mark_exited(pos.id, dec!(80), "SL HIT", now + Duration::seconds(3))
            .await
            .unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(second.record(), first.record());
    }

    #[tokio::test]
    async fn peak_never_moves_after_exit() {
        let (ledger, _) = ledger();
        let now = Utc::now();
        let pos = ledger.open(new_position(), now).await.unwrap();
        ledger.activate(pos.id, None, now).await.unwrap();
        ledger.raise_peak(pos.id, dec!(8), dec!(400)).await.unwrap();
        ledger.mark_exited(pos.id, dec!(105), "TP HIT", now).await.unwrap();

        let after = ledger.raise_peak(pos.id, dec!(30), dec!(1500)).await.unwrap();
        assert_eq!(after.peak_pnl_pct, dec!(8));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (ledger, _) = ledger();
        let now = Utc::now();
        let pos = ledger.open(new_position(), now).await.unwrap();
        let err = ledger.mark_exited(pos.id, dec!(100), "SL HIT", now).await;
        assert!(matches!(
            err,
            Err(LedgerError::Position(PositionError::IllegalTransition { .. }))
        ));
        assert!(matches!(
            ledger.activate(999, None, now).await,
            Err(LedgerError::NotFound(999))
        ));
    }
}
