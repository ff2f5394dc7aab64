//! Two-tier pnl cache.
//!
//! Tier 1 is the fast external store, written on every tick. Tier 2 is the
//! pnl carried on the authoritative position row, written at most once per
//! `tier2_write_interval_secs` per position and always on exit. A local
//! mirror of the last Tier-2 value lets the monitor resolve both tiers
//! without a store round trip.
//!
//! Settling an exit leaves a marker that later tick writes honour, so a tick
//! still in flight when the exit lands cannot resurrect pnl for the position.

use std::sync::Arc;

use algo_trade_core::{AppConfig, PnlSnapshot, PnlSource, PnlTier1Store, Position, PositionStore};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct PnlCache {
    tier1: Arc<dyn PnlTier1Store>,
    store: Arc<dyn PositionStore>,
    config: watch::Receiver<AppConfig>,
    tier2: DashMap<i64, PnlSnapshot>,
    last_tier2_write: DashMap<i64, DateTime<Utc>>,
    /// Exited positions and the final pnl persisted with the exit.
    settled: DashMap<i64, Option<PnlSnapshot>>,
}

impl PnlCache {
    #[must_use]
    pub fn new(
        tier1: Arc<dyn PnlTier1Store>,
        store: Arc<dyn PositionStore>,
        config: watch::Receiver<AppConfig>,
    ) -> Self {
        Self {
            tier1,
            store,
            config,
            tier2: DashMap::new(),
            last_tier2_write: DashMap::new(),
            settled: DashMap::new(),
        }
    }

    /// Writes a tick-derived snapshot to Tier 1, and to Tier 2 when the
    /// position's throttle window has elapsed. Ticks for settled positions
    /// are dropped.
    ///
    /// # Errors
    ///
    /// Returns the first tier write that failed.
    pub async fn record(&self, snapshot: PnlSnapshot) -> Result<()> {
        let id = snapshot.position_id;
        if self.is_settled(id) {
            debug!(position_id = id, "Dropping tick pnl for settled position");
            return Ok(());
        }

        self.tier1.put(&snapshot).await?;
        let interval = self.tier2_interval();
        let due = self
            .last_tier2_write
            .get(&id)
            .map_or(true, |last| snapshot.computed_at - *last >= interval);
        if due {
            self.write_tier2(&snapshot).await?;
        }

        // The exit settled while the writes above were in flight.
        if self.is_settled(id) {
            self.restore_settled(id).await;
        }
        Ok(())
    }

    fn tier2_interval(&self) -> Duration {
        self.config.borrow().monitor.tier2_write_interval()
    }

    #[must_use]
    pub fn is_settled(&self, position_id: i64) -> bool {
        self.settled.contains_key(&position_id)
    }

    async fn restore_settled(&self, position_id: i64) {
        let Some(final_pnl) = self.settled.get(&position_id).map(|e| e.value().clone()) else {
            return;
        };
        self.last_tier2_write.remove(&position_id);
        let result = match final_pnl {
            Some(snapshot) => {
                self.tier2
                    .insert(position_id, snapshot.clone().with_source(PnlSource::Store));
                self.tier1.put(&snapshot).await
            }
            None => {
                self.tier2.remove(&position_id);
                self.tier1.remove(position_id).await
            }
        };
        match result {
            Ok(()) => debug!(position_id, "Late tick overwritten with settled pnl"),
            Err(e) => warn!(position_id, error = %e, "Tier 1 restore failed after exit"),
        }
    }

    /// Unthrottled Tier-2 write.
    ///
    /// # Errors
    ///
    /// Returns an error when the store write fails.
    pub async fn write_tier2(&self, snapshot: &PnlSnapshot) -> Result<()> {
        self.store.update_pnl(snapshot).await?;
        self.last_tier2_write
            .insert(snapshot.position_id, snapshot.computed_at);
        self.tier2.insert(
            snapshot.position_id,
            snapshot.clone().with_source(PnlSource::Store),
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error when the Tier-1 write fails.
    pub async fn write_tier1(&self, snapshot: &PnlSnapshot) -> Result<()> {
        self.tier1.put(snapshot).await
    }

    /// # Errors
    ///
    /// Returns an error when Tier 1 is unreachable.
    pub async fn tier1(&self, position_id: i64) -> Result<Option<PnlSnapshot>> {
        self.tier1.get(position_id).await
    }

    #[must_use]
    pub fn tier2(&self, position_id: i64) -> Option<PnlSnapshot> {
        self.tier2.get(&position_id).map(|e| e.value().clone())
    }

    /// # Errors
    ///
    /// Returns an error when Tier 1 is unreachable.
    pub async fn tier1_ids(&self) -> Result<Vec<i64>> {
        self.tier1.position_ids().await
    }

    /// Positions with any process-local trace: mirror, throttle or exit
    /// marker.
    #[must_use]
    pub fn local_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .tier2
            .iter()
            .map(|e| *e.key())
            .chain(self.last_tier2_write.iter().map(|e| *e.key()))
            .chain(self.settled.iter().map(|e| *e.key()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Loads the Tier-2 mirror from a stored position.
    pub fn seed_tier2(&self, position: &Position) {
        if let Some(snapshot) = &position.last_pnl {
            self.tier2
                .insert(position.id, snapshot.clone().with_source(PnlSource::Store));
        }
    }

    /// Freshest snapshot across both tiers no older than `max_age`.
    pub async fn resolve(
        &self,
        position_id: i64,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Option<PnlSnapshot> {
        let fast = match self.tier1.get(position_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(position_id, error = %e, "Tier 1 read failed, using Tier 2 only");
                None
            }
        };
        [fast, self.tier2(position_id)]
            .into_iter()
            .flatten()
            .filter(|s| s.is_fresh(now, max_age))
            .max_by_key(|s| s.computed_at)
    }

    /// Final pnl to persist with an exit.
    ///
    /// The exit price is what the position actually realized, so it wins over
    /// the last Tier-1 mark, which can trail the fill by a tick or more. Tier 1
    /// (then the Tier-2 mirror) is only used when the price cannot anchor a
    /// percentage.
    pub async fn final_snapshot(
        &self,
        position: &Position,
        exit_price: Decimal,
        at: DateTime<Utc>,
    ) -> Option<PnlSnapshot> {
        if let Some(realized) = position.pnl_at(exit_price, at, PnlSource::Fill) {
            return Some(realized);
        }
        match self.tier1.get(position.id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(position_id = position.id, error = %e, "Tier 1 read failed at exit");
                self.tier2(position.id)
            }
        }
    }

    /// Aligns the tiers with a persisted exit. Tier 1 keeps the final value
    /// until reconciliation purges it.
    pub async fn settle(&self, position: &Position, final_pnl: Option<&PnlSnapshot>) {
        // Marked before the writes so a racing tick either sees the marker or
        // is overwritten by them.
        self.settled.insert(position.id, final_pnl.cloned());
        self.last_tier2_write.remove(&position.id);
        let Some(snapshot) = final_pnl else {
            return;
        };
        self.tier2
            .insert(position.id, snapshot.clone().with_source(PnlSource::Store));
        if let Err(e) = self.tier1.put(snapshot).await {
            warn!(position_id = position.id, error = %e, "Tier 1 write failed at exit");
        }
    }

    /// Drops every cached trace of a terminal position.
    pub async fn purge(&self, position_id: i64) {
        self.tier2.remove(&position_id);
        self.last_tier2_write.remove(&position_id);
        self.settled.remove(&position_id);
        if let Err(e) = self.tier1.remove(position_id).await {
            warn!(position_id, error = %e, "Tier 1 purge failed");
        }
    }
}
