//! Periodic repair of the derived state.
//!
//! A pass compares every authoritative-active position against feed
//! coverage, the active cache and both pnl tiers, fixes what drifted and
//! counts the fix. It never changes a position's status.

use std::collections::HashSet;
use std::sync::Arc;

use algo_trade_core::{AppConfig, MarketFeed, Position, PositionStore};
use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{ActivePositionCache, PnlCache};
use crate::metrics::ReconcileCounters;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub subscriptions_restored: usize,
    pub projections_restored: usize,
    pub projections_removed: usize,
    pub pnl_repaired: usize,
    pub tier1_purged: usize,
    pub errors: usize,
}

impl ReconcileReport {
    #[must_use]
    pub fn repairs(&self) -> usize {
        self.subscriptions_restored
            + self.projections_restored
            + self.projections_removed
            + self.pnl_repaired
            + self.tier1_purged
    }

    fn record(&self, counters: &ReconcileCounters) {
        use std::sync::atomic::Ordering::Relaxed;
        let add = |c: &std::sync::atomic::AtomicU64, n: usize| {
            c.fetch_add(n as u64, Relaxed);
        };
        add(&counters.passes, 1);
        add(&counters.subscriptions_restored, self.subscriptions_restored);
        add(&counters.projections_restored, self.projections_restored);
        add(&counters.projections_removed, self.projections_removed);
        add(&counters.pnl_repaired, self.pnl_repaired);
        add(&counters.tier1_purged, self.tier1_purged);
        add(&counters.errors, self.errors);
    }
}

pub struct ReconciliationService {
    store: Arc<dyn PositionStore>,
    cache: Arc<ActivePositionCache>,
    pnl: Arc<PnlCache>,
    feed: Arc<dyn MarketFeed>,
    config: watch::Receiver<AppConfig>,
    counters: Arc<ReconcileCounters>,
}

impl ReconciliationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn PositionStore>,
        cache: Arc<ActivePositionCache>,
        pnl: Arc<PnlCache>,
        feed: Arc<dyn MarketFeed>,
        config: watch::Receiver<AppConfig>,
        counters: Arc<ReconcileCounters>,
    ) -> Self {
        Self {
            store,
            cache,
            pnl,
            feed,
            config,
            counters,
        }
    }

    /// One full pass. Per-position failures are counted and skipped.
    pub async fn run_pass(&self) -> ReconcileReport {
        let tolerance = self.config.borrow().monitor.pnl_tolerance_pct;
        let mut report = ReconcileReport::default();

        let active = match self.store.active_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Reconciliation could not list active positions");
                report.errors += 1;
                report.record(&self.counters);
                return report;
            }
        };
        let active_ids: HashSet<i64> = active.iter().map(|p| p.id).collect();

        for position in &active {
            report.checked += 1;
            if let Err(e) = self.reconcile_position(position, tolerance, &mut report).await {
                report.errors += 1;
                warn!(position_id = position.id, error = %e, "Reconciliation failed for position");
            }
        }

        for id in self.cache.position_ids() {
            if active_ids.contains(&id) {
                continue;
            }
            match self.is_terminal(id).await {
                Ok(true) => {
                    report.projections_removed += self.cache.remove_everywhere(id);
                    debug!(position_id = id, "Removed orphan projection");
                }
                // Activated after the listing; the next pass sees it.
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(position_id = id, error = %e, "Could not check cached position");
                }
            }
        }

        match self.pnl.tier1_ids().await {
            Ok(mut ids) => {
                // Exit markers and mirrors can outlive their Tier-1 entry.
                ids.extend(self.pnl.local_ids());
                ids.sort_unstable();
                ids.dedup();
                for id in ids.into_iter().filter(|id| !active_ids.contains(id)) {
                    match self.is_terminal(id).await {
                        Ok(true) => {
                            self.pnl.purge(id).await;
                            report.tier1_purged += 1;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            warn!(position_id = id, error = %e, "Could not check cached pnl");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Could not list Tier 1 entries");
            }
        }

        report.record(&self.counters);
        if report.repairs() > 0 || report.errors > 0 {
            info!(
                checked = report.checked,
                repairs = report.repairs(),
                errors = report.errors,
                "Reconciliation pass repaired drift"
            );
        }
        report
    }

    /// Missing rows count as terminal: nothing should be cached for them.
    async fn is_terminal(&self, id: i64) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .map_or(true, |p| p.is_terminal()))
    }

    async fn reconcile_position(
        &self,
        position: &Position,
        tolerance: Decimal,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if !self.feed.is_subscribed(&position.instrument) {
            self.feed.subscribe(&position.instrument)?;
            report.subscriptions_restored += 1;
            info!(position_id = position.id, instrument = %position.instrument, "Restored feed subscription");
        }

        match self.cache.projection_count(position.id) {
            1 => {}
            0 => {
                self.cache.upsert(position);
                report.projections_restored += 1;
                info!(position_id = position.id, "Restored missing projection");
            }
            n => {
                self.cache.remove_everywhere(position.id);
                self.cache.upsert(position);
                report.projections_restored += 1;
                info!(position_id = position.id, copies = n, "Collapsed duplicate projections");
            }
        }

        // Tier 2 as persisted, not the local mirror.
        let tier2 = position.last_pnl.as_ref();
        match (self.pnl.tier1(position.id).await?, tier2) {
            (Some(fast), Some(slow)) if (fast.pnl_pct - slow.pnl_pct).abs() < tolerance => {}
            (Some(fast), _) => {
                self.pnl.write_tier2(&fast).await?;
                report.pnl_repaired += 1;
                debug!(position_id = position.id, pnl_pct = %fast.pnl_pct, "Tier 2 pnl refreshed from Tier 1");
            }
            (None, Some(slow)) => {
                self.pnl.write_tier1(slow).await?;
                self.pnl.seed_tier2(position);
                report.pnl_repaired += 1;
                debug!(position_id = position.id, "Tier 1 pnl seeded from Tier 2");
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Runs passes every `reconcile_interval_secs` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Reconciliation loop started");
        loop {
            let period = std::time::Duration::from_secs(
                self.config.borrow().monitor.reconcile_interval_secs,
            );
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(period) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_pass().await;
        }
        info!("Reconciliation loop stopped");
    }
}
