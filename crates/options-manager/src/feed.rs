//! Market-data side: tick ingestion and feed coverage.

use std::sync::Arc;

use algo_trade_core::{InstrumentKey, MarketFeed, MarketTick, PositionEvent};
use anyhow::Result;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{ActivePositionCache, PnlCache};
use crate::ledger::PositionObserver;

/// Marks cached positions on each tick and pushes the pnl into the tiers.
pub struct TickProcessor {
    cache: Arc<ActivePositionCache>,
    pnl: Arc<PnlCache>,
}

impl TickProcessor {
    #[must_use]
    pub fn new(cache: Arc<ActivePositionCache>, pnl: Arc<PnlCache>) -> Self {
        Self { cache, pnl }
    }

    /// Returns how many positions the tick marked.
    pub async fn on_tick(&self, tick: &MarketTick) -> usize {
        let snapshots = self.cache.apply_tick(tick);
        let marked = snapshots.len();
        for snapshot in snapshots {
            let position_id = snapshot.position_id;
            if let Err(e) = self.pnl.record(snapshot).await {
                warn!(position_id, error = %e, "Failed to record tick pnl");
            }
        }
        marked
    }

    /// Drains ticks until the sender side closes.
    pub async fn run(&self, mut ticks: mpsc::Receiver<MarketTick>) {
        info!("Tick processor started");
        while let Some(tick) = ticks.recv().await {
            self.on_tick(&tick).await;
        }
        info!("Tick stream closed");
    }
}

/// Keeps feed subscriptions in step with position lifecycles. Register it
/// after the [`ActivePositionCache`] so removals are visible when it runs.
pub struct FeedSubscriptions {
    feed: Arc<dyn MarketFeed>,
    cache: Arc<ActivePositionCache>,
}

impl FeedSubscriptions {
    #[must_use]
    pub fn new(feed: Arc<dyn MarketFeed>, cache: Arc<ActivePositionCache>) -> Self {
        Self { feed, cache }
    }

    /// # Errors
    ///
    /// Returns an error if the feed refuses the subscription.
    pub fn ensure(&self, instrument: &InstrumentKey) -> Result<bool> {
        if self.feed.is_subscribed(instrument) {
            return Ok(false);
        }
        self.feed.subscribe(instrument)?;
        Ok(true)
    }
}

impl PositionObserver for FeedSubscriptions {
    fn on_event(&self, event: &PositionEvent) {
        match event {
            PositionEvent::Activated(p) => {
                if let Err(e) = self.ensure(&p.instrument) {
                    // Reconciliation retries the subscription.
                    warn!(position_id = p.id, instrument = %p.instrument, error = %e, "Subscribe failed");
                }
            }
            PositionEvent::Exited(p) | PositionEvent::Cancelled(p) => {
                if self.cache.has_positions_on(&p.instrument) {
                    return;
                }
                match self.feed.unsubscribe(&p.instrument) {
                    Ok(()) => debug!(instrument = %p.instrument, "Unsubscribed"),
                    Err(e) => warn!(instrument = %p.instrument, error = %e, "Unsubscribe failed"),
                }
            }
            PositionEvent::Updated(_) => {}
        }
    }
}

/// Subscription bookkeeping for feeds driven from outside the process
/// (replays, paper sessions, tests).
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    instruments: DashSet<InstrumentKey>,
}

impl SubscriptionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentKey> {
        self.instruments.iter().map(|k| k.key().clone()).collect()
    }
}

impl MarketFeed for SubscriptionSet {
    fn subscribe(&self, instrument: &InstrumentKey) -> Result<()> {
        self.instruments.insert(instrument.clone());
        Ok(())
    }

    fn unsubscribe(&self, instrument: &InstrumentKey) -> Result<()> {
        self.instruments.remove(instrument);
        Ok(())
    }

    fn is_subscribed(&self, instrument: &InstrumentKey) -> bool {
        self.instruments.contains(instrument)
    }
}
