//! Service wiring: builds every component once and runs the actors.
//!
//! Tick ingestion, fill handling, underlying signals, the monitor loop and
//! the reconciliation loop run concurrently and share state only through
//! the handles built here.

use std::sync::Arc;

use algo_trade_core::{
    AppConfig, ExitGateway, MarketFeed, MarketTick, OrderUpdate, PnlTier1Store, PositionStore,
    UnderlyingSignal,
};
use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::bracket::BracketFillRegistry;
use crate::cache::{ActivePositionCache, PnlCache};
use crate::context::ContextBuilder;
use crate::engine::RuleEngine;
use crate::executor::ExitEngine;
use crate::feed::{FeedSubscriptions, TickProcessor};
use crate::fills::FillHandler;
use crate::ledger::PositionLedger;
use crate::metrics::EngineMetrics;
use crate::monitor::MonitorLoop;
use crate::paper::PaperExitGateway;
use crate::reconcile::ReconciliationService;
use crate::underlying::UnderlyingTracker;

/// External collaborators the engine is built around.
pub struct Collaborators {
    pub store: Arc<dyn PositionStore>,
    pub tier1: Arc<dyn PnlTier1Store>,
    pub feed: Arc<dyn MarketFeed>,
    /// Live order gateway. Paper positions bypass it.
    pub gateway: Arc<dyn ExitGateway>,
}

/// Inbound event streams.
pub struct Inputs {
    pub ticks: mpsc::Receiver<MarketTick>,
    pub order_updates: mpsc::Receiver<OrderUpdate>,
    pub underlying: mpsc::Receiver<UnderlyingSignal>,
}

pub struct OptionsManager {
    pub ledger: Arc<PositionLedger>,
    pub cache: Arc<ActivePositionCache>,
    pub pnl: Arc<PnlCache>,
    pub exits: Arc<ExitEngine>,
    pub ticks: Arc<TickProcessor>,
    pub fills: Arc<FillHandler>,
    pub brackets: Arc<BracketFillRegistry>,
    pub underlying: Arc<UnderlyingTracker>,
    pub metrics: Arc<EngineMetrics>,
    store: Arc<dyn PositionStore>,
    feed: Arc<dyn MarketFeed>,
    config: watch::Receiver<AppConfig>,
}

impl OptionsManager {
    /// Builds the component graph. Observers are registered cache first so
    /// feed coverage sees removals.
    #[must_use]
    pub fn new(deps: Collaborators, config: watch::Receiver<AppConfig>) -> Self {
        let metrics = Arc::new(EngineMetrics::default());

        let pnl = Arc::new(PnlCache::new(deps.tier1, deps.store.clone(), config.clone()));
        let ledger = Arc::new(PositionLedger::new(deps.store.clone(), pnl.clone()));
        let cache = Arc::new(ActivePositionCache::new());
        let brackets = Arc::new(BracketFillRegistry::new());

        ledger.register(cache.clone());
        ledger.register(Arc::new(FeedSubscriptions::new(
            deps.feed.clone(),
            cache.clone(),
        )));
        ledger.register(brackets.clone());

        let exits = Arc::new(ExitEngine::new(
            ledger.clone(),
            deps.gateway,
            Arc::new(PaperExitGateway::new(cache.clone())),
            config.clone(),
            metrics.exits.clone(),
        ));

        Self {
            ticks: Arc::new(TickProcessor::new(cache.clone(), pnl.clone())),
            fills: Arc::new(FillHandler::new(ledger.clone(), brackets.clone())),
            underlying: Arc::new(UnderlyingTracker::new()),
            ledger,
            cache,
            pnl,
            exits,
            brackets,
            metrics,
            store: deps.store,
            feed: deps.feed,
            config,
        }
    }

    /// Rebuilds the cache, the Tier-2 mirror and feed coverage from the
    /// store's active positions. Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list active positions.
    pub async fn bootstrap(&self) -> Result<usize> {
        let active = self.store.active_positions().await?;
        self.cache.rebuild(&active);
        for position in &active {
            self.pnl.seed_tier2(position);
            if !self.feed.is_subscribed(&position.instrument) {
                if let Err(e) = self.feed.subscribe(&position.instrument) {
                    warn!(position_id = position.id, error = %e, "Subscribe failed at startup");
                }
            }
        }
        info!(positions = active.len(), "Active positions loaded");
        Ok(active.len())
    }

    #[must_use]
    pub fn monitor(&self) -> MonitorLoop {
        MonitorLoop::new(
            self.cache.clone(),
            ContextBuilder::new(
                self.ledger.clone(),
                self.pnl.clone(),
                self.brackets.clone(),
                self.underlying.clone(),
            ),
            RuleEngine::new(self.metrics.rules.clone()),
            self.exits.clone(),
            self.config.clone(),
        )
    }

    #[must_use]
    pub fn reconciler(&self) -> ReconciliationService {
        ReconciliationService::new(
            self.store.clone(),
            self.cache.clone(),
            self.pnl.clone(),
            self.feed.clone(),
            self.config.clone(),
            self.metrics.reconcile.clone(),
        )
    }

    /// Bootstraps, then runs every actor until `shutdown` flips or an input
    /// stream closes.
    ///
    /// # Errors
    ///
    /// Returns an error if bootstrap fails or an actor task panics.
    pub async fn run(&self, inputs: Inputs, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.bootstrap().await?;

        let Inputs {
            ticks,
            order_updates,
            mut underlying,
        } = inputs;

        let monitor = self.monitor();
        let reconciler = self.reconciler();
        let tick_processor = self.ticks.clone();
        let fills = self.fills.clone();
        let tracker = self.underlying.clone();

        let mut tasks = tokio::task::JoinSet::new();
        {
            let shutdown = shutdown.clone();
            tasks.spawn(async move { monitor.run(shutdown).await });
        }
        {
            let shutdown = shutdown.clone();
            tasks.spawn(async move { reconciler.run(shutdown).await });
        }
        tasks.spawn(async move { tick_processor.run(ticks).await });
        tasks.spawn(async move { fills.run(order_updates).await });
        tasks.spawn(async move {
            while let Some(signal) = underlying.recv().await {
                tracker.record(&signal);
            }
        });

        info!("Options manager running");
        // Any actor finishing (shutdown or closed input) stops the rest.
        if let Some(first) = tasks.join_next().await {
            first?;
        }
        tasks.shutdown().await;

        let metrics = self.metrics.snapshot();
        info!(
            exits = metrics.exits_completed,
            deferred = metrics.exits_deferred,
            reconcile_repairs = metrics.reconcile_repairs,
            "Options manager stopped"
        );
        Ok(())
    }
}
