//! Monitor loop: snapshot, build context, evaluate, dispatch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use algo_trade_core::AppConfig;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{ActivePositionCache, CacheEntry};
use crate::context::ContextBuilder;
use crate::engine::RuleEngine;
use crate::executor::ExitEngine;
use crate::session;
use crate::types::{ExitOutcome, ExitRequest, RuleResult};

pub const SESSION_SWEEP_REASON: &str = "SESSION CLOSED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Held,
    Exited,
    AlreadyTerminal,
    Deferred,
    Failed,
}

/// Per-cycle tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub session_open: bool,
    pub evaluated: usize,
    pub exits_dispatched: usize,
    pub exited: usize,
    pub already_terminal: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl CycleReport {
    fn tally(&mut self, disposition: Disposition) {
        self.evaluated += 1;
        if disposition != Disposition::Held {
            self.exits_dispatched += 1;
        }
        match disposition {
            Disposition::Held => {}
            Disposition::Exited => self.exited += 1,
            Disposition::AlreadyTerminal => self.already_terminal += 1,
            Disposition::Deferred => self.deferred += 1,
            Disposition::Failed => self.failed += 1,
        }
    }
}

pub struct MonitorLoop {
    cache: Arc<ActivePositionCache>,
    contexts: ContextBuilder,
    engine: RuleEngine,
    exits: Arc<ExitEngine>,
    config: watch::Receiver<AppConfig>,
}

impl MonitorLoop {
    #[must_use]
    pub fn new(
        cache: Arc<ActivePositionCache>,
        contexts: ContextBuilder,
        engine: RuleEngine,
        exits: Arc<ExitEngine>,
        config: watch::Receiver<AppConfig>,
    ) -> Self {
        Self {
            cache,
            contexts,
            engine,
            exits,
            config,
        }
    }

    /// One cycle at `now`. Config is read once so every position in the
    /// cycle sees the same thresholds.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let config = Arc::new(self.config.borrow().clone());

        let mut seen = HashSet::new();
        let entries: Vec<CacheEntry> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|e| seen.insert(e.position_id))
            .collect();

        let open = session::is_open(&config.session, now);
        let dispositions = if open {
            join_all(
                entries
                    .iter()
                    .map(|entry| self.process(entry, config.clone(), now)),
            )
            .await
        } else {
            join_all(entries.iter().map(|entry| {
                self.dispatch(ExitRequest::manual(entry.position_id, SESSION_SWEEP_REASON))
            }))
            .await
        };

        let mut report = CycleReport {
            session_open: open,
            ..CycleReport::default()
        };
        for disposition in dispositions {
            report.tally(disposition);
        }
        if report.exits_dispatched > 0 {
            info!(
                session_open = open,
                evaluated = report.evaluated,
                exited = report.exited,
                deferred = report.deferred,
                "Monitor cycle dispatched exits"
            );
        } else {
            debug!(evaluated = report.evaluated, "Monitor cycle");
        }
        report
    }

    async fn process(
        &self,
        entry: &CacheEntry,
        config: Arc<AppConfig>,
        now: DateTime<Utc>,
    ) -> Disposition {
        let ctx = self.contexts.build(entry, config, now).await;
        match self.engine.evaluate(&ctx) {
            RuleResult::Exit(signal) => {
                self.dispatch(ExitRequest::from_signal(entry.position_id, &signal))
                    .await
            }
            RuleResult::NoAction | RuleResult::Skip { .. } => Disposition::Held,
        }
    }

    async fn dispatch(&self, request: ExitRequest) -> Disposition {
        match self.exits.execute(&request).await {
            Ok(ExitOutcome::Exited(_)) => Disposition::Exited,
            Ok(ExitOutcome::AlreadyTerminal { .. }) => Disposition::AlreadyTerminal,
            Ok(ExitOutcome::Deferred { .. }) => Disposition::Deferred,
            Err(e) => {
                error!(position_id = request.position_id, error = %e, "Exit failed");
                Disposition::Failed
            }
        }
    }

    /// Cycles until `shutdown` flips. Polls at `poll_interval_ms` while the
    /// session is open or positions remain, otherwise idles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Monitor loop started");
        loop {
            let report = self.run_cycle(Utc::now()).await;
            if report.failed > 0 {
                warn!(failed = report.failed, "Some exits could not be recorded");
            }

            let period = {
                let config = self.config.borrow();
                if report.session_open || !self.cache.is_empty() {
                    Duration::from_millis(config.monitor.poll_interval_ms)
                } else {
                    Duration::from_secs(config.monitor.idle_interval_secs)
                }
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(period) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Monitor loop stopped");
    }
}
