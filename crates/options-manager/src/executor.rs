//! Exactly-once exit execution.
//!
//! `execute` takes the position lock, re-reads the position, and only then
//! decides whether to submit. The submit is time-bounded and the terminal
//! transition is written before the lock is released, so concurrent callers
//! for one position produce at most one close order.

use std::sync::Arc;

use algo_trade_core::{AppConfig, ExitGateway, ExitOrder, PositionEvent, SubmitOutcome};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ledger::{LedgerError, PositionLedger, PositionObserver};
use crate::locks::PositionGuard;
use crate::metrics::{bump, ExitCounters};
use crate::types::{ExitOutcome, ExitRequest};

#[derive(Debug, Error)]
pub enum ExitError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A fill the broker confirmed but the store has not recorded yet.
#[derive(Debug, Clone, PartialEq)]
struct PendingFill {
    price: Decimal,
    reason: String,
    filled_at: DateTime<Utc>,
}

/// Broker fills waiting to be recorded, keyed by position. An entry is
/// dropped as soon as the position turns terminal by any path.
#[derive(Debug, Default)]
struct UnrecordedFills {
    fills: DashMap<i64, PendingFill>,
}

impl PositionObserver for UnrecordedFills {
    fn on_event(&self, event: &PositionEvent) {
        if let PositionEvent::Exited(p) | PositionEvent::Cancelled(p) = event {
            if self.fills.remove(&p.id).is_some() {
                debug!(position_id = p.id, "Dropped pending fill for terminal position");
            }
        }
    }
}

pub struct ExitEngine {
    ledger: Arc<PositionLedger>,
    live: Arc<dyn ExitGateway>,
    paper: Arc<dyn ExitGateway>,
    config: watch::Receiver<AppConfig>,
    counters: Arc<ExitCounters>,
    unrecorded: Arc<UnrecordedFills>,
}

impl ExitEngine {
    /// Registers its pending-fill book with `ledger`, so build it once per
    /// ledger.
    #[must_use]
    pub fn new(
        ledger: Arc<PositionLedger>,
        live: Arc<dyn ExitGateway>,
        paper: Arc<dyn ExitGateway>,
        config: watch::Receiver<AppConfig>,
        counters: Arc<ExitCounters>,
    ) -> Self {
        let unrecorded = Arc::new(UnrecordedFills::default());
        ledger.register(unrecorded.clone());
        Self {
            ledger,
            live,
            paper,
            config,
            counters,
            unrecorded,
        }
    }

    /// # Errors
    ///
    /// Returns an error when the position cannot be read or the exit cannot
    /// be recorded. A broker-confirmed fill that failed to record is kept and
    /// retried on the next call instead of submitting again.
    pub async fn execute(&self, request: &ExitRequest) -> Result<ExitOutcome, ExitError> {
        let id = request.position_id;
        let outcome = {
            let guard = self.ledger.lock(id).await;
            self.execute_locked(&guard, request).await
        };
        if matches!(
            outcome,
            Ok(ExitOutcome::Exited(_) | ExitOutcome::AlreadyTerminal { .. })
        ) {
            self.ledger.prune_lock(id);
        }
        outcome
    }

    async fn execute_locked(
        &self,
        guard: &PositionGuard,
        request: &ExitRequest,
    ) -> Result<ExitOutcome, ExitError> {
        let id = guard.position_id();
        let position = self.ledger.get(id).await?;
        if !position.is_active() {
            bump(&self.counters.already_terminal);
            self.unrecorded.fills.remove(&id);
            info!(position_id = id, status = %position.status, "Exit skipped, position not active");
            return Ok(ExitOutcome::AlreadyTerminal {
                status: position.status,
                record: position.exit_record(),
            });
        }

        let pending = self.unrecorded.fills.get(&id).map(|p| p.value().clone());
        let fill = if let Some(pending) = pending {
            warn!(position_id = id, price = %pending.price, "Recording earlier broker fill");
            pending
        } else if let Some(price) = request.external_fill {
            bump(&self.counters.external_fills);
            PendingFill {
                price,
                reason: request.reason.clone(),
                filled_at: Utc::now(),
            }
        } else {
            match self.submit(&ExitOrder::for_position(&position)).await {
                Ok(price) => PendingFill {
                    price,
                    reason: request.reason.clone(),
                    filled_at: Utc::now(),
                },
                Err(reason) => {
                    bump(&self.counters.deferred);
                    warn!(position_id = id, reason, "Exit deferred, position stays active");
                    return Ok(ExitOutcome::Deferred { reason });
                }
            }
        };

        match self
            .ledger
            .mark_exited_locked(guard, fill.price, &fill.reason, fill.filled_at)
            .await
        {
            Ok(transition) => {
                self.unrecorded.fills.remove(&id);
                bump(&self.counters.exited);
                info!(
                    position_id = id,
                    rule = ?request.rule,
                    price = %fill.price,
                    reason = fill.reason,
                    "Exit completed"
                );
                Ok(ExitOutcome::Exited(transition.record().clone()))
            }
            Err(e) => {
                bump(&self.counters.unrecorded);
                error!(position_id = id, error = %e, "Exit filled but not recorded");
                self.unrecorded.fills.insert(id, fill);
                Err(e.into())
            }
        }
    }

    /// Submits a close order. Returns the fill price, or why there is none.
    async fn submit(&self, order: &ExitOrder) -> Result<Decimal, String> {
        let gateway = if order.paper { &self.paper } else { &self.live };
        let submit_timeout = self.config.borrow().monitor.exit_timeout();
        bump(&self.counters.submitted);
        match tokio::time::timeout(submit_timeout, gateway.submit_exit(order)).await {
            Ok(Ok(SubmitOutcome::Filled {
                order_id,
                fill_price,
            })) => {
                info!(position_id = order.position_id, order_id, price = %fill_price, "Exit order filled");
                Ok(fill_price)
            }
            Ok(Ok(SubmitOutcome::Rejected { reason })) => Err(format!("rejected: {reason}")),
            Ok(Err(e)) => Err(format!("submit failed: {e:#}")),
            Err(_) => Err(format!(
                "no confirmation within {}ms",
                submit_timeout.as_millis()
            )),
        }
    }

    /// Positions whose broker fill is awaiting a store write.
    #[must_use]
    pub fn unrecorded_count(&self) -> usize {
        self.unrecorded.fills.len()
    }
}
