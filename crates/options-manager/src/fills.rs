//! Broker order-status handling.
//!
//! Fill confirmations drive the same ledger transitions the monitor uses, so
//! a fill racing an engine-initiated exit still yields a single exit.

use std::sync::Arc;

use algo_trade_core::{OrderPurpose, OrderStatus, OrderUpdate, PositionError};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bracket::BracketFillRegistry;
use crate::ledger::{LedgerError, PositionLedger};
use crate::types::BracketFill;

/// What an order update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FillAction {
    Activated,
    Cancelled,
    Exited,
    AlreadyExited,
    BracketRecorded,
    /// Nothing to change (duplicate, late or failed order).
    Ignored,
}

pub struct FillHandler {
    ledger: Arc<PositionLedger>,
    brackets: Arc<BracketFillRegistry>,
}

impl FillHandler {
    #[must_use]
    pub fn new(ledger: Arc<PositionLedger>, brackets: Arc<BracketFillRegistry>) -> Self {
        Self { ledger, brackets }
    }

    /// # Errors
    ///
    /// Returns store failures and unknown positions. Transitions that are no
    /// longer legal (a duplicate entry fill, a reject after cancel) are
    /// reported as [`FillAction::Ignored`].
    pub async fn on_order_update(&self, update: &OrderUpdate) -> Result<FillAction, LedgerError> {
        let id = update.position_id;
        let result = match (&update.purpose, &update.status) {
            (OrderPurpose::Entry, OrderStatus::Filled { price }) => self
                .ledger
                .activate(id, Some(*price), update.timestamp)
                .await
                .map(|_| FillAction::Activated),
            (OrderPurpose::Entry, OrderStatus::Rejected { reason }) => self
                .ledger
                .cancel(id, &format!("entry rejected: {reason}"), update.timestamp)
                .await
                .map(|_| FillAction::Cancelled),
            (OrderPurpose::Entry, OrderStatus::Cancelled) => self
                .ledger
                .cancel(id, "entry order cancelled", update.timestamp)
                .await
                .map(|_| FillAction::Cancelled),
            (OrderPurpose::Exit, OrderStatus::Filled { price }) => self
                .ledger
                .mark_exited(id, *price, "EXIT FILL CONFIRMED", update.timestamp)
                .await
                .map(|t| {
                    if t.is_new() {
                        FillAction::Exited
                    } else {
                        FillAction::AlreadyExited
                    }
                }),
            (OrderPurpose::Exit, status) => {
                // The position stays active; the monitor retries next cycle.
                warn!(position_id = id, order_id = update.order_id, ?status, "Exit order not filled");
                Ok(FillAction::Ignored)
            }
            (OrderPurpose::Bracket, OrderStatus::Filled { price }) => {
                self.record_bracket(update, *price).await
            }
            (OrderPurpose::Bracket, _) => Ok(FillAction::Ignored),
        };

        match result {
            Err(LedgerError::Position(PositionError::IllegalTransition { from, to, .. })) => {
                info!(position_id = id, %from, %to, "Order update no longer applies");
                Ok(FillAction::Ignored)
            }
            other => other,
        }
    }

    /// Runs under the position lock, so the fill either lands before the
    /// terminal event that clears the registry or sees the terminal status.
    async fn record_bracket(
        &self,
        update: &OrderUpdate,
        price: Decimal,
    ) -> Result<FillAction, LedgerError> {
        let id = update.position_id;
        let action = {
            let _guard = self.ledger.lock(id).await;
            let position = self.ledger.get(id).await?;
            if position.is_terminal() {
                info!(position_id = id, status = %position.status, "Bracket fill for closed position");
                FillAction::Ignored
            } else if self.brackets.record(
                id,
                BracketFill {
                    order_id: update.order_id.clone(),
                    price,
                    filled_at: update.timestamp,
                },
            ) {
                FillAction::BracketRecorded
            } else {
                FillAction::Ignored
            }
        };
        self.ledger.prune_lock(id);
        Ok(action)
    }

    /// Consumes the order-status stream until it closes.
    pub async fn run(&self, mut updates: mpsc::Receiver<OrderUpdate>) {
        info!("Fill handler started");
        while let Some(update) = updates.recv().await {
            match self.on_order_update(&update).await {
                Ok(action) => info!(
                    position_id = update.position_id,
                    order_id = update.order_id,
                    ?action,
                    "Order update applied"
                ),
                Err(e) => warn!(
                    position_id = update.position_id,
                    order_id = update.order_id,
                    error = %e,
                    "Order update failed"
                ),
            }
        }
        info!("Order stream closed");
    }
}
