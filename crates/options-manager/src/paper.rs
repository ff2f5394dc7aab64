//! Paper execution gateways.
//!
//! Paper positions never reach a broker: their exits fill at the last price
//! the feed delivered for the instrument.

use std::sync::Arc;

use algo_trade_core::{ExitGateway, ExitOrder, SubmitOutcome};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::cache::ActivePositionCache;

pub struct PaperExitGateway {
    cache: Arc<ActivePositionCache>,
}

impl PaperExitGateway {
    #[must_use]
    pub fn new(cache: Arc<ActivePositionCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ExitGateway for PaperExitGateway {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<SubmitOutcome> {
        let Some(price) = self.cache.last_price(order.position_id) else {
            return Ok(SubmitOutcome::Rejected {
                reason: "no market price for paper fill".to_string(),
            });
        };
        let order_id = format!("PAPER-{}", Utc::now().timestamp_millis());
        info!(
            order_id,
            position_id = order.position_id,
            instrument = %order.instrument,
            price = %price,
            quantity = order.quantity,
            "Paper exit filled"
        );
        Ok(SubmitOutcome::Filled {
            order_id,
            fill_price: price,
        })
    }
}

/// Stand-in for live execution when no broker is attached. Every submit is
/// rejected, so live positions stay active and keep being retried.
#[derive(Debug, Default)]
pub struct DisconnectedGateway;

#[async_trait]
impl ExitGateway for DisconnectedGateway {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<SubmitOutcome> {
        Ok(SubmitOutcome::Rejected {
            reason: format!("no live gateway for position {}", order.position_id),
        })
    }
}
