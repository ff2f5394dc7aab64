use crate::pnl::PnlSnapshot;
use crate::position::{InstrumentKey, NewPosition, Position, Side};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Authoritative persistence for positions (Tier 2 of the pnl cache lives
/// on the same row).
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persists a new pending position and returns it with its assigned id.
    async fn insert(&self, new: NewPosition, now: DateTime<Utc>) -> Result<Position>;

    async fn get(&self, id: i64) -> Result<Option<Position>>;

    /// Writes every mutable field of `position`.
    async fn update(&self, position: &Position) -> Result<()>;

    /// Writes the terminal transition and the flushed pnl in one transaction.
    async fn finalize_exit(&self, position: &Position, final_pnl: Option<&PnlSnapshot>)
        -> Result<()>;

    /// Throttled Tier-2 pnl write.
    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()>;

    async fn active_positions(&self) -> Result<Vec<Position>>;
}

/// Fast external key-value store holding the current pnl per position (Tier 1).
#[async_trait]
pub trait PnlTier1Store: Send + Sync {
    async fn put(&self, snapshot: &PnlSnapshot) -> Result<()>;
    async fn get(&self, position_id: i64) -> Result<Option<PnlSnapshot>>;
    async fn remove(&self, position_id: i64) -> Result<()>;
    async fn position_ids(&self) -> Result<Vec<i64>>;
}

/// Close order for one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitOrder {
    pub position_id: i64,
    pub instrument: InstrumentKey,
    /// Side of the position being closed, not of the closing order.
    pub side: Side,
    pub quantity: i64,
    pub paper: bool,
}

impl ExitOrder {
    #[must_use]
    pub fn for_position(position: &Position) -> Self {
        Self {
            position_id: position.id,
            instrument: position.instrument.clone(),
            side: position.side,
            quantity: position.quantity,
            paper: position.paper,
        }
    }
}

/// Outcome of an exit submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Filled { order_id: String, fill_price: Decimal },
    Rejected { reason: String },
}

/// Order-execution gateway. Callers bound every call with a timeout.
#[async_trait]
pub trait ExitGateway: Send + Sync {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<SubmitOutcome>;
}

/// Market-data feed subscription control. The transport and its callback
/// wiring belong to the feed; the engine only asks for coverage.
pub trait MarketFeed: Send + Sync {
    fn subscribe(&self, instrument: &InstrumentKey) -> Result<()>;
    fn unsubscribe(&self, instrument: &InstrumentKey) -> Result<()>;
    fn is_subscribed(&self, instrument: &InstrumentKey) -> bool;
}
