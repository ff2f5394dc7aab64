use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::position::{InstrumentKey, Position};

/// Last-traded-price tick delivered by the market-data feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub instrument: InstrumentKey,
    pub last_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Structural read of an underlying, produced outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingSignal {
    pub instrument: InstrumentKey,
    /// Trend strength in [-1, 1]; positive is bullish.
    pub trend_score: Decimal,
    /// Current volatility over volatility at entry (ATR ratio).
    pub atr_ratio: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Which order an update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    Exit,
    /// Broker-side bracket leg (target/stop) attached at entry.
    Bracket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderStatus {
    Filled { price: Decimal },
    Rejected { reason: String },
    Cancelled,
}

/// Asynchronous order-status event from the fill-confirmation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub position_id: i64,
    pub order_id: String,
    pub purpose: OrderPurpose,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Typed lifecycle events emitted by the position state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "position", rename_all = "snake_case")]
pub enum PositionEvent {
    Activated(Position),
    /// Non-status change on an active position (peak raised).
    Updated(Position),
    Exited(Position),
    Cancelled(Position),
}

impl PositionEvent {
    #[must_use]
    pub const fn position(&self) -> &Position {
        match self {
            Self::Activated(p) | Self::Updated(p) | Self::Exited(p) | Self::Cancelled(p) => p,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Activated(_) => "activated",
            Self::Updated(_) => "updated",
            Self::Exited(_) => "exited",
            Self::Cancelled(_) => "cancelled",
        }
    }
}
