//! PnL snapshots.
//!
//! Percentages are return on premium, independent of allocated capital.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::position::Side;

/// Where a snapshot was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlSource {
    /// Marked from a live market-data tick (Tier 1).
    Tick,
    /// Read back from the authoritative store (Tier 2).
    Store,
    /// Realized from an exit fill.
    Fill,
}

/// A point-in-time PnL reading for one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub position_id: i64,
    pub pnl_rupees: Decimal,
    pub pnl_pct: Decimal,
    /// Price the snapshot was marked at.
    pub ltp: Decimal,
    pub computed_at: DateTime<Utc>,
    pub source: PnlSource,
}

impl PnlSnapshot {
    /// Marks a position at `ltp`. Returns `None` when the entry price cannot
    /// anchor a percentage.
    #[must_use]
    pub fn compute(
        position_id: i64,
        side: Side,
        entry_price: Decimal,
        quantity: i64,
        ltp: Decimal,
        computed_at: DateTime<Utc>,
        source: PnlSource,
    ) -> Option<Self> {
        if entry_price <= Decimal::ZERO {
            return None;
        }
        let per_unit = (ltp - entry_price) * side.sign();
        let pnl_rupees = per_unit * Decimal::from(quantity);
        let pnl_pct = (per_unit / entry_price * Decimal::ONE_HUNDRED).round_dp(4);

        Some(Self {
            position_id,
            pnl_rupees,
            pnl_pct,
            ltp,
            computed_at,
            source,
        })
    }

    /// True when the snapshot is no older than `max_age` at `now`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.computed_at) <= max_age
    }

    #[must_use]
    pub fn with_source(mut self, source: PnlSource) -> Self {
        self.source = source;
        self
    }
}
