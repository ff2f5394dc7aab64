//! Latest trend/volatility reading per underlying.

use algo_trade_core::{InstrumentKey, UnderlyingSignal};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::types::UnderlyingState;

#[derive(Debug, Default)]
pub struct UnderlyingTracker {
    readings: DashMap<InstrumentKey, UnderlyingState>,
}

impl UnderlyingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the newest reading; out-of-order signals are dropped.
    pub fn record(&self, signal: &UnderlyingSignal) {
        let state = UnderlyingState {
            trend_score: signal.trend_score,
            atr_ratio: signal.atr_ratio,
            observed_at: signal.timestamp,
        };
        self.readings
            .entry(signal.instrument.clone())
            .and_modify(|current| {
                if state.observed_at >= current.observed_at {
                    *current = state.clone();
                }
            })
            .or_insert_with(|| state.clone());
    }

    /// The latest reading if it is no older than `max_age`.
    #[must_use]
    pub fn fresh(
        &self,
        instrument: &InstrumentKey,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Option<UnderlyingState> {
        self.readings
            .get(instrument)
            .filter(|s| now.signed_duration_since(s.observed_at) <= max_age)
            .map(|s| s.value().clone())
    }
}
