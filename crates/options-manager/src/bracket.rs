//! Bracket fills observed on the order stream, waiting for the monitor to
//! finalize them.

use algo_trade_core::PositionEvent;
use dashmap::DashMap;

use crate::ledger::PositionObserver;
use crate::types::BracketFill;

#[derive(Debug, Default)]
pub struct BracketFillRegistry {
    fills: DashMap<i64, BracketFill>,
}

impl BracketFillRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First fill wins; repeats of the same order are ignored.
    pub fn record(&self, position_id: i64, fill: BracketFill) -> bool {
        let mut inserted = false;
        self.fills.entry(position_id).or_insert_with(|| {
            inserted = true;
            fill
        });
        inserted
    }

    #[must_use]
    pub fn get(&self, position_id: i64) -> Option<BracketFill> {
        self.fills.get(&position_id).map(|f| f.value().clone())
    }

    pub fn remove(&self, position_id: i64) -> Option<BracketFill> {
        self.fills.remove(&position_id).map(|(_, fill)| fill)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fills.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }
}

impl PositionObserver for BracketFillRegistry {
    fn on_event(&self, event: &PositionEvent) {
        if let PositionEvent::Exited(p) | PositionEvent::Cancelled(p) = event {
            self.remove(p.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn first_fill_wins() {
        let registry = BracketFillRegistry::new();
        let fill = |price| BracketFill {
            order_id: "BRK-9".to_string(),
            price,
            filled_at: Utc::now(),
        };
        assert!(registry.record(3, fill(dec!(150))));
        assert!(!registry.record(3, fill(dec!(151))));
        assert_eq!(registry.get(3).unwrap().price, dec!(150));
        assert_eq!(registry.remove(3).unwrap().price, dec!(150));
        assert!(registry.is_empty());
    }
}
