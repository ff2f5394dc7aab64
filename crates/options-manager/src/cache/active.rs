//! Active-position projections keyed by instrument.
//!
//! A tick touches one instrument's shard only. The monitor reads through
//! [`ActivePositionCache::snapshot`], which clones and releases each shard
//! before any rule runs. Entries exist only while their position is active
//! and can always be rebuilt from the store.

use algo_trade_core::{
    InstrumentKey, MarketTick, OptionRight, PnlSnapshot, PnlSource, Position, PositionEvent, Side,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::ledger::PositionObserver;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub position_id: i64,
    pub instrument: InstrumentKey,
    pub underlying: Option<InstrumentKey>,
    pub right: Option<OptionRight>,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: i64,
    pub peak_pnl_pct: Decimal,
    pub peak_pnl_rupees: Decimal,
    pub entered_at: Option<DateTime<Utc>>,
    pub paper: bool,
    pub last_price: Option<Decimal>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub pnl: Option<PnlSnapshot>,
}

impl CacheEntry {
    #[must_use]
    pub fn from_position(position: &Position) -> Self {
        Self {
            position_id: position.id,
            instrument: position.instrument.clone(),
            underlying: position.underlying.clone(),
            right: position.right,
            side: position.side,
            entry_price: position.entry_price,
            quantity: position.quantity,
            peak_pnl_pct: position.peak_pnl_pct,
            peak_pnl_rupees: position.peak_pnl_rupees,
            entered_at: position.entered_at,
            paper: position.paper,
            last_price: position.last_pnl.as_ref().map(|p| p.ltp),
            last_tick_at: None,
            pnl: position.last_pnl.clone(),
        }
    }

    fn apply_tick(&mut self, price: Decimal, at: DateTime<Utc>) -> Option<PnlSnapshot> {
        self.last_price = Some(price);
        self.last_tick_at = Some(at);
        self.pnl = PnlSnapshot::compute(
            self.position_id,
            self.side,
            self.entry_price,
            self.quantity,
            price,
            at,
            PnlSource::Tick,
        );
        self.pnl.clone()
    }
}

#[derive(Debug, Default)]
pub struct ActivePositionCache {
    by_instrument: DashMap<InstrumentKey, Vec<CacheEntry>>,
    /// position id -> instrument it is filed under
    index: DashMap<i64, InstrumentKey>,
}

impl ActivePositionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes the projection of an active position. Terminal
    /// positions are removed instead.
    pub fn upsert(&self, position: &Position) {
        if !position.is_active() {
            self.remove(position.id);
            return;
        }
        let previous = self.index.get(&position.id).map(|k| k.value().clone());
        if let Some(old_key) = previous.filter(|k| *k != position.instrument) {
            self.remove_from(&old_key, position.id);
        }

        let mut fresh = CacheEntry::from_position(position);
        {
            let mut entries = self
                .by_instrument
                .entry(position.instrument.clone())
                .or_default();
            if let Some(existing) = entries.iter_mut().find(|e| e.position_id == position.id) {
                if existing.last_tick_at.is_some() {
                    fresh.last_price = existing.last_price;
                    fresh.last_tick_at = existing.last_tick_at;
                    fresh.pnl = existing.pnl.clone();
                }
                *existing = fresh;
            } else {
                entries.push(fresh);
            }
        }
        self.index.insert(position.id, position.instrument.clone());
    }

    /// Moves the cached high-water marks up to the position's.
    pub fn refresh_peak(&self, position: &Position) {
        let Some(key) = self.index.get(&position.id).map(|k| k.value().clone()) else {
            return;
        };
        if let Some(mut entries) = self.by_instrument.get_mut(&key) {
            if let Some(entry) = entries.iter_mut().find(|e| e.position_id == position.id) {
                entry.peak_pnl_pct = entry.peak_pnl_pct.max(position.peak_pnl_pct);
                entry.peak_pnl_rupees = entry.peak_pnl_rupees.max(position.peak_pnl_rupees);
            }
        }
    }

    pub fn remove(&self, position_id: i64) -> Option<CacheEntry> {
        let (_, key) = self.index.remove(&position_id)?;
        self.remove_from(&key, position_id)
    }

    fn remove_from(&self, key: &InstrumentKey, position_id: i64) -> Option<CacheEntry> {
        let mut removed = None;
        if let Some(mut entries) = self.by_instrument.get_mut(key) {
            if let Some(idx) = entries.iter().position(|e| e.position_id == position_id) {
                removed = Some(entries.swap_remove(idx));
            }
        }
        self.by_instrument.remove_if(key, |_, entries| entries.is_empty());
        removed
    }

    /// Removes every projection of a position, wherever it is filed.
    /// Returns how many were dropped.
    pub fn remove_everywhere(&self, position_id: i64) -> usize {
        self.index.remove(&position_id);
        let mut dropped = 0;
        for mut shard in self.by_instrument.iter_mut() {
            let before = shard.len();
            shard.retain(|e| e.position_id != position_id);
            dropped += before - shard.len();
        }
        self.by_instrument.retain(|_, entries| !entries.is_empty());
        dropped
    }

    /// Marks every position on the tick's instrument. Returns the new pnl
    /// snapshots.
    pub fn apply_tick(&self, tick: &MarketTick) -> Vec<PnlSnapshot> {
        let Some(mut entries) = self.by_instrument.get_mut(&tick.instrument) else {
            return Vec::new();
        };
        entries
            .iter_mut()
            .filter_map(|e| e.apply_tick(tick.last_price, tick.timestamp))
            .collect()
    }

    /// Point-in-time copy of every projection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.by_instrument
            .iter()
            .flat_map(|shard| shard.value().clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, position_id: i64) -> Option<CacheEntry> {
        let key = self.index.get(&position_id).map(|k| k.value().clone())?;
        self.by_instrument
            .get(&key)?
            .iter()
            .find(|e| e.position_id == position_id)
            .cloned()
    }

    #[must_use]
    pub fn last_price(&self, position_id: i64) -> Option<Decimal> {
        self.get(position_id).and_then(|e| e.last_price)
    }

    /// Projections of one position across all instruments. Exactly one is
    /// healthy.
    #[must_use]
    pub fn projection_count(&self, position_id: i64) -> usize {
        self.by_instrument
            .iter()
            .map(|shard| {
                shard
                    .value()
                    .iter()
                    .filter(|e| e.position_id == position_id)
                    .count()
            })
            .sum()
    }

    #[must_use]
    pub fn position_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .by_instrument
            .iter()
            .flat_map(|shard| {
                shard
                    .value()
                    .iter()
                    .map(|e| e.position_id)
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn has_positions_on(&self, instrument: &InstrumentKey) -> bool {
        self.by_instrument
            .get(instrument)
            .is_some_and(|entries| !entries.is_empty())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Replaces the whole cache with the given positions' projections.
    pub fn rebuild(&self, positions: &[Position]) {
        self.by_instrument.clear();
        self.index.clear();
        for position in positions {
            self.upsert(position);
        }
    }
}

impl PositionObserver for ActivePositionCache {
    fn on_event(&self, event: &PositionEvent) {
        match event {
            PositionEvent::Activated(position) => self.upsert(position),
            PositionEvent::Updated(position) => self.refresh_peak(position),
            PositionEvent::Exited(position) | PositionEvent::Cancelled(position) => {
                self.remove(position.id);
            }
        }
    }
}
