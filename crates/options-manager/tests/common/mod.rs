//! Shared harness for the options-manager integration tests.
//!
//! Builds a full `OptionsManager` over in-process collaborators whose
//! failure modes can be switched on per test.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use algo_trade_core::{
    AppConfig, ConfigWatcher, ExitGateway, ExitOrder, InstrumentKey, MarketFeed, MarketTick,
    NewPosition, PnlSnapshot, Position, PositionStore, SubmitOutcome,
};
use algo_trade_options_manager::feed::SubscriptionSet;
use algo_trade_options_manager::store::MemoryPositionStore;
use algo_trade_options_manager::{Collaborators, InMemoryTier1, OptionsManager};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// ============================================================================
// Clock
// ============================================================================

/// Friday 2026-10-16, 10:30 IST.
pub fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 5, 0, 0).unwrap()
}

pub fn secs(n: i64) -> ChronoDuration {
    ChronoDuration::seconds(n)
}

pub fn option(security_id: &str) -> InstrumentKey {
    InstrumentKey::new("NSE_FNO", security_id)
}

// ============================================================================
// Collaborators
// ============================================================================

/// Live gateway that counts submissions and fills at a scripted price.
pub struct ScriptedGateway {
    submits: AtomicUsize,
    delay_ms: AtomicU64,
    reject: AtomicBool,
    fill_price: Mutex<Decimal>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            submits: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            reject: AtomicBool::new(false),
            fill_price: Mutex::new(dec!(100)),
        }
    }
}

impl ScriptedGateway {
    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_fill_price(&self, price: Decimal) {
        *self.fill_price.lock() = price;
    }
}

#[async_trait]
impl ExitGateway for ScriptedGateway {
    async fn submit_exit(&self, order: &ExitOrder) -> Result<SubmitOutcome> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Ok(SubmitOutcome::Rejected {
                reason: format!("no liquidity for {}", order.instrument),
            });
        }
        Ok(SubmitOutcome::Filled {
            order_id: format!("LIVE-{n}"),
            fill_price: *self.fill_price.lock(),
        })
    }
}

/// Memory store whose exit write can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryPositionStore,
    fail_finalize: AtomicBool,
}

impl FlakyStore {
    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn insert(&self, new: NewPosition, now: DateTime<Utc>) -> Result<Position> {
        self.inner.insert(new, now).await
    }

    async fn get(&self, id: i64) -> Result<Option<Position>> {
        self.inner.get(id).await
    }

    async fn update(&self, position: &Position) -> Result<()> {
        self.inner.update(position).await
    }

    async fn finalize_exit(
        &self,
        position: &Position,
        final_pnl: Option<&PnlSnapshot>,
    ) -> Result<()> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            bail!("connection reset while writing position {}", position.id);
        }
        self.inner.finalize_exit(position, final_pnl).await
    }

    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
        self.inner.update_pnl(snapshot).await
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        self.inner.active_positions().await
    }
}

/// Subscription set that can refuse chosen instruments.
#[derive(Default)]
pub struct FlakyFeed {
    pub inner: SubscriptionSet,
    refused: Mutex<HashSet<InstrumentKey>>,
}

impl FlakyFeed {
    pub fn refuse(&self, instrument: &InstrumentKey) {
        self.refused.lock().insert(instrument.clone());
    }
}

impl MarketFeed for FlakyFeed {
    fn subscribe(&self, instrument: &InstrumentKey) -> Result<()> {
        if self.refused.lock().contains(instrument) {
            bail!("feed refused {instrument}");
        }
        self.inner.subscribe(instrument)
    }

    fn unsubscribe(&self, instrument: &InstrumentKey) -> Result<()> {
        self.inner.unsubscribe(instrument)
    }

    fn is_subscribed(&self, instrument: &InstrumentKey) -> bool {
        self.inner.is_subscribed(instrument)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: OptionsManager,
    pub store: Arc<FlakyStore>,
    pub tier1: Arc<InMemoryTier1>,
    pub feed: Arc<FlakyFeed>,
    pub gateway: Arc<ScriptedGateway>,
    pub config: ConfigWatcher,
}

impl Harness {
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let tier1 = Arc::new(InMemoryTier1::new());
        let feed = Arc::new(FlakyFeed::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let (watcher, rx) = ConfigWatcher::new(config);

        let manager = OptionsManager::new(
            Collaborators {
                store: store.clone(),
                tier1: tier1.clone(),
                feed: feed.clone(),
                gateway: gateway.clone(),
            },
            rx,
        );

        Self {
            manager,
            store,
            tier1,
            feed,
            gateway,
            config: watcher,
        }
    }

    /// Opens and activates a long position entered at `at`.
    pub async fn open_active(
        &self,
        security_id: &str,
        entry: Decimal,
        quantity: i64,
        at: DateTime<Utc>,
    ) -> Position {
        let ledger = &self.manager.ledger;
        let pending = ledger
            .open(NewPosition::long(option(security_id), entry, quantity), at)
            .await
            .unwrap();
        ledger.activate(pending.id, None, at).await.unwrap()
    }

    pub async fn open_paper(&self, security_id: &str, entry: Decimal, at: DateTime<Utc>) -> Position {
        let mut new = NewPosition::long(option(security_id), entry, 25);
        new.paper = true;
        let ledger = &self.manager.ledger;
        let pending = ledger.open(new, at).await.unwrap();
        ledger.activate(pending.id, None, at).await.unwrap()
    }

    pub async fn tick(&self, security_id: &str, price: Decimal, at: DateTime<Utc>) -> usize {
        self.manager
            .ticks
            .on_tick(&MarketTick {
                instrument: option(security_id),
                last_price: price,
                timestamp: at,
            })
            .await
    }

    pub async fn stored(&self, id: i64) -> Position {
        self.store.get(id).await.unwrap().unwrap()
    }
}
