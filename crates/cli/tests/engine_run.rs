//! Engine lifecycle as the `run` command drives it.
//!
//! Verifies that:
//! - Closing an input stream stops every engine actor
//! - A shutdown signal stops the engine with its inputs still open
//! - Ticks and order updates sent through the channels reach the engine
//! - A paper position opened on the in-memory store runs from entry fill to exit

use std::sync::Arc;
use std::time::Duration;

use algo_trade_core::{
    AppConfig, ConfigWatcher, InstrumentKey, MarketTick, NewPosition, OrderPurpose, OrderStatus,
    OrderUpdate, PositionStatus, PositionStore,
};
use algo_trade_options_manager::feed::SubscriptionSet;
use algo_trade_options_manager::paper::DisconnectedGateway;
use algo_trade_options_manager::store::MemoryPositionStore;
use algo_trade_options_manager::{Collaborators, InMemoryTier1, Inputs, OptionsManager};
use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};

// ============================================================================
// Helper Functions
// ============================================================================

struct Senders {
    ticks: mpsc::Sender<MarketTick>,
    updates: mpsc::Sender<OrderUpdate>,
    _underlying: mpsc::Sender<algo_trade_core::UnderlyingSignal>,
}

fn engine() -> (Arc<OptionsManager>, Arc<MemoryPositionStore>, Inputs, Senders) {
    engine_with(AppConfig::default())
}

fn engine_with(
    config: AppConfig,
) -> (Arc<OptionsManager>, Arc<MemoryPositionStore>, Inputs, Senders) {
    let store = Arc::new(MemoryPositionStore::new());
    let (_watcher, config_rx) = ConfigWatcher::new(config);
    let manager = OptionsManager::new(
        Collaborators {
            store: store.clone(),
            tier1: Arc::new(InMemoryTier1::new()),
            feed: Arc::new(SubscriptionSet::new()),
            gateway: Arc::new(DisconnectedGateway),
        },
        config_rx,
    );

    let (tick_tx, ticks) = mpsc::channel(16);
    let (update_tx, order_updates) = mpsc::channel(16);
    let (underlying_tx, underlying) = mpsc::channel(16);
    (
        Arc::new(manager),
        store,
        Inputs {
            ticks,
            order_updates,
            underlying,
        },
        Senders {
            ticks: tick_tx,
            updates: update_tx,
            _underlying: underlying_tx,
        },
    )
}

async fn wait_for_status(
    store: &MemoryPositionStore,
    id: i64,
    status: PositionStatus,
) -> algo_trade_core::Position {
    for _ in 0..250 {
        let position = store.get(id).await.unwrap().unwrap();
        if position.status == status {
            return position;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("position {id} never reached {status}");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_input_stops_the_engine() {
    let (manager, _store, inputs, senders) = engine();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(inputs, shutdown_rx).await }
    });
    drop(senders);

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("engine did not stop after its inputs closed")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_signal_stops_the_engine() {
    let (manager, _store, inputs, _senders) = engine();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(inputs, shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("engine ignored shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(manager.metrics.snapshot().exits_completed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_events_reach_the_engine() {
    let (manager, store, inputs, senders) = engine();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let instrument = InstrumentKey::new("NSE_FNO", "43251");
    let pending = manager
        .ledger
        .open(NewPosition::long(instrument.clone(), dec!(100), 50), Utc::now())
        .await
        .unwrap();

    let running = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(inputs, shutdown_rx).await }
    });

    senders
        .updates
        .send(OrderUpdate {
            position_id: pending.id,
            order_id: "ENTRY-1".to_string(),
            purpose: OrderPurpose::Entry,
            status: OrderStatus::Filled { price: dec!(101) },
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    let mut activated = false;
    for _ in 0..100 {
        let position = store.get(pending.id).await.unwrap().unwrap();
        if position.status != PositionStatus::Pending {
            activated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(activated, "entry fill was not applied");

    senders
        .ticks
        .send(MarketTick {
            instrument,
            last_price: dec!(104),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("engine ignored shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(store.get(pending.id).await.unwrap().unwrap().entry_price, dec!(101));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paper_position_runs_from_entry_to_exit() {
    let mut config = AppConfig::default();
    config.monitor.poll_interval_ms = 20;
    config.monitor.idle_interval_secs = 1;
    let (manager, store, inputs, senders) = engine_with(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let instrument = InstrumentKey::new("NSE_FNO", "43252");

    let running = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(inputs, shutdown_rx).await }
    });

    let mut entry = NewPosition::long(instrument.clone(), dec!(100), 50);
    entry.paper = true;
    let pending = manager.ledger.open(entry, Utc::now()).await.unwrap();
    assert_eq!(pending.id, 1);

    senders
        .updates
        .send(OrderUpdate {
            position_id: pending.id,
            order_id: "ENTRY-1".to_string(),
            purpose: OrderPurpose::Entry,
            status: OrderStatus::Filled { price: dec!(100) },
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    wait_for_status(&store, pending.id, PositionStatus::Active).await;

    // Past the stop loss in session; swept at this price outside it.
    senders
        .ticks
        .send(MarketTick {
            instrument,
            last_price: dec!(60),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    let exited = wait_for_status(&store, pending.id, PositionStatus::Exited).await;

    assert_eq!(exited.exit_price, Some(dec!(60)));
    assert_eq!(exited.last_pnl.map(|p| p.pnl_rupees), Some(dec!(-2000)));
    assert!(manager.cache.is_empty());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("engine ignored shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(manager.metrics.snapshot().exits_completed, 1);
}
