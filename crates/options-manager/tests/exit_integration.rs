//! Exit execution under contention.
//!
//! Verifies that:
//! - Concurrent exit requests for one position submit exactly one close order
//! - A broker fill confirmation racing the exit engine records one exit
//! - Rejected and timed-out submissions leave the position active
//! - A broker fill whose store write failed is recorded later without resubmitting
//! - Pending fills and bracket fills never outlive a closed position
//! - Exit timeouts published at runtime apply to the next submission
//! - Paper positions fill at the last tick without touching the live gateway

mod common;

use std::time::Duration;

use algo_trade_core::{
    AppConfig, OrderPurpose, OrderStatus, OrderUpdate, PositionEvent, PositionStatus,
};
use algo_trade_options_manager::fills::FillAction;
use algo_trade_options_manager::{ExitError, ExitOutcome, ExitRequest};
use common::{morning, secs, Harness};
use futures::future::join_all;
use rust_decimal_macros::dec;

// ============================================================================
// Helper Functions
// ============================================================================

fn exit_fill(position_id: i64, price: rust_decimal::Decimal) -> OrderUpdate {
    OrderUpdate {
        position_id,
        order_id: format!("BRK-EXIT-{position_id}"),
        purpose: OrderPurpose::Exit,
        status: OrderStatus::Filled { price },
        timestamp: morning() + secs(5),
    }
}

fn exited_events(rx: &mut tokio::sync::broadcast::Receiver<PositionEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PositionEvent::Exited(_)) {
            count += 1;
        }
    }
    count
}

// ============================================================================
// Exactly-once
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_submit_one_order() {
    let h = Harness::new(AppConfig::default());
    h.gateway.set_delay(Duration::from_millis(20));
    h.gateway.set_fill_price(dec!(97.5));
    let position = h.open_active("43251", dec!(100), 50, morning()).await;
    let id = position.id;
    let mut events = h.manager.ledger.subscribe();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let exits = h.manager.exits.clone();
            let reason = if i % 2 == 0 { "SL HIT" } else { "TRAILING STOP" };
            tokio::spawn(async move {
                exits.execute(&ExitRequest::manual(id, reason)).await
            })
        })
        .collect();

    let outcomes: Vec<ExitOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let exited = outcomes.iter().filter(|o| o.is_exited()).count();
    let already = outcomes
        .iter()
        .filter(|o| matches!(o, ExitOutcome::AlreadyTerminal { .. }))
        .count();
    assert_eq!(exited, 1);
    assert_eq!(already, 15);
    assert_eq!(h.gateway.submits(), 1);
    assert_eq!(exited_events(&mut events), 1);

    let stored = h.stored(position.id).await;
    assert_eq!(stored.status, PositionStatus::Exited);
    assert_eq!(stored.exit_price, Some(dec!(97.5)));
    assert!(h.manager.cache.get(position.id).is_none());
    assert_eq!(h.manager.ledger.lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fill_confirmation_racing_engine_records_once() {
    let h = Harness::new(AppConfig::default());
    h.gateway.set_delay(Duration::from_millis(50));
    h.gateway.set_fill_price(dec!(96));
    let position = h.open_active("43252", dec!(100), 50, morning()).await;
    let id = position.id;
    let mut events = h.manager.ledger.subscribe();

    let exits = h.manager.exits.clone();
    let engine =
        tokio::spawn(async move { exits.execute(&ExitRequest::manual(id, "SL HIT")).await });
    let fills = h.manager.fills.clone();
    let confirmation =
        tokio::spawn(async move { fills.on_order_update(&exit_fill(id, dec!(95))).await });

    let engine = engine.await.unwrap().unwrap();
    let confirmation = confirmation.await.unwrap().unwrap();

    match (&engine, confirmation) {
        (ExitOutcome::Exited(record), FillAction::AlreadyExited) => {
            assert_eq!(record.exit_price, dec!(96));
            assert_eq!(h.gateway.submits(), 1);
        }
        (ExitOutcome::AlreadyTerminal { record, .. }, FillAction::Exited) => {
            assert_eq!(record.as_ref().map(|r| r.exit_price), Some(dec!(95)));
            assert_eq!(h.gateway.submits(), 0);
        }
        other => panic!("both paths claimed or neither did: {other:?}"),
    }
    assert_eq!(exited_events(&mut events), 1);
}

// ============================================================================
// Deferred exits
// ============================================================================

#[tokio::test]
async fn rejected_exit_stays_active_and_retries() {
    let h = Harness::new(AppConfig::default());
    h.gateway.set_reject(true);
    let position = h.open_active("43253", dec!(100), 50, morning()).await;

    let first = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "TP HIT"))
        .await
        .unwrap();
    assert!(matches!(first, ExitOutcome::Deferred { ref reason } if reason.contains("rejected")));
    assert_eq!(h.stored(position.id).await.status, PositionStatus::Active);
    assert!(h.manager.cache.get(position.id).is_some());

    h.gateway.set_reject(false);
    let second = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "TP HIT"))
        .await
        .unwrap();
    assert!(second.is_exited());
    assert_eq!(h.gateway.submits(), 2);
    assert_eq!(h.stored(position.id).await.exit_reason.as_deref(), Some("TP HIT"));
}

#[tokio::test]
async fn unconfirmed_submit_is_deferred_after_timeout() {
    let mut config = AppConfig::default();
    config.monitor.exit_timeout_ms = 50;
    let h = Harness::new(config);
    h.gateway.set_delay(Duration::from_millis(500));
    let position = h.open_active("43254", dec!(100), 50, morning()).await;

    let outcome = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "SL HIT"))
        .await
        .unwrap();

    assert!(matches!(outcome, ExitOutcome::Deferred { ref reason } if reason.contains("50ms")));
    assert_eq!(h.stored(position.id).await.status, PositionStatus::Active);
    assert_eq!(h.manager.metrics.snapshot().exits_deferred, 1);
}

#[tokio::test]
async fn unrecorded_fill_is_recorded_without_resubmitting() {
    let h = Harness::new(AppConfig::default());
    h.gateway.set_fill_price(dec!(120));
    let position = h.open_active("43255", dec!(100), 50, morning()).await;

    h.store.fail_finalize(true);
    let err = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "TP HIT"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExitError::Ledger(_)));
    assert_eq!(h.gateway.submits(), 1);
    assert_eq!(h.manager.exits.unrecorded_count(), 1);
    assert_eq!(h.stored(position.id).await.status, PositionStatus::Active);

    h.store.fail_finalize(false);
    h.gateway.set_fill_price(dec!(140));
    let outcome = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "SECURE PROFIT"))
        .await
        .unwrap();

    let ExitOutcome::Exited(record) = outcome else {
        panic!("expected the pending fill to be recorded");
    };
    assert_eq!(record.exit_price, dec!(120));
    assert_eq!(record.exit_reason, "TP HIT");
    assert_eq!(h.gateway.submits(), 1);
    assert_eq!(h.manager.exits.unrecorded_count(), 0);

    let stored = h.stored(position.id).await;
    let final_pnl = stored.last_pnl.unwrap();
    assert_eq!(final_pnl.pnl_rupees, dec!(1000));
    assert_eq!(final_pnl.pnl_pct, dec!(20));
}

#[tokio::test]
async fn pending_fill_is_dropped_when_another_path_closes_the_position() {
    let h = Harness::new(AppConfig::default());
    let filled = h.open_active("43258", dec!(100), 50, morning()).await;
    let cancelled = h.open_active("43259", dec!(100), 50, morning()).await;

    h.store.fail_finalize(true);
    for id in [filled.id, cancelled.id] {
        h.manager
            .exits
            .execute(&ExitRequest::manual(id, "SL HIT"))
            .await
            .unwrap_err();
    }
    assert_eq!(h.manager.exits.unrecorded_count(), 2);

    h.store.fail_finalize(false);
    let action = h
        .manager
        .fills
        .on_order_update(&exit_fill(filled.id, dec!(99)))
        .await
        .unwrap();
    assert_eq!(action, FillAction::Exited);
    h.manager
        .ledger
        .cancel(cancelled.id, "manual close", morning() + secs(6))
        .await
        .unwrap();

    assert_eq!(h.manager.exits.unrecorded_count(), 0);
    assert_eq!(h.gateway.submits(), 2);
}

#[tokio::test]
async fn bracket_fill_after_close_is_not_kept() {
    let h = Harness::new(AppConfig::default());
    let position = h.open_active("43260", dec!(100), 50, morning()).await;
    h.manager
        .exits
        .execute(&ExitRequest::manual(position.id, "SL HIT"))
        .await
        .unwrap();

    let action = h
        .manager
        .fills
        .on_order_update(&OrderUpdate {
            position_id: position.id,
            order_id: "BRK-TP-1".to_string(),
            purpose: OrderPurpose::Bracket,
            status: OrderStatus::Filled { price: dec!(130) },
            timestamp: morning() + secs(9),
        })
        .await
        .unwrap();

    assert_eq!(action, FillAction::Ignored);
    assert!(h.manager.brackets.is_empty());
    assert_eq!(h.manager.ledger.lock_count(), 0);
}

#[tokio::test]
async fn published_timeout_applies_to_next_submit() {
    let h = Harness::new(AppConfig::default());
    h.gateway.set_delay(Duration::from_millis(500));
    let position = h.open_active("43261", dec!(100), 50, morning()).await;

    let mut config = AppConfig::default();
    config.monitor.exit_timeout_ms = 50;
    assert!(h.config.publish(config));

    let outcome = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "SL HIT"))
        .await
        .unwrap();
    assert!(matches!(outcome, ExitOutcome::Deferred { ref reason } if reason.contains("50ms")));
}

// ============================================================================
// Paper routing
// ============================================================================

#[tokio::test]
async fn paper_position_fills_at_last_tick() {
    let h = Harness::new(AppConfig::default());
    let position = h.open_paper("52110", dec!(80), morning()).await;
    assert_eq!(h.tick("52110", dec!(88), morning() + secs(1)).await, 1);

    let outcome = h
        .manager
        .exits
        .execute(&ExitRequest::manual(position.id, "TP HIT"))
        .await
        .unwrap();

    let ExitOutcome::Exited(record) = outcome else {
        panic!("paper exit should fill");
    };
    assert_eq!(record.exit_price, dec!(88));
    assert_eq!(h.gateway.submits(), 0);
}
