//! Concurrent ingestion tests
//!
//! Covers:
//! - Disjoint plates reconciled in parallel through the dispatcher
//! - Same-identity messages serialize and the newest state wins
//! - Identity lock timeouts requeue instead of dropping the message
//! - Dispatcher shutdown drains admitted messages

mod helpers;

use std::time::Duration;

use helpers::*;
use lims_common::events::EntityKind;
use lims_ingest::db::load_plate;
use lims_ingest::locks::LockKey;
use lims_ingest::{Dispatcher, IngestError, IngestMessage, IngestSettings};
use serde_json::{json, Value};

fn plate_message(source: &str, payload: Value) -> IngestMessage {
    IngestMessage::from_value(EntityKind::Plate, source, payload).unwrap()
}

fn numbered_plate(id: usize, last_updated: &str) -> Value {
    let mut payload = plate_fixture(last_updated);
    payload["id_flgen_plate_lims"] = json!(id);
    payload["plate_barcode"] = json!(1000 + id);
    payload
}

#[tokio::test]
async fn test_dispatcher_reconciles_disjoint_plates() {
    let t = test_engine().await;
    let dispatcher = Dispatcher::new(t.engine.clone());

    let mut receivers = Vec::new();
    for id in 1..=20 {
        let rx = dispatcher
            .submit(plate_message(SOURCE, numbered_plate(id, T1)))
            .await
            .unwrap();
        receivers.push(rx);
    }

    for rx in receivers {
        let verdict = rx.await.unwrap();
        assert!(verdict.is_accepted(), "{:?}", verdict);
    }

    assert_eq!(t.count("plates").await, 20);
    assert_eq!(t.count("wells").await, 40);
    assert_eq!(t.count("lims_identities").await, 20);
}

#[tokio::test]
async fn test_same_identity_newest_state_wins() {
    let t = test_engine().await;
    let dispatcher = Dispatcher::new(t.engine.clone());

    // Delivery order deliberately differs from last_updated order
    let versions = [
        ("2012-03-12 10:22:42", "c"),
        ("2012-03-10 10:22:42", "a"),
        ("2012-03-14 10:22:42", "e"),
        ("2012-03-11 10:22:42", "b"),
        ("2012-03-13 10:22:42", "d"),
    ];

    let mut receivers = Vec::new();
    for (ts, code) in versions {
        let mut payload = plate_fixture(ts);
        payload["cost_code"] = json!(code);
        payload["wells"][0]["cost_code"] = json!(code);
        receivers.push(dispatcher.submit(plate_message(SOURCE, payload)).await.unwrap());
    }
    for rx in receivers {
        assert!(rx.await.unwrap().is_accepted());
    }

    let plate = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert_eq!(plate.cost_code.as_deref(), Some("e"));
    assert_eq!(plate.wells.len(), 2);
    assert_eq!(plate.wells[0].cost_code, "e");
    assert_eq!(
        plate.last_updated,
        lims_common::time::parse_lims_timestamp("2012-03-14 10:22:42").unwrap()
    );

    assert_eq!(t.count("plates").await, 1);
    assert_eq!(t.count("lims_identities").await, 1);
}

#[tokio::test]
async fn test_lock_timeout_is_requeueable() {
    let settings = IngestSettings {
        identity_lock_timeout: Duration::from_millis(30),
        ..IngestSettings::default()
    };
    let t = test_engine_with(settings).await;

    let held = t
        .engine
        .locks()
        .acquire(LockKey::new(EntityKind::Plate, SOURCE, "1123"), Duration::from_secs(1))
        .await
        .unwrap();

    let err = t
        .engine
        .ingest(&plate_message(SOURCE, plate_fixture(T1)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IngestError::LockTimeout { .. }));
    assert!(err.is_requeueable());
    assert_eq!(t.count("plates").await, 0);

    drop(held);
}

#[tokio::test]
async fn test_dispatcher_requeues_until_lock_released() {
    let settings = IngestSettings {
        identity_lock_timeout: Duration::from_millis(20),
        requeue_backoff: Duration::from_millis(10),
        ..IngestSettings::default()
    };
    let t = test_engine_with(settings).await;
    let dispatcher = Dispatcher::new(t.engine.clone());

    let held = t
        .engine
        .locks()
        .acquire(LockKey::new(EntityKind::Plate, SOURCE, "1123"), Duration::from_secs(1))
        .await
        .unwrap();

    let mut rx = dispatcher
        .submit(plate_message(SOURCE, plate_fixture(T1)))
        .await
        .unwrap();

    // Several timeouts pass while the lock is held; the message must still be pending
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(t.count("plates").await, 0);

    drop(held);

    let verdict = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("message was not retried")
        .unwrap();
    assert!(verdict.is_accepted());
    assert_eq!(t.count("plates").await, 1);
}

#[tokio::test]
async fn test_disjoint_identity_not_blocked_by_held_lock() {
    let t = test_engine().await;
    let dispatcher = Dispatcher::new(t.engine.clone());

    let _held = t
        .engine
        .locks()
        .acquire(LockKey::new(EntityKind::Plate, SOURCE, "1123"), Duration::from_secs(1))
        .await
        .unwrap();

    let verdict = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.ingest(plate_message(SOURCE, numbered_plate(7, T1))),
    )
    .await
    .expect("unrelated plate was blocked")
    .unwrap();
    assert!(verdict.is_accepted());
}

#[tokio::test]
async fn test_shutdown_drains_then_refuses() {
    let t = test_engine().await;
    let dispatcher = Dispatcher::new(t.engine.clone());

    let mut receivers = Vec::new();
    for id in 1..=5 {
        receivers.push(
            dispatcher
                .submit(plate_message(SOURCE, numbered_plate(id, T1)))
                .await
                .unwrap(),
        );
    }

    dispatcher.shutdown().await;
    assert_eq!(t.count("plates").await, 5);
    for rx in receivers {
        assert!(rx.await.unwrap().is_accepted());
    }

    let refused = dispatcher
        .submit(plate_message(SOURCE, numbered_plate(6, T1)))
        .await;
    assert!(refused.is_err());
}
