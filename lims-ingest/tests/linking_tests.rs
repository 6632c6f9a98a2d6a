//! Deferred linking tests
//!
//! Covers:
//! - Wells referencing missing samples/studies are stored and linked later
//! - Linking never changes a well's last_updated
//! - Obligation sweep (explicit and at worker startup)
//! - Replaced and cleared references
//! - References resolve only within the same source

mod helpers;

use helpers::*;
use lims_common::events::{EntityKind, IngestEvent};
use lims_ingest::db::{load_plate, load_sample, pending_obligations};
use lims_ingest::{linker, LinkOutcome, LinkWorker};
use serde_json::json;

fn is_linked(kind: EntityKind) -> impl FnMut(&IngestEvent) -> bool {
    move |event| matches!(event, IngestEvent::WellsLinked { kind: k, .. } if *k == kind)
}

#[tokio::test]
async fn test_sample_arriving_after_wells_links_them() {
    let t = test_engine().await;
    let worker = LinkWorker::spawn(t.pool.clone(), t.events.clone(), 5000);
    let mut rx = t.events.subscribe();

    let verdict = t.plate(SOURCE, plate_fixture(T1)).await;
    let report = verdict.plate_report().unwrap();
    assert!(report
        .wells
        .iter()
        .all(|w| w.sample == LinkOutcome::Deferred && w.study == LinkOutcome::Deferred));
    assert_eq!(pending_obligations(&t.pool).await.unwrap().len(), 4);

    let before = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert!(before.wells.iter().all(|w| w.sample_guid.is_none()));

    t.sample(SOURCE, sample_fixture(SAMPLE_UUID, T1)).await;

    match wait_for_event(&mut rx, is_linked(EntityKind::Sample)).await {
        IngestEvent::WellsLinked { well_count, external_id, .. } => {
            assert_eq!(well_count, 2);
            assert_eq!(external_id, SAMPLE_UUID);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let sample = load_sample(&t.pool, SOURCE, SAMPLE_UUID).await.unwrap().unwrap();
    let after = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    for (old, new) in before.wells.iter().zip(&after.wells) {
        assert_eq!(new.sample_guid, Some(sample.guid));
        assert_eq!(new.study_guid, None);
        assert_eq!(new.last_updated, old.last_updated);
    }

    let remaining = pending_obligations(&t.pool).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|o| o.kind == EntityKind::Study));

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plate_and_sample_ingested_concurrently_end_linked() {
    for _ in 0..10 {
        let t = test_engine().await;
        let worker = LinkWorker::spawn(t.pool.clone(), t.events.clone(), 5000);
        let mut rx = t.events.subscribe();

        let plate = {
            let engine = t.engine.clone();
            tokio::spawn(async move {
                let message = lims_ingest::IngestMessage::from_value(
                    EntityKind::Plate,
                    SOURCE,
                    plate_fixture(T1),
                )
                .unwrap();
                engine.ingest(&message).await.unwrap()
            })
        };
        let sample = {
            let engine = t.engine.clone();
            tokio::spawn(async move {
                let message = lims_ingest::IngestMessage::from_value(
                    EntityKind::Sample,
                    SOURCE,
                    sample_fixture(SAMPLE_UUID, T1),
                )
                .unwrap();
                engine.ingest(&message).await.unwrap()
            })
        };

        let plate_verdict = plate.await.unwrap();
        assert!(plate_verdict.is_accepted());
        assert!(sample.await.unwrap().is_accepted());

        // Wells may have been linked inline or deferred; deferred ones get a WellsLinked
        let deferred = plate_verdict
            .plate_report()
            .unwrap()
            .wells
            .iter()
            .any(|w| w.sample == LinkOutcome::Deferred);
        if deferred {
            wait_for_event(&mut rx, is_linked(EntityKind::Sample)).await;
        }
        worker.shutdown().await;

        let sample = load_sample(&t.pool, SOURCE, SAMPLE_UUID).await.unwrap().unwrap();
        let stored = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
        assert!(stored.wells.iter().all(|w| w.sample_guid == Some(sample.guid)));

        let samples_waiting = pending_obligations(&t.pool)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.kind == EntityKind::Sample)
            .count();
        assert_eq!(samples_waiting, 0);
    }
}

#[tokio::test]
async fn test_sweep_links_without_events() {
    let t = test_engine().await;
    t.plate(SOURCE, plate_fixture(T1)).await;
    t.sample(SOURCE, sample_fixture(SAMPLE_UUID, T1)).await;
    t.study(SOURCE, study_fixture(STUDY_UUID, T1)).await;

    // No worker was running, so the obligations are still outstanding
    assert_eq!(pending_obligations(&t.pool).await.unwrap().len(), 4);

    let linked = linker::sweep(&t.pool, &t.events, 5000).await.unwrap();
    assert_eq!(linked, 4);
    assert!(pending_obligations(&t.pool).await.unwrap().is_empty());

    let plate = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert!(plate
        .wells
        .iter()
        .all(|w| w.sample_guid.is_some() && w.study_guid.is_some()));
}

#[tokio::test]
async fn test_worker_sweeps_on_startup() {
    let t = test_engine().await;
    t.plate(SOURCE, plate_fixture(T1)).await;
    t.study(SOURCE, study_fixture(STUDY_UUID, T1)).await;

    let mut rx = t.events.subscribe();
    let worker = LinkWorker::spawn(t.pool.clone(), t.events.clone(), 5000);

    wait_for_event(&mut rx, is_linked(EntityKind::Study)).await;
    worker.shutdown().await;

    let plate = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert!(plate.wells.iter().all(|w| w.study_guid.is_some()));
    assert!(plate.wells.iter().all(|w| w.sample_guid.is_none()));
}

#[tokio::test]
async fn test_newer_reference_replaces_obligation() {
    let t = test_engine().await;
    t.sample(SOURCE, sample_fixture(SAMPLE_UUID, T1)).await;
    t.plate(SOURCE, plate_fixture(T1)).await;

    let plate = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert!(plate.wells[0].sample_guid.is_some());

    let mut moved = well("S01", T2);
    moved["sample_uuid"] = json!("not-yet-ingested");
    let verdict = t
        .plate(SOURCE, json!({"id_flgen_plate_lims": "1123", "last_updated": T0, "wells": [moved]}))
        .await;
    assert_eq!(verdict.plate_report().unwrap().wells[0].sample, LinkOutcome::Deferred);

    let plate = load_plate(&t.pool, SOURCE, "1123").await.unwrap().unwrap();
    assert_eq!(plate.wells[0].sample_guid, None);

    let waiting: Vec<_> = pending_obligations(&t.pool)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.kind == EntityKind::Sample)
        .collect();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].external_id, "not-yet-ingested");
    assert_eq!(waiting[0].well_guid, plate.wells[0].guid);
}

#[tokio::test]
async fn test_empty_reference_clears_link_and_obligation() {
    let t = test_engine().await;
    t.plate(SOURCE, plate_fixture(T1)).await;

    let mut cleared = well("S01", T2);
    cleared["study_uuid"] = json!("");
    let verdict = t
        .plate(SOURCE, json!({"id_flgen_plate_lims": "1123", "last_updated": T0, "wells": [cleared]}))
        .await;
    assert_eq!(verdict.plate_report().unwrap().wells[0].study, LinkOutcome::Cleared);

    let studies_waiting = pending_obligations(&t.pool)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.kind == EntityKind::Study)
        .count();
    assert_eq!(studies_waiting, 1, "only S02 still waits on the study");
}

#[tokio::test]
async fn test_reference_from_other_source_not_linked() {
    let t = test_engine().await;
    t.sample(SECOND_SOURCE, sample_fixture(SAMPLE_UUID, T1)).await;

    let verdict = t.plate(SOURCE, plate_fixture(T1)).await;
    assert!(verdict
        .plate_report()
        .unwrap()
        .wells
        .iter()
        .all(|w| w.sample == LinkOutcome::Deferred));

    let linked = linker::sweep(&t.pool, &t.events, 5000).await.unwrap();
    assert_eq!(linked, 0);
}
