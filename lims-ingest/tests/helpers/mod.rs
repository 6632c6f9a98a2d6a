//! Shared test helpers
//!
//! Each test gets its own SQLite file in a TempDir, initialized through the
//! production `init_database` path. Keep the TempDir alive for the whole test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lims_common::events::{EntityKind, EventBus, IngestEvent};
use lims_ingest::{IngestMessage, IngestSettings, ReconcileEngine, Verdict};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const SOURCE: &str = "example";
pub const SECOND_SOURCE: &str = "second";

pub const SAMPLE_UUID: &str = "000000-0000-0000-0000-0000000000";
pub const STUDY_UUID: &str = "000000-0000-0000-0000-0000000001";

pub const T0: &str = "2012-03-10 10:22:42";
pub const T1: &str = "2012-03-11 10:22:42";
pub const T2: &str = "2012-03-12 10:22:42";

/// Create temporary test database with schema and default settings
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let pool = lims_common::db::init_database(&temp_dir.path().join("lims.db")).await?;
    Ok((temp_dir, pool))
}

pub struct TestEngine {
    pub _temp_dir: TempDir,
    pub pool: SqlitePool,
    pub events: EventBus,
    pub engine: Arc<ReconcileEngine>,
}

pub async fn test_engine() -> TestEngine {
    test_engine_with(IngestSettings::default()).await
}

pub async fn test_engine_with(settings: IngestSettings) -> TestEngine {
    let (temp_dir, pool) = create_test_db().await.expect("test database");
    let events = EventBus::new(settings.event_capacity);
    let engine = Arc::new(ReconcileEngine::new(pool.clone(), events.clone(), settings));
    TestEngine {
        _temp_dir: temp_dir,
        pool,
        events,
        engine,
    }
}

impl TestEngine {
    pub async fn plate(&self, source: &str, payload: Value) -> Verdict {
        let message = IngestMessage::from_value(EntityKind::Plate, source, payload).unwrap();
        self.engine.ingest(&message).await.unwrap()
    }

    pub async fn sample(&self, source: &str, payload: Value) -> Verdict {
        let message = IngestMessage::from_value(EntityKind::Sample, source, payload).unwrap();
        self.engine.ingest(&message).await.unwrap()
    }

    pub async fn study(&self, source: &str, payload: Value) -> Verdict {
        let message = IngestMessage::from_value(EntityKind::Study, source, payload).unwrap();
        self.engine.ingest(&message).await.unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

pub fn well(label: &str, last_updated: &str) -> Value {
    json!({
        "well_label": label,
        "well_uuid_lims": format!("{}_uuid", label),
        "cost_code": "cost_code",
        "sample_uuid": SAMPLE_UUID,
        "study_uuid": STUDY_UUID,
        "qc_state": 1,
        "last_updated": last_updated
    })
}

/// The reference plate: 1123, barcode 111, size 96, cost code 2222, wells S01/S02
pub fn plate_fixture(last_updated: &str) -> Value {
    json!({
        "id_flgen_plate_lims": 1123,
        "plate_barcode": 111,
        "plate_barcode_lims": "barcode",
        "plate_uuid_lims": "plate_uuid",
        "plate_size": "96",
        "cost_code": "2222",
        "last_updated": last_updated,
        "wells": [well("S01", last_updated), well("S02", last_updated)]
    })
}

pub fn sample_fixture(uuid: &str, last_updated: &str) -> Value {
    json!({
        "uuid_sample_lims": uuid,
        "id_sample_lims": 1,
        "name": "sample",
        "last_updated": last_updated
    })
}

pub fn study_fixture(uuid: &str, last_updated: &str) -> Value {
    json!({
        "uuid_study_lims": uuid,
        "id_study_lims": 1,
        "name": "study",
        "last_updated": last_updated
    })
}

/// Wait for the first event matching `pred`, failing after five seconds
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<IngestEvent>, mut pred: F) -> IngestEvent
where
    F: FnMut(&IngestEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
