//! Reconcile engine
//!
//! Runs one message end to end: take the identity lock, reconcile inside a
//! single transaction (retried whole on SQLite lock contention), commit, then
//! announce the result on the event bus.

use lims_common::events::{EntityKind, EventBus, IngestEvent};
use sqlx::SqlitePool;
use tracing::{debug, error, warn};

use crate::coordinator;
use crate::error::{IngestError, IngestResult};
use crate::locks::{IdentityLocks, LockKey};
use crate::outcome::{PlateReport, ReferenceReport, Report, Verdict};
use crate::payload::{IngestMessage, PlatePayload, ReferencePayload};
use crate::reference_sync;
use crate::settings::IngestSettings;
use crate::utils::retry_on_lock;

pub struct ReconcileEngine {
    pool: SqlitePool,
    events: EventBus,
    locks: IdentityLocks,
    settings: IngestSettings,
}

impl ReconcileEngine {
    pub fn new(pool: SqlitePool, events: EventBus, settings: IngestSettings) -> Self {
        Self {
            pool,
            events,
            locks: IdentityLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    /// Process one message and produce its verdict
    ///
    /// Only requeueable failures (identity lock timeout) come back as `Err`;
    /// every other failure is turned into a rejected verdict and announced.
    pub async fn ingest(&self, message: &IngestMessage) -> IngestResult<Verdict> {
        let result = match message {
            IngestMessage::Plate { source, payload } => {
                self.ingest_plate(source, payload).await.map(Report::Plate)
            }
            IngestMessage::Sample { source, payload } => self
                .upsert_reference(EntityKind::Sample, source, payload)
                .await
                .map(Report::Reference),
            IngestMessage::Study { source, payload } => self
                .upsert_reference(EntityKind::Study, source, payload)
                .await
                .map(Report::Reference),
        };

        match result {
            Ok(report) => Ok(Verdict::Accepted(report)),
            Err(err) if err.is_requeueable() => Err(err),
            Err(err) => Ok(self.reject(message, &err)),
        }
    }

    fn reject(&self, message: &IngestMessage, err: &IngestError) -> Verdict {
        let source = message.source();
        let external_id = message.external_id();

        match err {
            IngestError::Validation { .. } => warn!(
                kind = %message.kind(),
                source,
                external_id = ?external_id,
                "Message rejected: {}",
                err
            ),
            _ => error!(
                kind = %message.kind(),
                source,
                external_id = ?external_id,
                reason = %err.reject_reason(),
                "Message rejected: {}",
                err
            ),
        }

        let verdict = Verdict::rejected(external_id, err);
        self.events.emit_lossy(IngestEvent::MessageRejected {
            source: source.to_string(),
            external_id: external_id.map(str::to_string),
            reason: err.reject_reason().code().to_string(),
            detail: err.to_string(),
            timestamp: lims_common::time::now(),
        });
        verdict
    }

    /// Reconcile a plate message without converting errors to a verdict
    pub async fn ingest_plate(&self, source: &str, payload: &PlatePayload) -> IngestResult<PlateReport> {
        let external_id = payload.external_id()?;
        let guard = self
            .locks
            .acquire(
                LockKey::new(EntityKind::Plate, source, external_id),
                self.settings.identity_lock_timeout,
            )
            .await?;
        debug!(lock = %guard.key(), "Identity lock acquired");

        let pool = &self.pool;
        let report = retry_on_lock("plate reconcile", self.settings.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let report =
                coordinator::reconcile_plate(&mut tx, source, payload, lims_common::time::now()).await?;
            tx.commit().await?;
            Ok::<_, IngestError>(report)
        })
        .await?;

        self.events.emit_lossy(IngestEvent::PlateReconciled {
            guid: report.guid,
            source: source.to_string(),
            external_id: report.external_id.clone(),
            outcome: report.outcome.as_str().to_string(),
            wells_written: report.wells_written(),
            timestamp: lims_common::time::now(),
        });

        Ok(report)
    }

    /// Upsert a sample or study without converting errors to a verdict
    ///
    /// Emits `IdentityAvailable` after a committed create or update.
    pub async fn upsert_reference(
        &self,
        kind: EntityKind,
        source: &str,
        payload: &ReferencePayload,
    ) -> IngestResult<ReferenceReport> {
        let external_id = payload.external_id(kind)?;
        let guard = self
            .locks
            .acquire(
                LockKey::new(kind, source, external_id),
                self.settings.identity_lock_timeout,
            )
            .await?;
        debug!(lock = %guard.key(), "Identity lock acquired");

        let pool = &self.pool;
        let report = retry_on_lock("reference upsert", self.settings.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let report = reference_sync::reconcile_reference(
                &mut tx,
                kind,
                source,
                payload,
                lims_common::time::now(),
            )
            .await?;
            tx.commit().await?;
            Ok::<_, IngestError>(report)
        })
        .await?;

        if report.outcome.wrote() {
            self.events.emit_lossy(IngestEvent::IdentityAvailable {
                kind,
                source: source.to_string(),
                external_id: report.external_id.clone(),
                guid: report.guid,
                timestamp: lims_common::time::now(),
            });
        }

        Ok(report)
    }

    pub async fn upsert_sample(&self, source: &str, payload: &ReferencePayload) -> IngestResult<ReferenceReport> {
        self.upsert_reference(EntityKind::Sample, source, payload).await
    }

    pub async fn upsert_study(&self, source: &str, payload: &ReferencePayload) -> IngestResult<ReferenceReport> {
        self.upsert_reference(EntityKind::Study, source, payload).await
    }
}
