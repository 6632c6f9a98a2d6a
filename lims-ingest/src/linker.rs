//! Relationship linker
//!
//! Attaches well→sample and well→study references. A reference to an entity
//! that has not been ingested is recorded as an obligation in
//! `deferred_links` and the well's column stays NULL. When the target is
//! later committed, its upsert path emits `IdentityAvailable` and the link
//! worker attaches every waiting well.
//!
//! The worker also sweeps all outstanding obligations when it starts and
//! whenever its event subscription lags, so lost events and restarts never
//! strand an obligation.

use lims_common::events::{EntityKind, EventBus, IngestEvent};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{obligations, wells};
use crate::error::{IngestError, IngestResult};
use crate::identity::{self, Resolution};
use crate::outcome::LinkOutcome;
use crate::utils::retry_on_lock;

/// Apply one reference from a well payload
///
/// `None` leaves the current reference alone. An empty string clears it.
pub async fn link_well(
    conn: &mut SqliteConnection,
    source: &str,
    well_guid: Uuid,
    kind: EntityKind,
    reference: Option<&str>,
) -> IngestResult<LinkOutcome> {
    let Some(external_id) = reference else {
        return Ok(LinkOutcome::Untouched);
    };

    if external_id.trim().is_empty() {
        wells::set_reference(conn, well_guid, kind, None).await?;
        obligations::clear(conn, well_guid, kind).await?;
        return Ok(LinkOutcome::Cleared);
    }

    match identity::resolve(conn, kind, source, external_id).await? {
        Resolution::Found { guid, .. } => {
            wells::set_reference(conn, well_guid, kind, Some(guid)).await?;
            obligations::clear(conn, well_guid, kind).await?;
            Ok(LinkOutcome::Attached)
        }
        Resolution::NotFound => {
            wells::set_reference(conn, well_guid, kind, None).await?;
            obligations::record(conn, well_guid, kind, source, external_id).await?;
            debug!(
                well = %well_guid,
                kind = %kind,
                source,
                external_id,
                "Reference not yet ingested, link deferred"
            );
            Ok(LinkOutcome::Deferred)
        }
    }
}

/// Attach `guid` to every well waiting on (kind, source, external_id)
pub async fn fulfil_obligations(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: &str,
    external_id: &str,
    guid: Uuid,
) -> IngestResult<u64> {
    obligations::fulfil(conn, kind, source, external_id, guid).await
}

async fn fulfil_in_transaction(
    pool: &SqlitePool,
    kind: EntityKind,
    source: &str,
    external_id: &str,
    guid: Uuid,
    max_lock_wait_ms: u64,
) -> IngestResult<u64> {
    retry_on_lock("deferred link", max_lock_wait_ms, move || async move {
        let mut tx = pool.begin().await?;
        let linked = fulfil_obligations(&mut tx, kind, source, external_id, guid).await?;
        tx.commit().await?;
        Ok::<_, IngestError>(linked)
    })
    .await
}

fn announce(events: &EventBus, kind: EntityKind, source: &str, external_id: &str, linked: u64) {
    info!(kind = %kind, source, external_id, wells = linked, "Deferred links fulfilled");
    events.emit_lossy(IngestEvent::WellsLinked {
        kind,
        source: source.to_string(),
        external_id: external_id.to_string(),
        well_count: linked as usize,
        timestamp: lims_common::time::now(),
    });
}

/// Fulfil every outstanding obligation whose target now exists
///
/// Returns the number of wells linked.
pub async fn sweep(pool: &SqlitePool, events: &EventBus, max_lock_wait_ms: u64) -> IngestResult<u64> {
    let targets = {
        let mut conn = pool.acquire().await?;
        obligations::pending_targets(&mut conn).await?
    };

    let mut total = 0;
    for target in targets {
        let resolution = {
            let mut conn = pool.acquire().await?;
            identity::resolve(&mut conn, target.kind, &target.source, &target.external_id).await?
        };
        let Resolution::Found { guid, .. } = resolution else {
            continue;
        };

        let linked = fulfil_in_transaction(
            pool,
            target.kind,
            &target.source,
            &target.external_id,
            guid,
            max_lock_wait_ms,
        )
        .await?;

        if linked > 0 {
            announce(events, target.kind, &target.source, &target.external_id, linked);
            total += linked;
        }
    }

    debug!(linked = total, "Obligation sweep complete");
    Ok(total)
}

/// Background task that fulfils obligations as identities become available
pub struct LinkWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LinkWorker {
    /// Subscribe to `events` and start the worker
    ///
    /// The subscription is taken before this returns, so no event emitted
    /// afterwards is missed.
    pub fn spawn(pool: SqlitePool, events: EventBus, max_lock_wait_ms: u64) -> Self {
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = sweep(&pool, &events, max_lock_wait_ms).await {
                error!("Startup obligation sweep failed: {}", e);
            }

            loop {
                let received = tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    _ = token.cancelled() => break,
                };

                match received {
                    Ok(IngestEvent::IdentityAvailable {
                        kind,
                        source,
                        external_id,
                        guid,
                        ..
                    }) => {
                        match fulfil_in_transaction(
                            &pool,
                            kind,
                            &source,
                            &external_id,
                            guid,
                            max_lock_wait_ms,
                        )
                        .await
                        {
                            Ok(0) => {}
                            Ok(linked) => announce(&events, kind, &source, &external_id, linked),
                            Err(e) => error!(
                                kind = %kind,
                                source = %source,
                                external_id = %external_id,
                                "Failed to fulfil deferred links: {}",
                                e
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Link worker lagged behind event bus, sweeping obligations");
                        if let Err(e) = sweep(&pool, &events, max_lock_wait_ms).await {
                            error!("Obligation sweep failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            debug!("Link worker stopped");
        });

        Self { handle, cancel }
    }

    /// Stop after draining events already queued for the worker
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Link worker task failed: {}", e);
        }
    }
}
