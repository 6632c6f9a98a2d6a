//! Sample and study upsert path
//!
//! Same identity, staleness and partial-update rules as plates. The caller
//! announces `IdentityAvailable` after commit so waiting wells get linked.

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::SqliteConnection;
use tracing::debug;
use uuid::Uuid;

use crate::db::references::{self, ReferenceTable};
use crate::error::{IngestError, IngestResult};
use crate::identity::{self, Resolution};
use crate::outcome::{EntityOutcome, ReferenceReport};
use crate::payload::ReferencePayload;
use crate::staleness::{self, Gate};

pub async fn reconcile_reference(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: &str,
    payload: &ReferencePayload,
    now: DateTime<Utc>,
) -> IngestResult<ReferenceReport> {
    let table = ReferenceTable::for_kind(kind)?;
    let external_id = payload.external_id(kind)?;
    let incoming = payload.require_last_updated(kind)?;

    let (guid, registered, stored) = match identity::resolve(conn, kind, source, external_id).await? {
        Resolution::Found { guid, registered } => {
            let stored = references::load_last_updated(conn, kind, guid).await?;
            (guid, registered, stored)
        }
        Resolution::NotFound => (Uuid::new_v4(), false, None),
    };

    if stored.is_none() && payload.lims_id.is_none() {
        return Err(IngestError::validation(kind.as_str(), external_id, table.id_column));
    }

    let outcome = match (staleness::check(stored, incoming), stored) {
        (Gate::Accept, None) => {
            references::insert(conn, kind, guid, source, external_id, payload, incoming, now).await?;
            EntityOutcome::Created
        }
        (Gate::Accept, Some(_)) => {
            references::update(conn, kind, guid, payload, incoming, now).await?;
            EntityOutcome::Updated
        }
        (Gate::RejectStale, stored) => {
            debug!(
                kind = %kind,
                source,
                external_id,
                stored = ?stored,
                incoming = %incoming,
                "Stale update ignored"
            );
            EntityOutcome::StaleIgnored
        }
    };

    if !registered {
        identity::register(conn, kind, source, external_id, guid).await?;
    }

    Ok(ReferenceReport {
        kind,
        guid,
        external_id: external_id.to_string(),
        outcome,
    })
}
