//! Nested transaction coordinator
//!
//! Reconciles one plate message (the plate plus its embedded wells) on a
//! connection that the caller has already placed inside a transaction.
//!
//! Runs in two phases:
//! 1. Validate: resolve identities and check required fields for every entity
//!    the message would create. No writes.
//! 2. Apply: upsert the plate (unless stale), then each well (each gated on its
//!    own timestamp) followed by its sample/study links.
//!
//! Any error leaves the transaction for the caller to roll back, so nothing
//! from a failed message is persisted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{plates, wells};
use crate::error::{IngestError, IngestResult};
use crate::identity::{self, Resolution};
use crate::linker;
use crate::outcome::{EntityOutcome, LinkOutcome, PlateReport, WellReport};
use crate::payload::PlatePayload;
use crate::staleness::{self, Gate};

/// Plate identity and stored state found during validation
struct PlateTarget {
    guid: Uuid,
    registered: bool,
    stored: Option<DateTime<Utc>>,
}

pub async fn reconcile_plate(
    conn: &mut SqliteConnection,
    source: &str,
    payload: &PlatePayload,
    now: DateTime<Utc>,
) -> IngestResult<PlateReport> {
    let external_id = payload.external_id()?;
    let incoming = payload.require_last_updated()?;

    let target = validate(conn, source, external_id, payload).await?;
    let gate = staleness::check(target.stored, incoming);

    let outcome = match (gate, target.stored) {
        (Gate::Accept, None) => {
            plates::insert(conn, target.guid, source, external_id, payload, incoming, now).await?;
            EntityOutcome::Created
        }
        (Gate::Accept, Some(_)) => {
            plates::update(conn, target.guid, payload, incoming, now).await?;
            EntityOutcome::Updated
        }
        (Gate::RejectStale, stored) => {
            info!(
                source,
                plate = external_id,
                stored = ?stored,
                incoming = %incoming,
                "Stale plate update ignored, processing wells"
            );
            EntityOutcome::StaleIgnored
        }
    };

    if !target.registered {
        identity::register(conn, EntityKind::Plate, source, external_id, target.guid).await?;
    }

    let mut well_reports = Vec::with_capacity(payload.wells.len());
    for well in &payload.wells {
        let label = well.label()?;
        let incoming = well.require_last_updated()?;
        let existing = wells::find_by_label(conn, target.guid, label).await?;

        let gate = staleness::check(existing.map(|w| w.last_updated), incoming);
        if let (Gate::RejectStale, Some(state)) = (gate, existing) {
            debug!(
                source,
                plate = external_id,
                well = label,
                stored = %state.last_updated,
                incoming = %incoming,
                "Stale well update ignored"
            );
            well_reports.push(WellReport {
                label: label.to_string(),
                guid: state.guid,
                outcome: EntityOutcome::StaleIgnored,
                sample: LinkOutcome::Untouched,
                study: LinkOutcome::Untouched,
            });
            continue;
        }

        let (well_guid, outcome) = match existing {
            Some(state) => {
                wells::update(conn, state.guid, well, incoming, now).await?;
                (state.guid, EntityOutcome::Updated)
            }
            None => {
                let guid = Uuid::new_v4();
                wells::insert(conn, guid, target.guid, label, well, incoming, now).await?;
                (guid, EntityOutcome::Created)
            }
        };

        let sample = linker::link_well(
            conn,
            source,
            well_guid,
            EntityKind::Sample,
            well.reference(EntityKind::Sample),
        )
        .await?;
        let study = linker::link_well(
            conn,
            source,
            well_guid,
            EntityKind::Study,
            well.reference(EntityKind::Study),
        )
        .await?;

        well_reports.push(WellReport {
            label: label.to_string(),
            guid: well_guid,
            outcome,
            sample,
            study,
        });
    }

    Ok(PlateReport {
        guid: target.guid,
        external_id: external_id.to_string(),
        outcome,
        wells: well_reports,
    })
}

/// Check everything the message would need before the first write
async fn validate(
    conn: &mut SqliteConnection,
    source: &str,
    external_id: &str,
    payload: &PlatePayload,
) -> IngestResult<PlateTarget> {
    let target = match identity::resolve(conn, EntityKind::Plate, source, external_id).await? {
        Resolution::Found { guid, registered } => PlateTarget {
            guid,
            registered,
            stored: plates::load_last_updated(conn, guid).await?,
        },
        Resolution::NotFound => PlateTarget {
            guid: Uuid::new_v4(),
            registered: false,
            stored: None,
        },
    };

    if target.stored.is_none() && payload.barcode().is_none() {
        return Err(IngestError::validation("plate", external_id, "plate_barcode"));
    }
    if matches!(payload.plate_size, Some(size) if size <= 0) {
        return Err(IngestError::validation("plate", external_id, "plate_size"));
    }

    // A label repeated within the message is new only on its first occurrence
    let mut seen: HashSet<&str> = HashSet::new();
    for well in &payload.wells {
        let label = well.label()?;
        well.require_last_updated()?;

        let first_occurrence = seen.insert(label);
        if !first_occurrence {
            continue;
        }

        let exists = match target.stored {
            Some(_) => wells::find_by_label(conn, target.guid, label).await?.is_some(),
            None => false,
        };
        if !exists && well.cost_code.is_none() {
            return Err(IngestError::validation("well", label, "cost_code"));
        }
    }

    Ok(target)
}
