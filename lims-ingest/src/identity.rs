//! Identity resolver
//!
//! Maps (source, kind, external id) to the internal GUID of a plate, sample or
//! study. The durable mapping lives in `lims_identities`; entity tables are
//! also consulted so rows written before the mapping existed are still found,
//! and so a mapping that disagrees with the data is reported as a conflict
//! rather than silently followed.
//!
//! Wells are not resolved here: a well's identity is its (plate, label) pair.

use lims_common::events::EntityKind;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::parse_guid;
use crate::db::references::ReferenceTable;
use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// `registered` is false for legacy rows with no mapping yet
    Found { guid: Uuid, registered: bool },
    NotFound,
}

/// (table, external id column) holding entities of `kind`
fn natural_key(kind: EntityKind) -> IngestResult<(&'static str, &'static str)> {
    match kind {
        EntityKind::Plate => Ok(("plates", "id_flgen_plate_lims")),
        EntityKind::Sample | EntityKind::Study => {
            let table = ReferenceTable::for_kind(kind)?;
            Ok((table.table, table.uuid_column))
        }
    }
}

pub async fn resolve(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: &str,
    external_id: &str,
) -> IngestResult<Resolution> {
    let registered: Option<String> = sqlx::query_scalar(
        "SELECT guid FROM lims_identities WHERE id_lims = ? AND entity_kind = ? AND external_id = ?",
    )
    .bind(source)
    .bind(kind.as_str())
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?;

    let (table, column) = natural_key(kind)?;
    let sql = format!(
        "SELECT guid FROM {} WHERE id_lims = ? AND {} = ? ORDER BY guid",
        table, column
    );
    let stored: Vec<String> = sqlx::query_scalar(&sql)
        .bind(source)
        .bind(external_id)
        .fetch_all(&mut *conn)
        .await?;

    let mut handles: Vec<Uuid> = Vec::with_capacity(stored.len() + 1);
    if let Some(raw) = registered.as_deref() {
        handles.push(parse_guid(raw)?);
    }
    for raw in &stored {
        let guid = parse_guid(raw)?;
        if !handles.contains(&guid) {
            handles.push(guid);
        }
    }

    match handles.as_slice() {
        [] => Ok(Resolution::NotFound),
        [guid] => Ok(Resolution::Found {
            guid: *guid,
            registered: registered.is_some(),
        }),
        _ => Err(IngestError::IdentityConflict {
            kind,
            id_lims: source.to_string(),
            external_id: external_id.to_string(),
            handles,
        }),
    }
}

/// Write the mapping for a newly created (or legacy) entity
///
/// Must run in the same transaction as the entity's first write. A mapping is
/// never rewritten: an existing row for the same key is a conflict.
pub async fn register(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: &str,
    external_id: &str,
    guid: Uuid,
) -> IngestResult<()> {
    let result = sqlx::query(
        "INSERT INTO lims_identities (guid, id_lims, entity_kind, external_id) VALUES (?, ?, ?, ?)",
    )
    .bind(guid.to_string())
    .bind(source)
    .bind(kind.as_str())
    .bind(external_id)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT guid FROM lims_identities WHERE id_lims = ? AND entity_kind = ? AND external_id = ?",
            )
            .bind(source)
            .bind(kind.as_str())
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;

            let mut handles = vec![guid];
            if let Some(raw) = existing.as_deref() {
                let other = parse_guid(raw)?;
                if other != guid {
                    handles.push(other);
                }
            }
            Err(IngestError::IdentityConflict {
                kind,
                id_lims: source.to_string(),
                external_id: external_id.to_string(),
                handles,
            })
        }
        Err(err) => Err(err.into()),
    }
}
