//! Deferred-link obligations
//!
//! A row says "well W is waiting for (source, kind, external_id)". At most one
//! row exists per (well, kind); recording a new target replaces the old one.

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::parse_guid;
use super::wells::reference_column;
use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Obligation {
    pub well_guid: Uuid,
    pub kind: EntityKind,
    pub source: String,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// Distinct identity an obligation is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObligationTarget {
    pub kind: EntityKind,
    pub source: String,
    pub external_id: String,
}

pub async fn record(
    conn: &mut SqliteConnection,
    well_guid: Uuid,
    kind: EntityKind,
    source: &str,
    external_id: &str,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        INSERT INTO deferred_links (well_guid, entity_kind, id_lims, external_id)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(well_guid, entity_kind) DO UPDATE SET
            id_lims = excluded.id_lims,
            external_id = excluded.external_id,
            created_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(well_guid.to_string())
    .bind(kind.as_str())
    .bind(source)
    .bind(external_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn clear(conn: &mut SqliteConnection, well_guid: Uuid, kind: EntityKind) -> IngestResult<()> {
    sqlx::query("DELETE FROM deferred_links WHERE well_guid = ? AND entity_kind = ?")
        .bind(well_guid.to_string())
        .bind(kind.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Attach `target` to every well waiting on it and drop those obligations
///
/// Returns the number of wells linked.
pub async fn fulfil(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source: &str,
    external_id: &str,
    target: Uuid,
) -> IngestResult<u64> {
    let column = reference_column(kind)?;
    let sql = format!(
        r#"
        UPDATE wells SET {} = ?
        WHERE guid IN (
            SELECT well_guid FROM deferred_links
            WHERE id_lims = ? AND entity_kind = ? AND external_id = ?
        )
        "#,
        column
    );

    let linked = sqlx::query(&sql)
        .bind(target.to_string())
        .bind(source)
        .bind(kind.as_str())
        .bind(external_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM deferred_links WHERE id_lims = ? AND entity_kind = ? AND external_id = ?")
        .bind(source)
        .bind(kind.as_str())
        .bind(external_id)
        .execute(&mut *conn)
        .await?;

    Ok(linked)
}

/// Every distinct identity some well is still waiting on
pub async fn pending_targets(conn: &mut SqliteConnection) -> IngestResult<Vec<ObligationTarget>> {
    let rows = sqlx::query(
        "SELECT DISTINCT entity_kind, id_lims, external_id FROM deferred_links ORDER BY id_lims, entity_kind, external_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> IngestResult<ObligationTarget> {
            let kind: String = row.try_get("entity_kind")?;
            Ok(ObligationTarget {
                kind: parse_kind(&kind)?,
                source: row.try_get("id_lims")?,
                external_id: row.try_get("external_id")?,
            })
        })
        .collect()
}

/// All outstanding obligations, oldest first
pub async fn pending_obligations(pool: &SqlitePool) -> IngestResult<Vec<Obligation>> {
    let rows = sqlx::query(
        r#"
        SELECT well_guid, entity_kind, id_lims, external_id, created_at
        FROM deferred_links
        ORDER BY created_at, well_guid, entity_kind
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> IngestResult<Obligation> {
            let well_guid: String = row.try_get("well_guid")?;
            let kind: String = row.try_get("entity_kind")?;
            Ok(Obligation {
                well_guid: parse_guid(&well_guid)?,
                kind: parse_kind(&kind)?,
                source: row.try_get("id_lims")?,
                external_id: row.try_get("external_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

fn parse_kind(raw: &str) -> IngestResult<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| {
        IngestError::Common(lims_common::Error::Internal(format!(
            "Unknown entity kind '{}' in deferred_links",
            raw
        )))
    })
}
