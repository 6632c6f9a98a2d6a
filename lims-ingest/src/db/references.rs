//! Sample and study persistence
//!
//! Samples and studies share one row shape and differ only in table and
//! column names.

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::parse_guid;
use crate::error::{IngestError, IngestResult};
use crate::identity::{self, Resolution};
use crate::payload::ReferencePayload;

/// Table layout for one referenceable kind
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReferenceTable {
    pub table: &'static str,
    pub uuid_column: &'static str,
    pub id_column: &'static str,
}

impl ReferenceTable {
    pub fn for_kind(kind: EntityKind) -> IngestResult<Self> {
        match kind {
            EntityKind::Sample => Ok(Self {
                table: "samples",
                uuid_column: "uuid_sample_lims",
                id_column: "id_sample_lims",
            }),
            EntityKind::Study => Ok(Self {
                table: "studies",
                uuid_column: "uuid_study_lims",
                id_column: "id_study_lims",
            }),
            EntityKind::Plate => Err(IngestError::Common(lims_common::Error::Internal(
                "plates are not a reference table".to_string(),
            ))),
        }
    }
}

/// Stored sample or study
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRecord {
    pub guid: Uuid,
    pub kind: EntityKind,
    pub id_lims: String,
    pub uuid: String,
    pub lims_id: String,
    pub name: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

pub async fn load_last_updated(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    guid: Uuid,
) -> IngestResult<Option<DateTime<Utc>>> {
    let table = ReferenceTable::for_kind(kind)?;
    let sql = format!("SELECT last_updated FROM {} WHERE guid = ?", table.table);

    let stored: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
        .bind(guid.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    Ok(stored)
}

/// Insert a new sample/study; the LIMS id must be present
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    guid: Uuid,
    source: &str,
    external_id: &str,
    payload: &ReferencePayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    let table = ReferenceTable::for_kind(kind)?;
    let lims_id = payload
        .lims_id
        .as_deref()
        .ok_or_else(|| IngestError::validation(kind.as_str(), external_id, table.id_column))?;

    let sql = format!(
        "INSERT INTO {} (guid, id_lims, {}, {}, name, last_updated, recorded_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        table.table, table.uuid_column, table.id_column
    );

    sqlx::query(&sql)
        .bind(guid.to_string())
        .bind(source)
        .bind(external_id)
        .bind(lims_id)
        .bind(&payload.name)
        .bind(last_updated)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn update(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    guid: Uuid,
    payload: &ReferencePayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    let table = ReferenceTable::for_kind(kind)?;
    let sql = format!(
        "UPDATE {table} SET {id} = COALESCE(?, {id}), name = COALESCE(?, name), last_updated = ?, recorded_at = ? WHERE guid = ?",
        table = table.table,
        id = table.id_column
    );

    sqlx::query(&sql)
        .bind(&payload.lims_id)
        .bind(&payload.name)
        .bind(last_updated)
        .bind(now)
        .bind(guid.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Look up a sample or study by source and uuid
pub async fn load_reference(
    pool: &SqlitePool,
    kind: EntityKind,
    source: &str,
    uuid: &str,
) -> IngestResult<Option<ReferenceRecord>> {
    let table = ReferenceTable::for_kind(kind)?;
    let mut conn = pool.acquire().await?;

    let guid = match identity::resolve(&mut conn, kind, source, uuid).await? {
        Resolution::Found { guid, .. } => guid,
        Resolution::NotFound => return Ok(None),
    };

    let sql = format!(
        "SELECT guid, id_lims, {} AS uuid, {} AS lims_id, name, last_updated, recorded_at FROM {} WHERE guid = ?",
        table.uuid_column, table.id_column, table.table
    );
    let row = sqlx::query(&sql)
        .bind(guid.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let guid_str: String = row.try_get("guid")?;
    Ok(Some(ReferenceRecord {
        guid: parse_guid(&guid_str)?,
        kind,
        id_lims: row.try_get("id_lims")?,
        uuid: row.try_get("uuid")?,
        lims_id: row.try_get("lims_id")?,
        name: row.try_get("name")?,
        last_updated: row.try_get("last_updated")?,
        recorded_at: row.try_get("recorded_at")?,
    }))
}

pub async fn load_sample(pool: &SqlitePool, source: &str, uuid: &str) -> IngestResult<Option<ReferenceRecord>> {
    load_reference(pool, EntityKind::Sample, source, uuid).await
}

pub async fn load_study(pool: &SqlitePool, source: &str, uuid: &str) -> IngestResult<Option<ReferenceRecord>> {
    load_reference(pool, EntityKind::Study, source, uuid).await
}
