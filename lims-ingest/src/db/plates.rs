//! Plate persistence

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_guid, wells, WellRecord};
use crate::error::{IngestError, IngestResult};
use crate::identity::{self, Resolution};
use crate::payload::PlatePayload;

/// Stored plate with its wells, ordered by label
#[derive(Debug, Clone, PartialEq)]
pub struct PlateRecord {
    pub guid: Uuid,
    pub id_lims: String,
    pub id_flgen_plate_lims: String,
    pub plate_barcode: String,
    pub plate_barcode_lims: Option<String>,
    pub plate_uuid_lims: Option<String>,
    pub plate_size: Option<i64>,
    pub cost_code: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub wells: Vec<WellRecord>,
}

/// Stored `last_updated` for a plate, or None if no row exists
pub async fn load_last_updated(
    conn: &mut SqliteConnection,
    guid: Uuid,
) -> IngestResult<Option<DateTime<Utc>>> {
    let stored: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_updated FROM plates WHERE guid = ?")
            .bind(guid.to_string())
            .fetch_optional(&mut *conn)
            .await?;

    Ok(stored)
}

/// Insert a new plate
///
/// A barcode must be present; the caller validates this before any write.
pub async fn insert(
    conn: &mut SqliteConnection,
    guid: Uuid,
    source: &str,
    external_id: &str,
    payload: &PlatePayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    let barcode = payload
        .barcode()
        .ok_or_else(|| IngestError::validation("plate", external_id, "plate_barcode"))?;

    sqlx::query(
        r#"
        INSERT INTO plates (
            guid, id_lims, id_flgen_plate_lims, plate_barcode, plate_barcode_lims,
            plate_uuid_lims, plate_size, cost_code, last_updated, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(guid.to_string())
    .bind(source)
    .bind(external_id)
    .bind(barcode)
    .bind(&payload.plate_barcode_lims)
    .bind(&payload.plate_uuid_lims)
    .bind(payload.plate_size)
    .bind(&payload.cost_code)
    .bind(last_updated)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Partial update: absent payload fields keep their stored value
pub async fn update(
    conn: &mut SqliteConnection,
    guid: Uuid,
    payload: &PlatePayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        UPDATE plates SET
            plate_barcode = COALESCE(?, plate_barcode),
            plate_barcode_lims = COALESCE(?, plate_barcode_lims),
            plate_uuid_lims = COALESCE(?, plate_uuid_lims),
            plate_size = COALESCE(?, plate_size),
            cost_code = COALESCE(?, cost_code),
            last_updated = ?,
            recorded_at = ?
        WHERE guid = ?
        "#,
    )
    .bind(&payload.plate_barcode)
    .bind(&payload.plate_barcode_lims)
    .bind(&payload.plate_uuid_lims)
    .bind(payload.plate_size)
    .bind(&payload.cost_code)
    .bind(last_updated)
    .bind(now)
    .bind(guid.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load a plate and its wells by source and external identifier
pub async fn load_plate(
    pool: &SqlitePool,
    source: &str,
    external_id: &str,
) -> IngestResult<Option<PlateRecord>> {
    let mut conn = pool.acquire().await?;

    let guid = match identity::resolve(&mut conn, EntityKind::Plate, source, external_id).await? {
        Resolution::Found { guid, .. } => guid,
        Resolution::NotFound => return Ok(None),
    };

    let row = sqlx::query(
        r#"
        SELECT guid, id_lims, id_flgen_plate_lims, plate_barcode, plate_barcode_lims,
               plate_uuid_lims, plate_size, cost_code, last_updated, recorded_at
        FROM plates
        WHERE guid = ?
        "#,
    )
    .bind(guid.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let guid_str: String = row.try_get("guid")?;
    let guid = parse_guid(&guid_str)?;
    let wells = wells::load_wells(&mut conn, guid).await?;

    Ok(Some(PlateRecord {
        guid,
        id_lims: row.try_get("id_lims")?,
        id_flgen_plate_lims: row.try_get("id_flgen_plate_lims")?,
        plate_barcode: row.try_get("plate_barcode")?,
        plate_barcode_lims: row.try_get("plate_barcode_lims")?,
        plate_uuid_lims: row.try_get("plate_uuid_lims")?,
        plate_size: row.try_get("plate_size")?,
        cost_code: row.try_get("cost_code")?,
        last_updated: row.try_get("last_updated")?,
        recorded_at: row.try_get("recorded_at")?,
        wells,
    }))
}
