//! Well persistence
//!
//! A well is identified by (plate_guid, well_label). Sample and study columns
//! are nullable foreign keys maintained by the linker.

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{parse_guid, parse_opt_guid};
use crate::error::{IngestError, IngestResult};
use crate::payload::WellPayload;

#[derive(Debug, Clone, PartialEq)]
pub struct WellRecord {
    pub guid: Uuid,
    pub plate_guid: Uuid,
    pub well_label: String,
    pub well_uuid_lims: Option<String>,
    pub cost_code: String,
    pub qc_state: Option<String>,
    pub sample_guid: Option<Uuid>,
    pub study_guid: Option<Uuid>,
    pub last_updated: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellState {
    pub guid: Uuid,
    pub last_updated: DateTime<Utc>,
}

/// Column on `wells` holding the reference for `kind`
pub(crate) fn reference_column(kind: EntityKind) -> IngestResult<&'static str> {
    match kind {
        EntityKind::Sample => Ok("sample_guid"),
        EntityKind::Study => Ok("study_guid"),
        EntityKind::Plate => Err(IngestError::Common(lims_common::Error::Internal(
            "wells hold no plate reference column".to_string(),
        ))),
    }
}

pub async fn find_by_label(
    conn: &mut SqliteConnection,
    plate_guid: Uuid,
    label: &str,
) -> IngestResult<Option<WellState>> {
    let row = sqlx::query("SELECT guid, last_updated FROM wells WHERE plate_guid = ? AND well_label = ?")
        .bind(plate_guid.to_string())
        .bind(label)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let guid_str: String = row.try_get("guid")?;
            Ok(Some(WellState {
                guid: parse_guid(&guid_str)?,
                last_updated: row.try_get("last_updated")?,
            }))
        }
        None => Ok(None),
    }
}

/// Insert a new well; `cost_code` must be present
pub async fn insert(
    conn: &mut SqliteConnection,
    guid: Uuid,
    plate_guid: Uuid,
    label: &str,
    payload: &WellPayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    let cost_code = payload
        .cost_code
        .as_deref()
        .ok_or_else(|| IngestError::validation("well", label, "cost_code"))?;

    sqlx::query(
        r#"
        INSERT INTO wells (
            guid, plate_guid, well_label, well_uuid_lims, cost_code, qc_state,
            last_updated, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(guid.to_string())
    .bind(plate_guid.to_string())
    .bind(label)
    .bind(&payload.well_uuid_lims)
    .bind(cost_code)
    .bind(&payload.qc_state)
    .bind(last_updated)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Partial update of the well's own fields (references are left to the linker)
pub async fn update(
    conn: &mut SqliteConnection,
    guid: Uuid,
    payload: &WellPayload,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        UPDATE wells SET
            well_uuid_lims = COALESCE(?, well_uuid_lims),
            cost_code = COALESCE(?, cost_code),
            qc_state = COALESCE(?, qc_state),
            last_updated = ?,
            recorded_at = ?
        WHERE guid = ?
        "#,
    )
    .bind(&payload.well_uuid_lims)
    .bind(&payload.cost_code)
    .bind(&payload.qc_state)
    .bind(last_updated)
    .bind(now)
    .bind(guid.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Point a well's sample or study reference at `target` (or clear it)
///
/// Does not touch `last_updated`.
pub async fn set_reference(
    conn: &mut SqliteConnection,
    well_guid: Uuid,
    kind: EntityKind,
    target: Option<Uuid>,
) -> IngestResult<()> {
    let column = reference_column(kind)?;
    let sql = format!("UPDATE wells SET {} = ? WHERE guid = ?", column);

    sqlx::query(&sql)
        .bind(target.map(|guid| guid.to_string()))
        .bind(well_guid.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn load_wells(conn: &mut SqliteConnection, plate_guid: Uuid) -> IngestResult<Vec<WellRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, plate_guid, well_label, well_uuid_lims, cost_code, qc_state,
               sample_guid, study_guid, last_updated, recorded_at
        FROM wells
        WHERE plate_guid = ?
        ORDER BY well_label
        "#,
    )
    .bind(plate_guid.to_string())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> IngestResult<WellRecord> {
            let guid: String = row.try_get("guid")?;
            let plate: String = row.try_get("plate_guid")?;
            Ok(WellRecord {
                guid: parse_guid(&guid)?,
                plate_guid: parse_guid(&plate)?,
                well_label: row.try_get("well_label")?,
                well_uuid_lims: row.try_get("well_uuid_lims")?,
                cost_code: row.try_get("cost_code")?,
                qc_state: row.try_get("qc_state")?,
                sample_guid: parse_opt_guid(row.try_get("sample_guid")?)?,
                study_guid: parse_opt_guid(row.try_get("study_guid")?)?,
                last_updated: row.try_get("last_updated")?,
                recorded_at: row.try_get("recorded_at")?,
            })
        })
        .collect()
}
