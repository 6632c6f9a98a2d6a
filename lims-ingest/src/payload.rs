//! Inbound message payloads
//!
//! Boundary types for plate, sample and study messages. Deserialization
//! normalizes the loose typing LIMS sources use: identifiers and codes may be
//! JSON numbers or strings, `plate_size` may be `96` or `"96"`, and
//! `last_updated` may be RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
//!
//! Every optional field distinguishes "absent" (`None`, leave the stored value
//! alone) from "present". JSON `null` counts as absent. A present empty string
//! is kept verbatim.

use chrono::{DateTime, Utc};
use lims_common::events::EntityKind;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, IngestResult};

/// One plate event with its embedded wells
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatePayload {
    /// External plate identifier within the source
    #[serde(default, alias = "id_lims_external", deserialize_with = "opt_string_or_number")]
    pub id_flgen_plate_lims: Option<String>,

    /// Numeric barcode; required when the plate is new
    #[serde(default, alias = "barcode_numeric", deserialize_with = "opt_string_or_number")]
    pub plate_barcode: Option<String>,

    /// Human-facing LIMS barcode
    #[serde(default, alias = "barcode", deserialize_with = "opt_string_or_number")]
    pub plate_barcode_lims: Option<String>,

    #[serde(default, alias = "plate_uuid", deserialize_with = "opt_string_or_number")]
    pub plate_uuid_lims: Option<String>,

    /// Well-count capacity
    #[serde(default, deserialize_with = "opt_i64")]
    pub plate_size: Option<i64>,

    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cost_code: Option<String>,

    #[serde(default, deserialize_with = "opt_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "wells_or_null")]
    pub wells: Vec<WellPayload>,
}

/// One well embedded in a plate event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WellPayload {
    /// Position on the plate, e.g. "S01"
    #[serde(default, alias = "map", deserialize_with = "opt_string_or_number")]
    pub well_label: Option<String>,

    #[serde(default, alias = "well_uuid", deserialize_with = "opt_string_or_number")]
    pub well_uuid_lims: Option<String>,

    /// Required when the well is new
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cost_code: Option<String>,

    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sample_uuid: Option<String>,

    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub study_uuid: Option<String>,

    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub qc_state: Option<String>,

    #[serde(default, deserialize_with = "opt_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Sample or study event
///
/// Both kinds share one shape: the uuid is the external identifier that wells
/// reference, the LIMS id is the source's own numeric key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePayload {
    #[serde(
        default,
        alias = "uuid_sample_lims",
        alias = "uuid_study_lims",
        deserialize_with = "opt_string_or_number"
    )]
    pub uuid: Option<String>,

    /// Required when the sample/study is new
    #[serde(
        default,
        alias = "id_sample_lims",
        alias = "id_study_lims",
        deserialize_with = "opt_string_or_number"
    )]
    pub lims_id: Option<String>,

    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "opt_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PlatePayload {
    pub fn external_id(&self) -> IngestResult<&str> {
        self.id_flgen_plate_lims
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IngestError::validation("plate", "<unknown>", "id_flgen_plate_lims"))
    }

    /// Barcode for the required `plate_barcode` column
    ///
    /// Falls back to the LIMS barcode when no numeric barcode was sent.
    pub fn barcode(&self) -> Option<&str> {
        self.plate_barcode
            .as_deref()
            .or(self.plate_barcode_lims.as_deref())
    }

    pub fn require_last_updated(&self) -> IngestResult<DateTime<Utc>> {
        let key = self.id_flgen_plate_lims.as_deref().unwrap_or("<unknown>");
        self.last_updated
            .ok_or_else(|| IngestError::validation("plate", key, "last_updated"))
    }
}

impl WellPayload {
    pub fn label(&self) -> IngestResult<&str> {
        self.well_label
            .as_deref()
            .filter(|label| !label.trim().is_empty())
            .ok_or_else(|| IngestError::validation("well", "<unknown>", "well_label"))
    }

    pub fn require_last_updated(&self) -> IngestResult<DateTime<Utc>> {
        let key = self.well_label.as_deref().unwrap_or("<unknown>");
        self.last_updated
            .ok_or_else(|| IngestError::validation("well", key, "last_updated"))
    }

    /// External reference for `kind`, if the payload carries one
    pub fn reference(&self, kind: EntityKind) -> Option<&str> {
        match kind {
            EntityKind::Sample => self.sample_uuid.as_deref(),
            EntityKind::Study => self.study_uuid.as_deref(),
            EntityKind::Plate => None,
        }
    }
}

impl ReferencePayload {
    pub fn external_id(&self, kind: EntityKind) -> IngestResult<&str> {
        self.uuid
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IngestError::validation(kind.as_str(), "<unknown>", "uuid"))
    }

    pub fn require_last_updated(&self, kind: EntityKind) -> IngestResult<DateTime<Utc>> {
        let key = self.uuid.as_deref().unwrap_or("<unknown>");
        self.last_updated
            .ok_or_else(|| IngestError::validation(kind.as_str(), key, "last_updated"))
    }
}

/// A message as handed over by the transport layer
#[derive(Debug, Clone, PartialEq)]
pub enum IngestMessage {
    Plate { source: String, payload: PlatePayload },
    Sample { source: String, payload: ReferencePayload },
    Study { source: String, payload: ReferencePayload },
}

impl IngestMessage {
    /// Build a message from raw JSON for the given kind
    ///
    /// A payload that does not deserialize yields `IngestError::Payload`.
    pub fn from_value(kind: EntityKind, source: impl Into<String>, value: Value) -> IngestResult<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(IngestError::validation("message", "<unknown>", "id_lims"));
        }

        Ok(match kind {
            EntityKind::Plate => IngestMessage::Plate {
                source,
                payload: serde_json::from_value(value)?,
            },
            EntityKind::Sample => IngestMessage::Sample {
                source,
                payload: serde_json::from_value(value)?,
            },
            EntityKind::Study => IngestMessage::Study {
                source,
                payload: serde_json::from_value(value)?,
            },
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            IngestMessage::Plate { .. } => EntityKind::Plate,
            IngestMessage::Sample { .. } => EntityKind::Sample,
            IngestMessage::Study { .. } => EntityKind::Study,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            IngestMessage::Plate { source, .. }
            | IngestMessage::Sample { source, .. }
            | IngestMessage::Study { source, .. } => source,
        }
    }

    /// External identifier of the top-level entity, if present
    pub fn external_id(&self) -> Option<&str> {
        match self {
            IngestMessage::Plate { payload, .. } => payload.id_flgen_plate_lims.as_deref(),
            IngestMessage::Sample { payload, .. } | IngestMessage::Study { payload, .. } => {
                payload.uuid.as_deref()
            }
        }
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected string or number, found {}",
            other
        ))),
    }
}

fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("expected integer, found {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected integer, found \"{}\"", s))),
        Some(other) => Err(de::Error::custom(format!("expected integer, found {}", other))),
    }
}

fn opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => lims_common::time::parse_lims_timestamp(&raw)
            .map(Some)
            .map_err(de::Error::custom),
    }
}

fn wells_or_null<'de, D>(deserializer: D) -> Result<Vec<WellPayload>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<WellPayload>>::deserialize(deserializer)?.unwrap_or_default())
}
