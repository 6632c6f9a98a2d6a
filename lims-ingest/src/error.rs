//! Error types for lims-ingest
//!
//! Staleness and unresolved references are normal outcomes, not errors; they
//! are reported through [`crate::outcome`]. Everything here aborts the message.

use lims_common::events::EntityKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Required field missing on a brand-new entity (or a field no update can
    /// do without, such as the external identifier or `last_updated`)
    #[error("Validation error: {entity} '{key}' is missing required field '{field}'")]
    Validation {
        entity: &'static str,
        key: String,
        field: &'static str,
    },

    /// One external identifier resolves to more than one internal identity
    #[error("Identity conflict: {kind} '{external_id}' from '{id_lims}' maps to {} internal identities: {handles:?}", .handles.len())]
    IdentityConflict {
        kind: EntityKind,
        id_lims: String,
        external_id: String,
        handles: Vec<Uuid>,
    },

    /// Per-identity lock not acquired in time; the message should be requeued
    #[error("Timed out after {waited_ms} ms waiting for identity lock {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Payload is not valid JSON for the message kind
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// lims-common error (database, I/O, configuration)
    #[error(transparent)]
    Common(#[from] lims_common::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(lims_common::Error::Database(err))
    }
}

impl IngestError {
    pub fn validation(entity: &'static str, key: impl Into<String>, field: &'static str) -> Self {
        IngestError::Validation {
            entity,
            key: key.into(),
            field,
        }
    }

    /// True when the message should go back on the queue instead of being rejected
    pub fn is_requeueable(&self) -> bool {
        matches!(self, IngestError::LockTimeout { .. })
    }

    /// Reason code reported to the caller when this error rejects a message
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            IngestError::Validation { .. } => RejectReason::ValidationError,
            IngestError::IdentityConflict { .. } => RejectReason::IdentityConflict,
            IngestError::Payload(_) => RejectReason::MalformedPayload,
            IngestError::Common(lims_common::Error::InvalidInput(_)) => {
                RejectReason::MalformedPayload
            }
            IngestError::LockTimeout { .. } | IngestError::Common(_) => RejectReason::StoreError,
        }
    }
}

/// Stable per-message reject reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    ValidationError,
    IdentityConflict,
    MalformedPayload,
    StoreError,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::ValidationError => "VALIDATION_ERROR",
            RejectReason::IdentityConflict => "IDENTITY_CONFLICT",
            RejectReason::MalformedPayload => "MALFORMED_PAYLOAD",
            RejectReason::StoreError => "STORE_ERROR",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
