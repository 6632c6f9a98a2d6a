//! Warehouse table access
//!
//! Write functions take `&mut SqliteConnection` so the coordinator can run them
//! inside one transaction. Read functions for external callers take the pool.
//! GUIDs are stored as hyphenated TEXT.

pub mod obligations;
pub mod plates;
pub mod references;
pub mod wells;

use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

pub use obligations::{pending_obligations, Obligation};
pub use plates::{load_plate, PlateRecord};
pub use references::{load_reference, load_sample, load_study, ReferenceRecord};
pub use wells::WellRecord;

pub(crate) fn parse_guid(raw: &str) -> IngestResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        IngestError::Common(lims_common::Error::Internal(format!(
            "Corrupt guid '{}' in database: {}",
            raw, e
        )))
    })
}

pub(crate) fn parse_opt_guid(raw: Option<String>) -> IngestResult<Option<Uuid>> {
    raw.as_deref().map(parse_guid).transpose()
}
