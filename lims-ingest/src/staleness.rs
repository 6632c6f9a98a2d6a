//! Staleness gate
//!
//! An incoming record may overwrite stored state only when its `last_updated`
//! is strictly newer. Equal timestamps are treated as a resend.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Accept,
    RejectStale,
}

impl Gate {
    pub fn accepted(self) -> bool {
        self == Gate::Accept
    }
}

/// Compare the stored timestamp (None for a new entity) with the incoming one
pub fn check(stored: Option<DateTime<Utc>>, incoming: DateTime<Utc>) -> Gate {
    match stored {
        None => Gate::Accept,
        Some(stored) if incoming > stored => Gate::Accept,
        Some(_) => Gate::RejectStale,
    }
}
