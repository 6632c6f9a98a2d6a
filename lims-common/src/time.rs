//! Timestamp utilities

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{Error, Result};

/// Naive layout used by LIMS payloads, e.g. "2012-03-11 10:22:42"
const LIMS_NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a LIMS `last_updated` value
///
/// Accepts RFC 3339 (any offset, normalized to UTC) or the naive
/// `YYYY-MM-DD HH:MM:SS[.fff]` layout, which is taken to be UTC.
pub fn parse_lims_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(trimmed, LIMS_NAIVE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::InvalidInput(format!("Unparsable timestamp '{}': {}", raw, e)))
}
