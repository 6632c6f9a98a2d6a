//! Runtime settings for the ingest engine
//!
//! Read once at startup from the `settings` table (seeded with defaults by
//! `lims_common::db::init_database`). Missing keys fall back to the compiled
//! defaults below; a value that is present but invalid fails startup.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use lims_common::{Error, Result};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    /// Messages reconciled in parallel
    ///
    /// **Default:** 4
    pub max_concurrent_messages: usize,

    /// Messages admitted but not yet finished (running, waiting or requeued)
    ///
    /// **Default:** 256
    pub queue_capacity: usize,

    /// How long a message waits for its identity lock before being requeued
    ///
    /// **Default:** 2000 ms
    pub identity_lock_timeout: Duration,

    /// Pause before a requeued message competes for a worker again
    ///
    /// **Default:** 50 ms
    pub requeue_backoff: Duration,

    /// Event bus channel capacity
    ///
    /// **Default:** 1024
    pub event_capacity: usize,

    /// Total retry budget for SQLite lock contention
    ///
    /// **Default:** 5000 ms
    pub max_lock_wait_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 4,
            queue_capacity: 256,
            identity_lock_timeout: Duration::from_millis(2000),
            requeue_backoff: Duration::from_millis(50),
            event_capacity: 1024,
            max_lock_wait_ms: 5000,
        }
    }
}

impl IngestSettings {
    pub async fn from_database(pool: &SqlitePool) -> Result<Self> {
        let rows = sqlx::query("SELECT key, value FROM settings WHERE key LIKE 'ingest_%'")
            .fetch_all(pool)
            .await?;

        let mut values: HashMap<String, String> = HashMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Option<String> = row.try_get("value")?;
            if let Some(value) = value {
                values.insert(key, value);
            }
        }

        let defaults = Self::default();
        let settings = Self {
            max_concurrent_messages: positive(
                &values,
                "ingest_max_concurrent_messages",
                defaults.max_concurrent_messages,
            )?,
            queue_capacity: positive(&values, "ingest_queue_capacity", defaults.queue_capacity)?,
            identity_lock_timeout: Duration::from_millis(parse(
                &values,
                "ingest_identity_lock_timeout_ms",
                defaults.identity_lock_timeout.as_millis() as u64,
            )?),
            requeue_backoff: Duration::from_millis(parse(
                &values,
                "ingest_requeue_backoff_ms",
                defaults.requeue_backoff.as_millis() as u64,
            )?),
            event_capacity: positive(&values, "ingest_event_capacity", defaults.event_capacity)?,
            max_lock_wait_ms: parse(
                &values,
                "ingest_database_max_lock_wait_ms",
                defaults.max_lock_wait_ms,
            )?,
        };

        if settings.queue_capacity < settings.max_concurrent_messages {
            tracing::warn!(
                "ingest_queue_capacity ({}) is below ingest_max_concurrent_messages ({}); workers will sit idle",
                settings.queue_capacity,
                settings.max_concurrent_messages
            );
        }

        tracing::info!(?settings, "Ingest settings loaded");
        Ok(settings)
    }
}

fn parse<T>(values: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match values.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn positive(values: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    let value: usize = parse(values, key, default)?;
    if value == 0 {
        return Err(Error::Config(format!("{} must be at least 1", key)));
    }
    Ok(value)
}
