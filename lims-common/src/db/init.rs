//! Database initialization
//!
//! Two-stage startup:
//! - Stage 1: a single-connection bootstrap pool creates the schema, runs
//!   migrations and seeds default settings
//! - Stage 2: the production pool is built from the connection settings that
//!   stage 1 just made available

use crate::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default SQLite busy_timeout when the setting is missing or unreadable
const DEFAULT_LOCK_RETRY_MS: u64 = 250;

/// Default pool size when the setting is missing or unreadable
const DEFAULT_POOL_SIZE: u32 = 8;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Stage 1: bootstrap
    let bootstrap = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path, Duration::from_millis(5000)))
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&bootstrap).await?;
    crate::db::migrations::run_migrations(&bootstrap).await?;
    init_default_settings(&bootstrap).await?;

    let lock_retry_ms = read_setting_u64(&bootstrap, "ingest_database_lock_retry_ms")
        .await?
        .unwrap_or(DEFAULT_LOCK_RETRY_MS);
    let pool_size = read_setting_u64(&bootstrap, "ingest_database_connection_pool_size")
        .await?
        .map(|v| v.clamp(1, 500) as u32)
        .unwrap_or(DEFAULT_POOL_SIZE);

    bootstrap.close().await;

    // Stage 2: production pool
    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect_with(connect_options(db_path, Duration::from_millis(lock_retry_ms)))
        .await?;

    info!(
        "Database pool ready: {} connections, busy_timeout={}ms",
        pool_size, lock_retry_ms
    );

    Ok(pool)
}

/// Per-connection options: WAL, foreign keys and busy timeout apply to every
/// connection the pool opens
fn connect_options(db_path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
}

async fn read_setting_u64(pool: &SqlitePool, key: &str) -> Result<Option<u64>> {
    let value: Option<String> =
        sqlx::query_scalar::<_, Option<String>>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?
            .flatten();

    match value {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!("Setting '{}' has non-numeric value '{}', using default", key, raw);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Create every table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_identities_table(pool).await?;
    create_samples_table(pool).await?;
    create_studies_table(pool).await?;
    create_plates_table(pool).await?;
    create_wells_table(pool).await?;
    create_deferred_links_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the identity mapping table
///
/// One row per (source, kind, external id). Rows are inserted once and never
/// updated.
pub async fn create_identities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lims_identities (
            guid TEXT PRIMARY KEY,
            id_lims TEXT NOT NULL,
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('plate', 'sample', 'study')),
            external_id TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (id_lims, entity_kind, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_samples_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS samples (
            guid TEXT PRIMARY KEY,
            id_lims TEXT NOT NULL,
            uuid_sample_lims TEXT NOT NULL,
            id_sample_lims TEXT NOT NULL,
            name TEXT,
            last_updated TIMESTAMP NOT NULL,
            recorded_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_samples_uuid ON samples(id_lims, uuid_sample_lims)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_studies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS studies (
            guid TEXT PRIMARY KEY,
            id_lims TEXT NOT NULL,
            uuid_study_lims TEXT NOT NULL,
            id_study_lims TEXT NOT NULL,
            name TEXT,
            last_updated TIMESTAMP NOT NULL,
            recorded_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_studies_uuid ON studies(id_lims, uuid_study_lims)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the plates table
///
/// The natural key (id_lims, id_flgen_plate_lims) is indexed but not unique:
/// legacy duplicates stay visible and surface as identity conflicts.
pub async fn create_plates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plates (
            guid TEXT PRIMARY KEY,
            id_lims TEXT NOT NULL,
            id_flgen_plate_lims TEXT NOT NULL,
            plate_barcode TEXT NOT NULL,
            plate_barcode_lims TEXT,
            plate_uuid_lims TEXT,
            plate_size INTEGER,
            cost_code TEXT,
            last_updated TIMESTAMP NOT NULL,
            recorded_at TIMESTAMP NOT NULL,
            CHECK (plate_size IS NULL OR plate_size > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plates_natural_key ON plates(id_lims, id_flgen_plate_lims)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the wells table
///
/// A well belongs to exactly one plate and its label is unique on that plate.
/// Sample/study references stay NULL until the target has been ingested.
pub async fn create_wells_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wells (
            guid TEXT PRIMARY KEY,
            plate_guid TEXT NOT NULL REFERENCES plates(guid) ON DELETE CASCADE,
            well_label TEXT NOT NULL,
            well_uuid_lims TEXT,
            cost_code TEXT NOT NULL,
            qc_state TEXT,
            sample_guid TEXT REFERENCES samples(guid),
            study_guid TEXT REFERENCES studies(guid),
            last_updated TIMESTAMP NOT NULL,
            recorded_at TIMESTAMP NOT NULL,
            UNIQUE (plate_guid, well_label)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_wells_sample ON wells(sample_guid)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_wells_study ON wells(study_guid)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the deferred link obligation table
///
/// At most one outstanding obligation per (well, kind); a newer reference for
/// the same kind replaces the older one.
pub async fn create_deferred_links_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_links (
            well_guid TEXT NOT NULL REFERENCES wells(guid) ON DELETE CASCADE,
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('sample', 'study')),
            id_lims TEXT NOT NULL,
            external_id TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (well_guid, entity_kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deferred_links_target ON deferred_links(id_lims, entity_kind, external_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures every required setting exists, and resets NULL values to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Dispatcher
    ensure_setting(pool, "ingest_max_concurrent_messages", "4").await?;
    ensure_setting(pool, "ingest_queue_capacity", "256").await?;
    ensure_setting(pool, "ingest_identity_lock_timeout_ms", "2000").await?;
    ensure_setting(pool, "ingest_requeue_backoff_ms", "50").await?;

    // Event bus
    ensure_setting(pool, "ingest_event_capacity", "1024").await?;

    // Database contention
    ensure_setting(pool, "ingest_database_connection_pool_size", "8").await?;
    ensure_setting(pool, "ingest_database_lock_retry_ms", "250").await?;
    ensure_setting(pool, "ingest_database_max_lock_wait_ms", "5000").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE: two processes may initialize the same file
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}
