//! Tests for database initialization
//!
//! Covers:
//! - Automatic database creation with the warehouse schema
//! - Reopening an existing database
//! - Default settings seeding and NULL repair

use lims_common::db::init::init_database;
use lims_common::db::migrations::{get_schema_version, CURRENT_SCHEMA_VERSION};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("lims.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("lims.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_warehouse_tables_created() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lims.db")).await.unwrap();

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    for expected in [
        "deferred_links",
        "lims_identities",
        "plates",
        "samples",
        "schema_version",
        "settings",
        "studies",
        "wells",
    ] {
        assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
    }

    assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lims.db")).await.unwrap();

    let lock_timeout: Option<String> = sqlx::query_scalar(
        "SELECT value FROM settings WHERE key = 'ingest_identity_lock_timeout_ms'",
    )
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert_eq!(lock_timeout.as_deref(), Some("2000"));

    let concurrency: Option<String> = sqlx::query_scalar(
        "SELECT value FROM settings WHERE key = 'ingest_max_concurrent_messages'",
    )
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert_eq!(concurrency.as_deref(), Some("4"));
}

#[tokio::test]
async fn test_null_setting_reset_to_default() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("lims.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("UPDATE settings SET value = NULL WHERE key = 'ingest_requeue_backoff_ms'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    let backoff: Option<String> = sqlx::query_scalar(
        "SELECT value FROM settings WHERE key = 'ingest_requeue_backoff_ms'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(backoff.as_deref(), Some("50"));
}

#[tokio::test]
async fn test_custom_setting_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("lims.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("UPDATE settings SET value = '12' WHERE key = 'ingest_max_concurrent_messages'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    let value: String = sqlx::query_scalar(
        "SELECT value FROM settings WHERE key = 'ingest_max_concurrent_messages'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(value, "12");
}

#[tokio::test]
async fn test_foreign_keys_enforced_on_pool_connections() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("lims.db")).await.unwrap();

    let result = sqlx::query(
        r#"
        INSERT INTO wells (guid, plate_guid, well_label, cost_code, last_updated, recorded_at)
        VALUES ('w1', 'no-such-plate', 'A1', 'cc', '2012-03-11 10:22:42', '2012-03-11 10:22:42')
        "#,
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "orphan well insert should violate the plate foreign key");
}
