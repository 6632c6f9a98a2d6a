//! Database schema migrations
//!
//! Versioned migrations tracked in the `schema_version` table. Every migration
//! is idempotent and safe to run against a database that already has the change.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - they must remain stable for databases upgrading from older versions
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Use ALTER TABLE** - prefer ALTER TABLE over DROP/CREATE to preserve warehouse data

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        warn!("This may indicate a downgrade. Proceeding with caution.");
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

/// Migration v1: add `recorded_at` to wells
///
/// Early warehouse files tracked only the source `last_updated` on wells.
/// Backfills from `last_updated`.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: Add recorded_at column to wells");

    if !table_exists(pool, "wells").await? {
        info!("  wells table doesn't exist yet - skipping migration");
        return Ok(());
    }

    if has_column(pool, "wells", "recorded_at").await? {
        info!("  recorded_at column already exists - skipping");
        return Ok(());
    }

    add_column(pool, "wells", "recorded_at", "TIMESTAMP").await?;
    sqlx::query("UPDATE wells SET recorded_at = last_updated WHERE recorded_at IS NULL")
        .execute(pool)
        .await?;

    info!("  ✓ Added recorded_at column to wells table");
    Ok(())
}

/// Migration v2: add `name` to samples and studies
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: Add name column to samples and studies");

    for table in ["samples", "studies"] {
        if !table_exists(pool, table).await? {
            info!("  {} table doesn't exist yet - skipping", table);
            continue;
        }
        if has_column(pool, table, "name").await? {
            info!("  {}.name already exists - skipping", table);
            continue;
        }
        add_column(pool, table, "name", "TEXT").await?;
        info!("  ✓ Added name column to {} table", table);
    }

    Ok(())
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

async fn add_column(pool: &SqlitePool, table: &str, column: &str, sql_type: &str) -> Result<()> {
    let statement = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, sql_type);
    match sqlx::query(&statement).execute(pool).await {
        Ok(_) => Ok(()),
        // Another process initializing the same file got there first
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
            info!("  {}.{} added concurrently - skipping", table, column);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn single_connection_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database")
    }

    #[tokio::test]
    async fn test_migrations_upgrade_legacy_tables() {
        let pool = single_connection_pool().await;

        sqlx::query("CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE wells (guid TEXT PRIMARY KEY, last_updated TIMESTAMP NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE samples (guid TEXT PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO wells (guid, last_updated) VALUES ('w1', '2012-03-11 10:22:42')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        assert!(has_column(&pool, "wells", "recorded_at").await.unwrap());
        assert!(has_column(&pool, "samples", "name").await.unwrap());
        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

        let recorded_at: String = sqlx::query_scalar("SELECT recorded_at FROM wells WHERE guid = 'w1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(recorded_at, "2012-03-11 10:22:42");
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = single_connection_pool().await;
        sqlx::query("CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }
}
