// ABOUTME: Database connection management and schema initialization
// ABOUTME: Opens the SQLite pool, applies pragmas and runs embedded migrations

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Open a pool for `database_url`, creating the file if needed, and migrate it
pub async fn init_pool(database_url: &str) -> StorageResult<SqlitePool> {
    if database_url.contains(":memory:") {
        return init_memory_pool().await;
    }

    debug!("Connecting to database: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(StorageError::Sqlx)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(StorageError::Sqlx)?;

    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await
        .map_err(StorageError::Sqlx)?;

    info!("Database connection established");

    run_migrations(&pool).await?;
    Ok(pool)
}

/// In-memory database on a single long-lived connection.
///
/// Every SQLite `:memory:` connection is its own database, so the pool must
/// never open a second one or recycle the first.
pub async fn init_memory_pool() -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(StorageError::Sqlx)?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(StorageError::Sqlx)?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(StorageError::Migration)?;

    debug!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn test_memory_pool_has_schema_and_seeds() {
        let pool = init_memory_pool().await.unwrap();

        let rules: i64 = sqlx::query("SELECT COUNT(*) AS n FROM consequence_rules")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert!(rules > 0);

        let fk: i64 = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_file_pool_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("rekindle.db").display());

        let pool = init_pool(&url).await.unwrap();
        let challenges: i64 = sqlx::query("SELECT COUNT(*) AS n FROM challenges")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("n");
        assert!(challenges > 0);
        pool.close().await;
    }
}
