use crate::config::DatabaseConfig;
use crate::errors::AppResult;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Bump to drop and recreate every cache table on next open.
pub const SCHEMA_VERSION: i64 = 11;

const CREATE_TABLES: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY NOT NULL,
        source_version INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        last_access_time INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payload (
        key TEXT PRIMARY KEY NOT NULL,
        data BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL
    )
    "#,
];

const DROP_TABLES: [&str; 3] = [
    "DROP TABLE IF EXISTS metadata",
    "DROP TABLE IF EXISTS payload",
    "DROP TABLE IF EXISTS settings",
];

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    cache_write_lock: Arc<Mutex<()>>,
}

impl Database {
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        // Create database if it doesn't exist (for SQLite)
        if !Sqlite::database_exists(&config.url).await? {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            cache_write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create the cache tables, recreating all of them when the stored schema
    /// version differs from [`SCHEMA_VERSION`].
    pub async fn migrate(&self) -> AppResult<()> {
        let mut transaction = self.pool.begin().await?;

        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *transaction)
            .await?;

        if current != SCHEMA_VERSION {
            info!(
                from = current,
                to = SCHEMA_VERSION,
                "Cache database creating or upgrading"
            );
            for statement in DROP_TABLES {
                sqlx::query(statement).execute(&mut *transaction).await?;
            }
        } else {
            debug!(version = SCHEMA_VERSION, "Cache database schema is current");
        }

        for statement in CREATE_TABLES {
            sqlx::query(statement).execute(&mut *transaction).await?;
        }

        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(())
    }

    /// Serializes cache mutations so the aggregate size counter is never
    /// read and written by two transactions at once.
    pub async fn acquire_cache_write_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.cache_write_lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(dir: &tempfile::TempDir) -> DatabaseConfig {
        DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("cache.db").display()),
            max_connections: Some(2),
        }
    }

    #[tokio::test]
    async fn test_migrate_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(&file_config(&dir)).await.unwrap();
        database.migrate().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&database.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["metadata", "payload", "settings"]);

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&database.pool())
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_migrate_keeps_rows_when_current() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(&file_config(&dir)).await.unwrap();
        database.migrate().await.unwrap();

        sqlx::query("INSERT INTO settings (key, value) VALUES ('size', 42)")
            .execute(&database.pool())
            .await
            .unwrap();

        database.migrate().await.unwrap();
        let size: i64 = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'size'")
            .fetch_one(&database.pool())
            .await
            .unwrap();
        assert_eq!(size, 42);
    }

    #[tokio::test]
    async fn test_migrate_recreates_on_version_change() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(&file_config(&dir)).await.unwrap();
        database.migrate().await.unwrap();

        sqlx::query("INSERT INTO settings (key, value) VALUES ('size', 42)")
            .execute(&database.pool())
            .await
            .unwrap();
        sqlx::query("PRAGMA user_version = 3")
            .execute(&database.pool())
            .await
            .unwrap();

        database.migrate().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&database.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
