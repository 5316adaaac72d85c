//! Persistent, size-budgeted image cache
//!
//! Entries live in two tables, `metadata` and `payload`, that always hold a
//! row pair per key. The `settings` table carries the aggregate size of all
//! live entries under the key `size`. Every operation that touches these
//! tables runs as one transaction under the database's cache write lock, so
//! the aggregate always equals the sum of the recorded entry sizes.
//!
//! Storage failures never propagate: lookups degrade to a miss and writes are
//! skipped.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use super::eviction::{plan_eviction, summarize, EvictionCandidate, EvictionSummary};
use crate::config::{CacheConfig, DatabaseConfig};
use crate::database::Database;
use crate::errors::{StorageError, StorageResult};
use crate::models::CacheKey;

const SIZE_SETTING: &str = "size";

/// Source of `lastAccessTime` values, in milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Result of [`CacheStore::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<u8>),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Result of [`CacheStore::store`]. None of these are errors for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Inserted, after evicting the given entries (possibly none).
    Stored { evicted: EvictionSummary },
    /// An entry with the same key and version already exists.
    AlreadyPresent,
    /// Larger than the whole budget; nothing was written.
    Rejected,
    /// The store is not open or the transaction failed.
    Unavailable,
}

/// Metadata row of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMetadata {
    pub key: String,
    pub source_version: i64,
    pub size_bytes: u64,
    pub last_access_time: i64,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: u64,
    /// Aggregate counter as persisted in `settings`.
    pub recorded_size: u64,
    /// Sum of `size_bytes` over the metadata table.
    pub live_size: u64,
    pub budget: u64,
}

#[derive(Clone)]
pub struct CacheStore {
    database: Arc<OnceLock<Database>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Create an unopened store. Until [`initialize`](Self::initialize)
    /// succeeds every lookup misses and every write is skipped.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            database: Arc::new(OnceLock::new()),
            config,
            clock,
        }
    }

    /// Open the backing database and bring its schema up to date.
    ///
    /// Returns whether the store is usable. Failure is logged and leaves the
    /// store in always-miss mode.
    pub async fn initialize(&self, database_config: &DatabaseConfig) -> bool {
        let opened = async {
            let database = Database::new(database_config).await?;
            database.migrate().await?;
            Ok::<_, crate::errors::AppError>(database)
        }
        .await;

        match opened {
            Ok(database) => self.attach(database),
            Err(e) => {
                warn!(
                    url = %database_config.url,
                    error = %e,
                    "Cache database unavailable, continuing without persistence"
                );
                false
            }
        }
    }

    /// Use an already migrated database. Returns false if one is attached.
    pub fn attach(&self, database: Database) -> bool {
        let attached = self.database.set(database).is_ok();
        if attached {
            info!(
                budget_bytes = self.config.budget_bytes,
                eviction_chunk_bytes = self.config.eviction_chunk_bytes,
                "Image cache ready"
            );
        }
        attached
    }

    pub fn is_available(&self) -> bool {
        self.database.get().is_some()
    }

    pub fn budget(&self) -> u64 {
        self.config.budget_bytes
    }

    fn database(&self) -> StorageResult<&Database> {
        self.database.get().ok_or(StorageError::Unavailable)
    }

    /// Fetch the payload for `key` if it was stored for `version`.
    ///
    /// A hit refreshes the entry's access time. An entry stored for another
    /// version is deleted and reported as a miss.
    pub async fn lookup(&self, key: &CacheKey, version: i64) -> CacheLookup {
        match self.try_lookup(key, version).await {
            Ok(Some(data)) => CacheLookup::Hit(data),
            Ok(None) => CacheLookup::Miss,
            Err(StorageError::Unavailable) => CacheLookup::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    async fn try_lookup(&self, key: &CacheKey, version: i64) -> StorageResult<Option<Vec<u8>>> {
        let database = self.database()?;
        let _guard = database.acquire_cache_write_lock().await;

        let mut transaction = database.pool().begin().await?;
        let data = lookup_entry(
            &mut transaction,
            key.as_str(),
            version,
            self.clock.now_millis(),
        )
        .await?;
        transaction.commit().await?;

        Ok(data)
    }

    /// Persist `data` for `key` at `version`, evicting older entries as
    /// needed to stay within the budget.
    pub async fn store(&self, key: &CacheKey, data: &[u8], version: i64) -> StoreOutcome {
        match self.try_store(key, data, version).await {
            Ok(outcome) => outcome,
            Err(StorageError::Unavailable) => StoreOutcome::Unavailable,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache store failed, result not persisted");
                StoreOutcome::Unavailable
            }
        }
    }

    async fn try_store(
        &self,
        key: &CacheKey,
        data: &[u8],
        version: i64,
    ) -> StorageResult<StoreOutcome> {
        let database = self.database()?;
        let size = data.len() as u64;
        let _guard = database.acquire_cache_write_lock().await;

        let mut transaction = database.pool().begin().await?;
        let now = self.clock.now_millis();

        if lookup_entry(&mut transaction, key.as_str(), version, now)
            .await?
            .is_some()
        {
            transaction.commit().await?;
            return Ok(StoreOutcome::AlreadyPresent);
        }

        if size > self.config.budget_bytes {
            // Keep any stale-entry removal the lookup performed.
            transaction.commit().await?;
            debug!(
                key = %key,
                size_bytes = size,
                budget_bytes = self.config.budget_bytes,
                "Entry larger than cache budget, not stored"
            );
            return Ok(StoreOutcome::Rejected);
        }

        let cache_size = read_cache_size(&mut transaction).await?;
        let mut evicted = EvictionSummary::default();
        if cache_size + size > self.config.budget_bytes {
            let bytes_to_free = size.max(self.config.eviction_chunk_bytes);
            evicted = evict(&mut transaction, bytes_to_free).await?;
            info!(
                evicted_entries = evicted.entries,
                evicted_bytes = evicted.bytes,
                requested_bytes = bytes_to_free,
                "Evicted least recently used cache entries"
            );
        }

        sqlx::query(
            "INSERT INTO metadata (key, source_version, size_bytes, last_access_time)
             VALUES (?, ?, ?, ?)",
        )
        .bind(key.as_str())
        .bind(version)
        .bind(size as i64)
        .bind(now)
        .execute(&mut *transaction)
        .await?;

        sqlx::query("INSERT INTO payload (key, data) VALUES (?, ?)")
            .bind(key.as_str())
            .bind(data)
            .execute(&mut *transaction)
            .await?;

        let new_size = cache_size.saturating_sub(evicted.bytes) + size;
        write_cache_size(&mut transaction, new_size).await?;
        transaction.commit().await?;

        debug!(key = %key, size_bytes = size, cache_size = new_size, "Stored cache entry");
        Ok(StoreOutcome::Stored { evicted })
    }

    /// Delete the entry for `key`. Returns whether an entry existed.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        match self.try_remove(key).await {
            Ok(removed) => removed,
            Err(StorageError::Unavailable) => false,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache removal failed");
                false
            }
        }
    }

    async fn try_remove(&self, key: &CacheKey) -> StorageResult<bool> {
        let database = self.database()?;
        let _guard = database.acquire_cache_write_lock().await;

        let mut transaction = database.pool().begin().await?;
        let metadata = fetch_metadata(&mut transaction, key.as_str()).await?;
        let removed = match metadata {
            Some(metadata) => {
                delete_entry(&mut transaction, key.as_str(), metadata.size_bytes).await?;
                true
            }
            None => false,
        };
        transaction.commit().await?;

        Ok(removed)
    }

    /// Metadata for `key` without touching its access time.
    pub async fn entry_metadata(&self, key: &CacheKey) -> StorageResult<Option<CacheEntryMetadata>> {
        let database = self.database()?;
        let mut connection = database.pool().acquire().await?;
        fetch_metadata(&mut connection, key.as_str()).await
    }

    pub async fn stats(&self) -> StorageResult<CacheStats> {
        let database = self.database()?;
        let mut connection = database.pool().acquire().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS live_size FROM metadata",
        )
        .fetch_one(&mut *connection)
        .await?;
        let recorded_size = read_cache_size(&mut connection).await?;

        Ok(CacheStats {
            entries: row.get::<i64, _>("entries") as u64,
            recorded_size,
            live_size: row.get::<i64, _>("live_size") as u64,
            budget: self.config.budget_bytes,
        })
    }
}

async fn fetch_metadata(
    conn: &mut SqliteConnection,
    key: &str,
) -> StorageResult<Option<CacheEntryMetadata>> {
    let row = sqlx::query(
        "SELECT key, source_version, size_bytes, last_access_time FROM metadata WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| CacheEntryMetadata {
        key: row.get("key"),
        source_version: row.get("source_version"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        last_access_time: row.get("last_access_time"),
    }))
}

/// Shared by lookup and store: returns the payload on a fresh hit and
/// refreshes its access time, deletes stale or half-written entries.
async fn lookup_entry(
    conn: &mut SqliteConnection,
    key: &str,
    version: i64,
    now: i64,
) -> StorageResult<Option<Vec<u8>>> {
    let metadata = fetch_metadata(conn, key).await?;
    let data: Option<Vec<u8>> = sqlx::query_scalar("SELECT data FROM payload WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    match (metadata, data) {
        (None, None) => Ok(None),
        (Some(metadata), Some(data)) if metadata.source_version == version => {
            sqlx::query("UPDATE metadata SET last_access_time = ? WHERE key = ?")
                .bind(now)
                .bind(key)
                .execute(&mut *conn)
                .await?;
            Ok(Some(data))
        }
        (Some(metadata), Some(_)) => {
            debug!(
                key,
                cached_version = metadata.source_version,
                requested_version = version,
                "Cache entry out of date, removing"
            );
            delete_entry(conn, key, metadata.size_bytes).await?;
            Ok(None)
        }
        (metadata, data) => {
            warn!(error = %StorageError::inconsistent(key), "Removing half-written cache entry");
            // An orphaned payload was counted at its own length.
            let size = metadata
                .map(|m| m.size_bytes)
                .or_else(|| data.map(|d| d.len() as u64))
                .unwrap_or(0);
            delete_entry(conn, key, size).await?;
            Ok(None)
        }
    }
}

async fn read_cache_size(conn: &mut SqliteConnection) -> StorageResult<u64> {
    let size: Option<i64> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(SIZE_SETTING)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(size.unwrap_or(0).max(0) as u64)
}

async fn write_cache_size(conn: &mut SqliteConnection, size: u64) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SIZE_SETTING)
    .bind(size as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_rows(conn: &mut SqliteConnection, key: &str) -> StorageResult<()> {
    sqlx::query("DELETE FROM metadata WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM payload WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_entry(conn: &mut SqliteConnection, key: &str, size: u64) -> StorageResult<()> {
    delete_rows(conn, key).await?;
    let cache_size = read_cache_size(conn).await?;
    write_cache_size(conn, cache_size.saturating_sub(size)).await
}

/// Remove least recently used entries until `bytes_to_free` bytes are
/// reclaimed. The caller owns the aggregate size update.
async fn evict(conn: &mut SqliteConnection, bytes_to_free: u64) -> StorageResult<EvictionSummary> {
    let rows = sqlx::query("SELECT key, size_bytes, last_access_time FROM metadata")
        .fetch_all(&mut *conn)
        .await?;

    let candidates = rows
        .into_iter()
        .map(|row| EvictionCandidate {
            key: row.get("key"),
            size_bytes: row.get::<i64, _>("size_bytes") as u64,
            last_access_time: row.get("last_access_time"),
        })
        .collect();

    let victims = plan_eviction(candidates, bytes_to_free);
    for victim in &victims {
        delete_rows(conn, &victim.key).await?;
    }

    Ok(summarize(&victims))
}
