use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use image_loader::cache::{CacheLookup, CacheStore, Clock, StoreOutcome};
use image_loader::config::{CacheConfig, DatabaseConfig};
use image_loader::errors::StorageError;
use image_loader::models::CacheKey;
use tempfile::TempDir;

/// Clock that only moves when told to.
struct ManualClock(AtomicI64);

impl ManualClock {
    fn new(start: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start)))
    }

    fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn database_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("cache.db").display()),
        max_connections: Some(4),
    }
}

async fn open_store(
    dir: &TempDir,
    budget_bytes: u64,
    eviction_chunk_bytes: u64,
    clock: Arc<ManualClock>,
) -> CacheStore {
    let store = CacheStore::with_clock(
        CacheConfig {
            budget_bytes,
            eviction_chunk_bytes,
        },
        clock,
    );
    assert!(store.initialize(&database_config(dir)).await);
    store
}

fn key(name: &str) -> CacheKey {
    CacheKey::from(name)
}

async fn assert_consistent(store: &CacheStore) {
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.recorded_size, stats.live_size);
    assert!(stats.recorded_size <= stats.budget);
}

#[tokio::test]
async fn test_eviction_keeps_budget() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1);
    let store = open_store(&dir, 1000, 300, clock.clone()).await;

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        clock.set(i as i64 + 1);
        assert!(matches!(
            store.store(&key(name), &[i as u8; 300], 1).await,
            StoreOutcome::Stored { .. }
        ));
    }
    assert_eq!(store.stats().await.unwrap().recorded_size, 900);

    clock.set(10);
    let outcome = store.store(&key("d"), &[9; 300], 1).await;
    match outcome {
        StoreOutcome::Stored { evicted } => {
            assert_eq!(evicted.entries, 1);
            assert_eq!(evicted.bytes, 300);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(store.lookup(&key("a"), 1).await, CacheLookup::Miss);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.recorded_size, 900);
    assert_consistent(&store).await;
}

#[tokio::test]
async fn test_eviction_follows_last_access() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1);
    let store = open_store(&dir, 1000, 300, clock.clone()).await;

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        clock.set(i as i64 + 1);
        store.store(&key(name), &[0; 300], 1).await;
    }

    // Touch "a" so "b" becomes the oldest.
    clock.set(5);
    assert!(store.lookup(&key("a"), 1).await.is_hit());

    clock.set(6);
    store.store(&key("d"), &[0; 300], 1).await;

    assert!(store.entry_metadata(&key("a")).await.unwrap().is_some());
    assert!(store.entry_metadata(&key("b")).await.unwrap().is_none());
    assert!(store.entry_metadata(&key("c")).await.unwrap().is_some());
    assert_consistent(&store).await;
}

#[tokio::test]
async fn test_eviction_frees_at_least_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1);
    let store = open_store(&dir, 1000, 500, clock.clone()).await;

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        clock.set(i as i64 + 1);
        store.store(&key(name), &[0; 300], 1).await;
    }

    clock.set(10);
    let outcome = store.store(&key("d"), &[0; 300], 1).await;
    assert!(matches!(
        outcome,
        StoreOutcome::Stored { evicted } if evicted.entries == 2 && evicted.bytes == 600
    ));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.recorded_size, 600);
    assert_consistent(&store).await;
}

#[tokio::test]
async fn test_oversized_entry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;

    store.store(&key("small"), &[0; 100], 1).await;
    assert_eq!(
        store.store(&key("huge"), &[0; 1001], 1).await,
        StoreOutcome::Rejected
    );

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.recorded_size, 100);
    assert_eq!(store.lookup(&key("huge"), 1).await, CacheLookup::Miss);
}

#[tokio::test]
async fn test_stale_version_is_a_miss_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;

    store.store(&key("photo"), b"old pixels", 100).await;
    assert_eq!(store.lookup(&key("photo"), 200).await, CacheLookup::Miss);

    assert!(store.entry_metadata(&key("photo")).await.unwrap().is_none());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.recorded_size, 0);
}

#[tokio::test]
async fn test_lookup_is_repeatable_and_refreshes_access_time() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let store = open_store(&dir, 1000, 300, clock.clone()).await;

    store.store(&key("photo"), b"pixels", 7).await;

    clock.set(2_000);
    let first = store.lookup(&key("photo"), 7).await;
    clock.set(3_000);
    let second = store.lookup(&key("photo"), 7).await;

    assert_eq!(first, CacheLookup::Hit(b"pixels".to_vec()));
    assert_eq!(first, second);

    let metadata = store.entry_metadata(&key("photo")).await.unwrap().unwrap();
    assert_eq!(metadata.last_access_time, 3_000);
    assert_eq!(metadata.source_version, 7);
    assert_eq!(metadata.size_bytes, 6);
}

#[tokio::test]
async fn test_store_same_version_twice() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;

    assert!(matches!(
        store.store(&key("photo"), b"pixels", 7).await,
        StoreOutcome::Stored { .. }
    ));
    assert_eq!(
        store.store(&key("photo"), b"pixels", 7).await,
        StoreOutcome::AlreadyPresent
    );

    // A newer version replaces the old entry.
    assert!(matches!(
        store.store(&key("photo"), b"new pixels", 8).await,
        StoreOutcome::Stored { .. }
    ));
    assert_eq!(
        store.lookup(&key("photo"), 8).await,
        CacheLookup::Hit(b"new pixels".to_vec())
    );
    assert_eq!(store.stats().await.unwrap().recorded_size, 10);
}

#[tokio::test]
async fn test_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;

    store.store(&key("photo"), b"pixels", 7).await;
    assert!(store.remove(&key("photo")).await);
    assert!(!store.remove(&key("photo")).await);
    assert_eq!(store.stats().await.unwrap().recorded_size, 0);
}

#[tokio::test]
async fn test_unopened_store_fails_open() {
    let store = CacheStore::new(CacheConfig::default());
    assert!(!store.is_available());

    assert_eq!(store.lookup(&key("photo"), 1).await, CacheLookup::Miss);
    assert_eq!(
        store.store(&key("photo"), b"pixels", 1).await,
        StoreOutcome::Unavailable
    );
    assert!(!store.remove(&key("photo")).await);
    assert!(matches!(store.stats().await, Err(StorageError::Unavailable)));
}

#[tokio::test]
async fn test_failed_initialization_leaves_store_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(CacheConfig::default());
    let config = DatabaseConfig {
        url: format!(
            "sqlite://{}",
            dir.path().join("missing").join("nested").join("cache.db").display()
        ),
        max_connections: Some(1),
    };

    assert!(!store.initialize(&config).await);
    assert!(!store.is_available());
    assert_eq!(
        store.store(&key("photo"), b"pixels", 1).await,
        StoreOutcome::Unavailable
    );
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;
        store.store(&key("photo"), b"pixels", 7).await;
    }

    let store = open_store(&dir, 1000, 300, ManualClock::new(2)).await;
    assert_eq!(
        store.lookup(&key("photo"), 7).await,
        CacheLookup::Hit(b"pixels".to_vec())
    );
}

#[tokio::test]
async fn test_concurrent_stores_keep_aggregate_exact() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 2_000, 400, ManualClock::new(1)).await;

    let writes = (0..20u8).map(|i| {
        let store = store.clone();
        async move {
            store
                .store(&CacheKey::from(format!("entry-{}", i).as_str()), &[i; 150], 1)
                .await
        }
    });
    let outcomes = futures::future::join_all(writes).await;

    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, StoreOutcome::Stored { .. })));
    assert_consistent(&store).await;
}

/// Side connection used to tamper with rows behind the store's back.
async fn raw_pool(dir: &TempDir) -> sqlx::SqlitePool {
    sqlx::SqlitePool::connect(&database_config(dir).url)
        .await
        .unwrap()
}

async fn row_counts(pool: &sqlx::SqlitePool, key: &str) -> (i64, i64) {
    let metadata: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap();
    let payload: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payload WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap();
    (metadata, payload)
}

#[tokio::test]
async fn test_metadata_without_payload_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;
    store.store(&key("kept"), &[1; 120], 1).await;
    store.store(&key("torn"), &[2; 200], 1).await;

    let pool = raw_pool(&dir).await;
    sqlx::query("DELETE FROM payload WHERE key = ?")
        .bind("torn")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.lookup(&key("torn"), 1).await, CacheLookup::Miss);
    assert!(store.entry_metadata(&key("torn")).await.unwrap().is_none());
    assert_eq!(row_counts(&pool, "torn").await, (0, 0));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.recorded_size, 120);
    assert_consistent(&store).await;
    assert!(matches!(store.lookup(&key("kept"), 1).await, CacheLookup::Hit(_)));
}

#[tokio::test]
async fn test_payload_without_metadata_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1000, 300, ManualClock::new(1)).await;
    store.store(&key("kept"), &[1; 120], 1).await;
    store.store(&key("torn"), &[2; 200], 1).await;

    let pool = raw_pool(&dir).await;
    sqlx::query("DELETE FROM metadata WHERE key = ?")
        .bind("torn")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.lookup(&key("torn"), 1).await, CacheLookup::Miss);
    assert_eq!(row_counts(&pool, "torn").await, (0, 0));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.recorded_size, 120);
    assert_consistent(&store).await;
}
