//! Persistent image cache with a global byte budget and LRU eviction

pub mod eviction;
pub mod store;

pub use eviction::{EvictionCandidate, EvictionSummary};
pub use store::{
    CacheEntryMetadata, CacheLookup, CacheStats, CacheStore, Clock, StoreOutcome, SystemClock,
};
