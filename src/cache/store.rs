//! Volatile tier: an in-process LRU of serialized values.
//!
//! Best-effort by contract. Entries are evicted silently when capacity is
//! reached; callers treat absence as a miss.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use crate::application::repos::{RepoError, TierStore};
use crate::domain::entities::{CacheEntry, CacheKey, CacheRecord};
use crate::domain::types::{RecordSource, Tier};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_VOLATILE_EVICT_TOTAL: &str = "tierstash_volatile_evict_total";

/// What the volatile tier keeps per key: `(modified_at, value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolatileEntry {
    pub modified_at: OffsetDateTime,
    pub value: Bytes,
}

pub struct VolatileStore {
    entries: RwLock<LruCache<CacheKey, VolatileEntry>>,
}

impl VolatileStore {
    /// Create a store holding at most `capacity` entries (clamped to 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<VolatileEntry> {
        rw_write(&self.entries, SOURCE, "lookup").get(key).cloned()
    }

    /// Store an entry, returning the key evicted to make room, if any.
    pub fn set(&self, key: CacheKey, entry: VolatileEntry) -> Option<CacheKey> {
        let evicted = rw_write(&self.entries, SOURCE, "set")
            .push(key.clone(), entry)
            .and_then(|(evicted_key, _)| (evicted_key != key).then_some(evicted_key));
        if evicted.is_some() {
            counter!(METRIC_VOLATILE_EVICT_TOTAL).increment(1);
        }
        evicted
    }

    pub fn invalidate(&self, key: &CacheKey) {
        rw_write(&self.entries, SOURCE, "invalidate").pop(key);
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TierStore for VolatileStore {
    fn tier(&self) -> Tier {
        Tier::Volatile
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, RepoError> {
        Ok(self.lookup(key).map(|entry| CacheRecord {
            key: key.clone(),
            value: entry.value,
            modified_at: entry.modified_at,
            expires_hint: None,
            effort: 0.0,
            source: RecordSource::Volatile,
        }))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), RepoError> {
        self.set(
            entry.key.clone(),
            VolatileEntry {
                modified_at: entry.modified_at,
                value: entry.value.clone(),
            },
        );
        Ok(())
    }
}
