//! In-process durable tier.
//!
//! Implements the same contract as the Postgres tier, row lock included, for
//! embedding without a database and for tests. Each key is guarded by its
//! shard lock, so unrelated keys do not serialize on one another.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use crate::application::repos::{LockAttempt, RepoError, RowLock, TierStore};
use crate::domain::entities::{CacheEntry, CacheKey, CacheRecord};
use crate::domain::types::{RecordSource, Tier};

#[derive(Debug, Clone)]
struct StoredRow {
    entry: CacheEntry,
    locked_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct MemoryDurableStore {
    rows: DashMap<CacheKey, StoredRow>,
    available: AtomicBool,
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn locked(&self, key: &CacheKey) -> bool {
        self.rows
            .get(key)
            .is_some_and(|row| row.locked_at.is_some())
    }

    /// Stored metadata for `key`, ignoring availability.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.rows.get(key).map(|row| row.entry.clone())
    }

    fn ensure_available(&self) -> Result<(), RepoError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepoError::unavailable("in-memory durable tier marked unavailable"))
        }
    }
}

#[async_trait]
impl TierStore for MemoryDurableStore {
    fn tier(&self) -> Tier {
        Tier::Durable
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, RepoError> {
        self.ensure_available()?;
        Ok(self
            .rows
            .get(key)
            .map(|row| row.entry.clone().into_record(RecordSource::Durable)))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), RepoError> {
        self.ensure_available()?;
        match self.rows.entry(entry.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                row.entry.value = entry.value.clone();
                row.entry.expires_hint = entry.expires_hint;
                row.entry.effort = entry.effort;
                row.entry.modified_at = entry.modified_at;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredRow {
                    entry: entry.clone(),
                    locked_at: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RowLock for MemoryDurableStore {
    async fn try_lock(&self, key: &CacheKey) -> Result<LockAttempt, RepoError> {
        self.ensure_available()?;
        let Some(mut row) = self.rows.get_mut(key) else {
            return Ok(LockAttempt::NoRow);
        };
        if row.locked_at.is_some() {
            return Ok(LockAttempt::Held);
        }
        row.locked_at = Some(OffsetDateTime::now_utc());
        Ok(LockAttempt::Acquired)
    }

    async fn unlock(&self, key: &CacheKey) -> Result<(), RepoError> {
        self.ensure_available()?;
        if let Some(mut row) = self.rows.get_mut(key) {
            row.locked_at = None;
        }
        Ok(())
    }

    async fn clear_all_locks(&self) -> Result<u64, RepoError> {
        self.ensure_available()?;
        let mut cleared = 0;
        for mut row in self.rows.iter_mut() {
            if row.locked_at.take().is_some() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn entry(key: &str, value: &'static str) -> CacheEntry {
        CacheEntry {
            function: "m.f".into(),
            version: "1".into(),
            namespace: "ns".into(),
            key: CacheKey::from_stored(key),
            effort: 2.5,
            modified_at: OffsetDateTime::now_utc(),
            expires_hint: None,
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_value_but_keeps_lock() {
        let store = MemoryDurableStore::new();
        let first = entry("k", "1");
        store.put(&first).await.unwrap();
        assert_eq!(store.try_lock(&first.key).await.unwrap(), LockAttempt::Acquired);

        store.put(&entry("k", "2")).await.unwrap();
        let record = store.get(&first.key).await.unwrap().expect("record");
        assert_eq!(record.value, Bytes::from("2"));
        assert_eq!(record.source, RecordSource::Durable);
        assert_eq!(record.effort, 2.5);
        assert!(store.locked(&first.key));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lock_states() {
        let store = MemoryDurableStore::new();
        let key = CacheKey::from_stored("k");
        assert_eq!(store.try_lock(&key).await.unwrap(), LockAttempt::NoRow);

        store.put(&entry("k", "1")).await.unwrap();
        assert_eq!(store.try_lock(&key).await.unwrap(), LockAttempt::Acquired);
        assert_eq!(store.try_lock(&key).await.unwrap(), LockAttempt::Held);

        store.unlock(&key).await.unwrap();
        store.unlock(&key).await.unwrap();
        assert!(!store.locked(&key));
    }

    #[tokio::test]
    async fn clear_all_locks_counts_locked_rows() {
        let store = MemoryDurableStore::new();
        for name in ["a", "b", "c"] {
            store.put(&entry(name, "1")).await.unwrap();
        }
        store.try_lock(&CacheKey::from_stored("a")).await.unwrap();
        store.try_lock(&CacheKey::from_stored("c")).await.unwrap();

        assert_eq!(store.clear_all_locks().await.unwrap(), 2);
        assert_eq!(store.clear_all_locks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryDurableStore::new();
        store.set_available(false);
        let key = CacheKey::from_stored("k");
        assert!(matches!(store.get(&key).await, Err(RepoError::Unavailable(_))));
        assert!(store.put(&entry("k", "1")).await.is_err());
        assert!(store.try_lock(&key).await.is_err());

        store.set_available(true);
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
