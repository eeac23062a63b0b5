//! Repository traits describing the storage tiers.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{CacheEntry, CacheKey, CacheRecord};
use crate::domain::types::Tier;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("tier unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// One storage tier: keyed reads and upserting writes.
///
/// Absence is `Ok(None)`. Errors are reported to the caller, which treats
/// them as a miss on reads and as a skipped write on writes.
#[async_trait]
pub trait TierStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheRecord>, RepoError>;

    /// Insert, or overwrite the value, expiry hint, effort and modification
    /// time of an existing record. Never touches the row lock.
    async fn put(&self, entry: &CacheEntry) -> Result<(), RepoError>;
}

/// Outcome of a single test-and-set attempt on a row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Another recompute already holds the lock.
    Held,
    /// No durable record exists for the key, so there is nothing to lock.
    NoRow,
}

/// Advisory per-record lock flag: no queuing, no fairness, no timeout.
#[async_trait]
pub trait RowLock: Send + Sync {
    async fn try_lock(&self, key: &CacheKey) -> Result<LockAttempt, RepoError>;

    /// Clear the flag. Clearing an unlocked or missing row is a no-op.
    async fn unlock(&self, key: &CacheKey) -> Result<(), RepoError>;

    /// Clear every flag, returning how many rows were locked.
    async fn clear_all_locks(&self) -> Result<u64, RepoError>;
}

/// The authoritative tier: a [`TierStore`] that also carries row locks.
pub trait DurableTier: TierStore + RowLock {}

impl<T: TierStore + RowLock + ?Sized> DurableTier for T {}
