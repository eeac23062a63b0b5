//! Stampede guard: at most one background recompute per key.
//!
//! Backed by the durable tier's row lock. A key with no durable row yet has
//! nothing to lock, so `acquire` succeeds unconditionally for it: two
//! concurrent `alwaysdefer` calls on a never-seen key both refresh. The lock
//! has no timeout; a recompute that never finishes keeps its key locked until
//! the flags are cleared (`tierstash clear-locks`).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::entities::CacheKey;

use super::repos::{DurableTier, LockAttempt};

const SOURCE: &str = "application::guard";

#[derive(Clone)]
pub struct StampedeGuard {
    durable: Arc<dyn DurableTier>,
}

impl StampedeGuard {
    pub fn new(durable: Arc<dyn DurableTier>) -> Self {
        Self { durable }
    }

    /// Single-attempt test-and-set. Returns false when another recompute
    /// already holds the key or the lock could not be read.
    pub async fn acquire(&self, key: &CacheKey) -> bool {
        match self.durable.try_lock(key).await {
            Ok(LockAttempt::Acquired) => true,
            Ok(LockAttempt::Held) => false,
            Ok(LockAttempt::NoRow) => {
                debug!(
                    target = SOURCE,
                    key = %key,
                    "no durable row to lock; background recompute proceeds without exclusion"
                );
                true
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    key = %key,
                    error = %err,
                    "row lock unavailable; skipping background recompute"
                );
                false
            }
        }
    }

    /// Clear the lock. Safe to call more than once.
    pub async fn release(&self, key: &CacheKey) {
        if let Err(err) = self.durable.unlock(key).await {
            warn!(
                target = SOURCE,
                key = %key,
                error = %err,
                "failed to release row lock"
            );
        }
    }
}
