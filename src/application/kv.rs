//! Plain key-value access to the same two tiers the engine uses.
//!
//! Entries live under the function name `kv:<prefix>` with the prefix mixed
//! into the key, so they never collide with cached function results.

use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::warn;

use crate::cache::{ArgToken, CodecError, Policy, codec, derive_key};
use crate::domain::entities::CacheKey;
use crate::domain::types::{Expiry, RecomputeMode, RecordSource};

use super::engine::CacheEngine;

const SOURCE: &str = "application::kv";

pub struct KvStore<T> {
    engine: CacheEngine,
    prefix: String,
    function: String,
    policy: Policy,
    default: Option<T>,
}

impl<T> KvStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(engine: &CacheEngine, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            engine: engine.clone(),
            function: format!("kv:{prefix}"),
            prefix,
            policy: Policy {
                effort: 0.0,
                expiry: Expiry::Never,
                recompute: RecomputeMode::Lookup,
                ..Policy::default()
            },
            default: None,
        }
    }

    pub fn version(mut self, version: impl ToString) -> Self {
        self.policy.version = version.to_string();
        self
    }

    pub fn use_volatile(mut self, enabled: bool) -> Self {
        self.policy.use_volatile = enabled;
        self
    }

    pub fn use_durable(mut self, enabled: bool) -> Self {
        self.policy.use_durable = enabled;
        self
    }

    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    pub fn key(&self, key: impl Into<ArgToken>) -> CacheKey {
        derive_key(
            self.engine.namespace(),
            &self.prefix,
            &self.policy.version,
            None,
            &[key.into()],
        )
    }

    /// Store `value` in every enabled tier. Only encoding failures are
    /// returned; tier failures are logged.
    pub async fn put(&self, key: impl Into<ArgToken>, value: &T) -> Result<(), CodecError> {
        let key = self.key(key);
        let raw = codec::encode(value)?;
        self.engine
            .store_entry(
                &self.function,
                &self.policy,
                &key,
                raw,
                RecordSource::Recomputed,
                OffsetDateTime::now_utc(),
            )
            .await;
        Ok(())
    }

    /// Stored value, or the default. A durable hit refreshes the volatile tier.
    pub async fn get(&self, key: impl Into<ArgToken>) -> Option<T> {
        let key = self.key(key);
        let hit = self
            .engine
            .read_raw(&key, self.policy.use_volatile, self.policy.use_durable)
            .await;
        let Some(hit) = hit else {
            return self.default.clone();
        };

        match codec::decode::<T>(&hit.value) {
            Ok(value) => {
                if hit.source == RecordSource::Durable {
                    self.engine
                        .store_entry(
                            &self.function,
                            &self.policy,
                            &key,
                            hit.value,
                            hit.source,
                            hit.modified_at,
                        )
                        .await;
                }
                Some(value)
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    function = %self.function,
                    key = %key,
                    error = %err,
                    "stored value does not decode; returning default"
                );
                self.default.clone()
            }
        }
    }
}
