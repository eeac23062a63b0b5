//! Execution engine: the public entry point for cached calls.
//!
//! Per call: merge the per-call override into the function policy, derive
//! the key, read the volatile then the durable tier, evaluate staleness, run
//! the decision table, then recompute inline, hand a refresh to the deferred
//! executor, or return what is available. Fresh computations are written to
//! both tiers; durable hits re-populate the volatile tier.
//!
//! Inline recomputes are not deduplicated: concurrent misses on one key each
//! compute. Only background refreshes go through the stampede guard.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::{
    ArgToken, CacheConfig, Decision, Lookup, Policy, PolicyOverride, VolatileStore, codec, decide,
    derive_key, expires_hint, is_stale, summarize_args,
};
use crate::domain::entities::{CacheEntry, CacheKey, FunctionId};
use crate::domain::types::{RecomputeMode, RecordSource};

use super::guard::StampedeGuard;
use super::repos::{DurableTier, TierStore};
use super::worker::{DeferredError, DeferredExecutor, DeferredTask};

const SOURCE: &str = "application::engine";

const METRIC_VOLATILE_HIT_TOTAL: &str = "tierstash_volatile_hit_total";
const METRIC_DURABLE_HIT_TOTAL: &str = "tierstash_durable_hit_total";
const METRIC_RECOMPUTE_TOTAL: &str = "tierstash_recompute_total";
const METRIC_MISS_TOTAL: &str = "tierstash_miss_total";
const METRIC_DEFERRED_TOTAL: &str = "tierstash_deferred_total";
const METRIC_DEFERRED_SKIPPED_TOTAL: &str = "tierstash_deferred_skipped_total";
const METRIC_TIER_ERROR_TOTAL: &str = "tierstash_tier_error_total";
const METRIC_RECOMPUTE_MS: &str = "tierstash_recompute_ms";

/// A function registered for caching: identity, policy and default result.
#[derive(Debug, Clone)]
pub struct CachedFunction<T> {
    id: FunctionId,
    policy: Policy,
    default: Option<T>,
}

impl<T> CachedFunction<T> {
    pub fn new(id: FunctionId, policy: Policy) -> Self {
        Self {
            id,
            policy,
            default: None,
        }
    }

    /// Value returned when nothing is cached and nothing is computed.
    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn default_value(&self) -> Option<&T> {
        self.default.as_ref()
    }
}

/// Raw value read from a tier, before decoding.
#[derive(Debug, Clone)]
pub(crate) struct RawHit {
    pub(crate) value: Bytes,
    pub(crate) source: RecordSource,
    pub(crate) modified_at: OffsetDateTime,
}

struct Hit<T> {
    value: T,
    raw: Bytes,
    source: RecordSource,
    modified_at: OffsetDateTime,
}

struct EngineInner {
    namespace: String,
    volatile: Option<Arc<dyn TierStore>>,
    durable: Option<Arc<dyn DurableTier>>,
    guard: Option<StampedeGuard>,
    executor: DeferredExecutor,
}

/// Cheaply cloneable handle to the caching engine.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

pub struct CacheEngineBuilder {
    namespace: String,
    volatile: Option<Arc<dyn TierStore>>,
    durable: Option<Arc<dyn DurableTier>>,
    executor: Option<DeferredExecutor>,
}

impl CacheEngineBuilder {
    pub fn volatile(mut self, store: Arc<dyn TierStore>) -> Self {
        self.volatile = Some(store);
        self
    }

    pub fn durable(mut self, store: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn executor(mut self, executor: DeferredExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> CacheEngine {
        let executor = self
            .executor
            .unwrap_or_else(|| DeferredExecutor::new(CacheConfig::default().worker_concurrency_non_zero()));
        let guard = self.durable.clone().map(StampedeGuard::new);
        CacheEngine {
            inner: Arc::new(EngineInner {
                namespace: self.namespace,
                volatile: self.volatile,
                durable: self.durable,
                guard,
                executor,
            }),
        }
    }
}

impl CacheEngine {
    pub fn builder(namespace: impl Into<String>) -> CacheEngineBuilder {
        CacheEngineBuilder {
            namespace: namespace.into(),
            volatile: None,
            durable: None,
            executor: None,
        }
    }

    /// Engine with an in-process volatile tier sized from `config`.
    pub fn from_config(config: &CacheConfig, durable: Option<Arc<dyn DurableTier>>) -> Self {
        let mut builder = Self::builder(config.namespace.clone())
            .volatile(Arc::new(VolatileStore::new(config.volatile_capacity)))
            .executor(DeferredExecutor::new(config.worker_concurrency_non_zero()));
        if let Some(durable) = durable {
            builder = builder.durable(durable);
        }
        builder.build()
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn executor(&self) -> &DeferredExecutor {
        &self.inner.executor
    }

    /// Key a call to `func` would use under `policy`.
    pub fn key_for<T>(&self, func: &CachedFunction<T>, policy: &Policy, args: &[ArgToken]) -> CacheKey {
        derive_key(&self.inner.namespace, "", &policy.version, Some(&func.id), args)
    }

    /// Run `func` through the cache.
    ///
    /// Returns the cached, fresh or stale value, or the default when nothing
    /// is available. Errors from an inline `compute` propagate unchanged; tier
    /// failures never do.
    pub async fn call<T, E, F, Fut>(
        &self,
        func: &CachedFunction<T>,
        args: Vec<ArgToken>,
        overrides: Option<PolicyOverride<T>>,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (policy, call_default) = match overrides {
            Some(overrides) => (func.policy.merged(&overrides), overrides.default),
            None => (func.policy.clone(), None),
        };
        let key = self.key_for(func, &policy, &args);
        let args_summary = summarize_args(&args);
        let function = func.id.to_string();

        let cached = if policy.recompute == RecomputeMode::Yes {
            None
        } else {
            self.read_typed::<T>(&key, &policy).await
        };
        let lookup = match &cached {
            None => Lookup::Missing,
            Some(hit) if is_stale(&policy.expiry, hit.modified_at) => Lookup::Stale,
            Some(_) => Lookup::Fresh,
        };
        let decision = decide(policy.recompute, lookup);

        let mut outcome = cached;
        let mut refresh = None;
        match decision {
            Decision::ReturnCached | Decision::ReturnDefault => {}
            Decision::RecomputeInline => {
                let (value, modified_at) = compute_timed(compute).await?;
                match codec::encode(&value) {
                    Ok(raw) => {
                        outcome = Some(Hit {
                            value,
                            raw,
                            source: RecordSource::Recomputed,
                            modified_at,
                        });
                    }
                    Err(err) => {
                        warn!(
                            target = SOURCE,
                            function = %function,
                            key = %key,
                            error = %err,
                            "recomputed value could not be encoded; skipping write-back"
                        );
                        log_invocation(&policy, RecordSource::Recomputed, &key, &function, &args_summary);
                        return Ok(Some(value));
                    }
                }
            }
            Decision::ServeStaleAndRefresh | Decision::DefaultAndRefresh => {
                refresh = Some(compute);
            }
        }

        let source = outcome
            .as_ref()
            .map_or(RecordSource::None, |hit| hit.source);
        if let Some(hit) = &outcome {
            self.store_entry(
                &function,
                &policy,
                &key,
                hit.raw.clone(),
                hit.source,
                hit.modified_at,
            )
            .await;
        }
        // Volatile write-back of a stale hit must land before the refresh can.
        if let Some(compute) = refresh {
            self.schedule_refresh(&function, &policy, &key, &args_summary, compute)
                .await;
        }
        log_invocation(&policy, source, &key, &function, &args_summary);

        Ok(outcome
            .map(|hit| hit.value)
            .or(call_default)
            .or_else(|| func.default.clone()))
    }

    async fn read_typed<T: DeserializeOwned>(&self, key: &CacheKey, policy: &Policy) -> Option<Hit<T>> {
        if policy.use_volatile {
            if let Some(store) = &self.inner.volatile {
                if let Some(hit) = decode_hit(read_tier(store.as_ref(), key).await, key) {
                    return Some(hit);
                }
            }
        }
        if policy.use_durable {
            if let Some(store) = &self.inner.durable {
                if let Some(hit) = decode_hit(read_tier(store.as_ref(), key).await, key) {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Volatile-then-durable read without decoding.
    pub(crate) async fn read_raw(
        &self,
        key: &CacheKey,
        use_volatile: bool,
        use_durable: bool,
    ) -> Option<RawHit> {
        if use_volatile {
            if let Some(store) = &self.inner.volatile {
                if let Some(hit) = read_tier(store.as_ref(), key).await {
                    return Some(hit);
                }
            }
        }
        if use_durable {
            if let Some(store) = &self.inner.durable {
                return read_tier(store.as_ref(), key).await;
            }
        }
        None
    }

    /// Write-back: recomputed values go to the durable tier; recomputed
    /// values and durable hits go to the volatile tier. Failures are logged.
    pub(crate) async fn store_entry(
        &self,
        function: &str,
        policy: &Policy,
        key: &CacheKey,
        value: Bytes,
        source: RecordSource,
        modified_at: OffsetDateTime,
    ) {
        if !matches!(source, RecordSource::Recomputed | RecordSource::Durable) {
            return;
        }

        let entry = CacheEntry {
            function: function.to_string(),
            version: policy.version.clone(),
            namespace: self.inner.namespace.clone(),
            key: key.clone(),
            effort: policy.effort,
            modified_at,
            expires_hint: expires_hint(&policy.expiry, modified_at),
            value,
        };

        if source == RecordSource::Recomputed && policy.use_durable {
            if let Some(store) = &self.inner.durable {
                write_tier(store.as_ref(), &entry).await;
            }
        }
        if policy.use_volatile {
            if let Some(store) = &self.inner.volatile {
                write_tier(store.as_ref(), &entry).await;
            }
        }
    }

    async fn schedule_refresh<T, E, F, Fut>(
        &self,
        function: &str,
        policy: &Policy,
        key: &CacheKey,
        args_summary: &str,
        compute: F,
    ) where
        T: Serialize + Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let guard = if policy.use_durable {
            self.inner.guard.clone()
        } else {
            None
        };
        if let Some(guard) = &guard {
            if !guard.acquire(key).await {
                counter!(METRIC_DEFERRED_SKIPPED_TOTAL).increment(1);
                debug!(
                    target = SOURCE,
                    function = %function,
                    key = %key,
                    "background recompute already in flight"
                );
                return;
            }
        }
        counter!(METRIC_DEFERRED_TOTAL).increment(1);

        let task = DeferredTask {
            function: function.to_string(),
            key: key.clone(),
            args: args_summary.to_string(),
        };

        let work = {
            let engine = self.clone();
            let policy = policy.forced_recompute();
            let task = task.clone();
            async move {
                let (value, modified_at) = compute_timed(compute)
                    .await
                    .map_err(|err| Box::new(err) as DeferredError)?;
                let raw = codec::encode(&value).map_err(|err| Box::new(err) as DeferredError)?;
                engine
                    .store_entry(
                        &task.function,
                        &policy,
                        &task.key,
                        raw,
                        RecordSource::Recomputed,
                        modified_at,
                    )
                    .await;
                log_invocation(
                    &policy,
                    RecordSource::Recomputed,
                    &task.key,
                    &task.function,
                    &task.args,
                );
                Ok(())
            }
        };

        let cleanup = {
            let key = key.clone();
            async move {
                if let Some(guard) = guard {
                    guard.release(&key).await;
                }
            }
        };

        self.inner.executor.submit(task, work, cleanup);
    }
}

async fn compute_timed<T, E, F, Fut>(compute: F) -> Result<(T, OffsetDateTime), E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started_at = Instant::now();
    let value = compute().await?;
    histogram!(METRIC_RECOMPUTE_MS).record(started_at.elapsed().as_secs_f64() * 1_000.0);
    Ok((value, OffsetDateTime::now_utc()))
}

async fn read_tier<S: TierStore + ?Sized>(store: &S, key: &CacheKey) -> Option<RawHit> {
    match store.get(key).await {
        Ok(record) => record.map(|record| RawHit {
            value: record.value,
            source: record.source,
            modified_at: record.modified_at,
        }),
        Err(err) => {
            counter!(METRIC_TIER_ERROR_TOTAL, "tier" => store.tier().as_str()).increment(1);
            warn!(
                target = SOURCE,
                tier = store.tier().as_str(),
                key = %key,
                error = %err,
                "tier read failed; treating as miss"
            );
            None
        }
    }
}

async fn write_tier<S: TierStore + ?Sized>(store: &S, entry: &CacheEntry) {
    if let Err(err) = store.put(entry).await {
        counter!(METRIC_TIER_ERROR_TOTAL, "tier" => store.tier().as_str()).increment(1);
        warn!(
            target = SOURCE,
            tier = store.tier().as_str(),
            key = %entry.key,
            error = %err,
            "tier write failed; value still returned to caller"
        );
    }
}

fn decode_hit<T: DeserializeOwned>(raw: Option<RawHit>, key: &CacheKey) -> Option<Hit<T>> {
    let raw = raw?;
    match codec::decode::<T>(&raw.value) {
        Ok(value) => Some(Hit {
            value,
            raw: raw.value,
            source: raw.source,
            modified_at: raw.modified_at,
        }),
        Err(err) => {
            warn!(
                target = SOURCE,
                key = %key,
                source = raw.source.status(),
                error = %err,
                "cached value does not decode; treating as miss"
            );
            None
        }
    }
}

/// Tokio task id when running inside a task, otherwise the thread name.
fn invocation_context() -> String {
    if let Some(id) = tokio::task::try_id() {
        return format!("task-{id}");
    }
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

/// One structured line per invocation.
fn log_invocation(
    policy: &Policy,
    source: RecordSource,
    key: &CacheKey,
    function: &str,
    args: &str,
) {
    let metric = match source {
        RecordSource::Volatile => METRIC_VOLATILE_HIT_TOTAL,
        RecordSource::Durable => METRIC_DURABLE_HIT_TOTAL,
        RecordSource::Recomputed => METRIC_RECOMPUTE_TOTAL,
        RecordSource::None => METRIC_MISS_TOTAL,
    };
    counter!(metric).increment(1);

    let thread = invocation_context();

    match source {
        RecordSource::Recomputed | RecordSource::Durable => info!(
            target = SOURCE,
            thread = %thread,
            mode = policy.recompute.as_str(),
            status = source.status(),
            version = %policy.version,
            key = %key,
            function,
            args,
            "cache invocation"
        ),
        RecordSource::Volatile | RecordSource::None => debug!(
            target = SOURCE,
            thread = %thread,
            mode = policy.recompute.as_str(),
            status = source.status(),
            version = %policy.version,
            key = %key,
            function,
            args,
            "cache invocation"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invocation_context_names_the_task() {
        let first = tokio::spawn(async { invocation_context() }).await.unwrap();
        let second = tokio::spawn(async { invocation_context() }).await.unwrap();

        assert!(first.starts_with("task-"), "{first}");
        assert!(second.starts_with("task-"), "{second}");
        assert_ne!(first, second);
    }

    #[test]
    fn invocation_context_falls_back_to_thread_name() {
        let name = std::thread::Builder::new()
            .name("cache-caller".into())
            .spawn(invocation_context)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name, "cache-caller");
    }
}
