//! Engine-wide cache configuration.

use std::num::NonZeroUsize;

use serde::Deserialize;

use crate::domain::types::{Expiry, RecomputeMode};

use super::policy::Policy;

const DEFAULT_NAMESPACE: &str = "tierstash";
const DEFAULT_VOLATILE_CAPACITY: usize = 10_000;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Cache configuration from `tierstash.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace mixed into every key; keeps projects sharing a store apart.
    pub namespace: String,
    /// Maximum entries held by the volatile tier.
    pub volatile_capacity: usize,
    /// Maximum deferred recomputes running at once.
    pub worker_concurrency: usize,
    /// Enable the volatile tier for functions that do not say otherwise.
    pub use_volatile: bool,
    /// Enable the durable tier for functions that do not say otherwise.
    pub use_durable: bool,
    /// Recompute mode for functions that do not say otherwise.
    pub default_recompute: RecomputeMode,
    /// Expiry for functions that do not say otherwise.
    pub default_expiry: Expiry,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            volatile_capacity: DEFAULT_VOLATILE_CAPACITY,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            use_volatile: true,
            use_durable: true,
            default_recompute: RecomputeMode::Auto,
            default_expiry: Expiry::Never,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            volatile_capacity: settings.volatile_capacity.get(),
            worker_concurrency: settings.worker_concurrency.get(),
            use_volatile: settings.use_volatile,
            use_durable: settings.use_durable,
            default_recompute: settings.default_recompute,
            default_expiry: settings.default_expiry,
        }
    }
}

impl CacheConfig {
    /// Worker concurrency as NonZeroUsize, clamping to 1 if zero.
    pub fn worker_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.worker_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    /// Starting policy for functions registered against this configuration.
    pub fn default_policy(&self) -> Policy {
        Policy {
            expiry: self.default_expiry,
            use_volatile: self.use_volatile,
            use_durable: self.use_durable,
            recompute: self.default_recompute,
            ..Policy::default()
        }
    }
}
