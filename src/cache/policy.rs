//! Per-function cache policy, per-call overrides, staleness and the recompute
//! decision table.

use time::OffsetDateTime;

use crate::domain::error::DomainError;
use crate::domain::types::{Expiry, RecomputeMode};

/// Immutable cache configuration for one cached function.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub version: String,
    /// Estimated recomputation cost; stored with durable records, informational only.
    pub effort: f64,
    pub expiry: Expiry,
    pub use_volatile: bool,
    pub use_durable: bool,
    pub recompute: RecomputeMode,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: "0".to_string(),
            effort: 1.0,
            expiry: Expiry::Never,
            use_volatile: true,
            use_durable: true,
            recompute: RecomputeMode::Auto,
        }
    }
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Apply a per-call override, leaving `self` untouched.
    pub fn merged<T>(&self, overrides: &PolicyOverride<T>) -> Policy {
        let mut merged = self.clone();
        if let Some(version) = overrides.version.as_ref() {
            merged.version = version.clone();
        }
        if let Some(effort) = overrides.effort {
            merged.effort = effort;
        }
        if let Some(expiry) = overrides.expiry {
            merged.expiry = expiry;
        }
        if let Some(use_volatile) = overrides.use_volatile {
            merged.use_volatile = use_volatile;
        }
        if let Some(use_durable) = overrides.use_durable {
            merged.use_durable = use_durable;
        }
        if let Some(recompute) = overrides.recompute {
            merged.recompute = recompute;
        }
        if overrides.bypass_cache {
            merged.use_volatile = false;
            merged.use_durable = false;
        }
        merged
    }

    /// Copy of this policy that always recomputes inline.
    pub fn forced_recompute(&self) -> Policy {
        Policy {
            recompute: RecomputeMode::Yes,
            ..self.clone()
        }
    }
}

/// Validating builder for [`Policy`].
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    policy: Policy,
    expiry_spec: Option<String>,
}

impl PolicyBuilder {
    pub fn version(mut self, version: impl ToString) -> Self {
        self.policy.version = version.to_string();
        self
    }

    pub fn effort(mut self, effort: f64) -> Self {
        self.policy.effort = effort;
        self
    }

    pub fn expiry(mut self, expiry: Expiry) -> Self {
        self.policy.expiry = expiry;
        self.expiry_spec = None;
        self
    }

    /// Human-readable expiry such as `"10m"`; validated by [`build`](Self::build).
    pub fn expires_in(mut self, spec: impl Into<String>) -> Self {
        self.expiry_spec = Some(spec.into());
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

    pub fn recompute(mut self, mode: RecomputeMode) -> Self {
        self.policy.recompute = mode;
        self
    }

    pub fn build(self) -> Result<Policy, DomainError> {
        let mut policy = self.policy;
        if let Some(spec) = self.expiry_spec {
            policy.expiry = Expiry::parse(&spec)?;
        }
        if !policy.effort.is_finite() || policy.effort < 0.0 {
            return Err(DomainError::validation(format!(
                "effort must be a non-negative number, got {}",
                policy.effort
            )));
        }
        Ok(policy)
    }
}

/// Per-call policy adjustments. Unset fields inherit the function's policy.
#[derive(Debug, Clone)]
pub struct PolicyOverride<T> {
    pub version: Option<String>,
    pub effort: Option<f64>,
    pub expiry: Option<Expiry>,
    pub use_volatile: Option<bool>,
    pub use_durable: Option<bool>,
    pub recompute: Option<RecomputeMode>,
    /// Skip both tiers for this call.
    pub bypass_cache: bool,
    /// Returned instead of the function default when nothing is available.
    pub default: Option<T>,
}

impl<T> Default for PolicyOverride<T> {
    fn default() -> Self {
        Self {
            version: None,
            effort: None,
            expiry: None,
            use_volatile: None,
            use_durable: None,
            recompute: None,
            bypass_cache: false,
            default: None,
        }
    }
}

impl<T> PolicyOverride<T> {
    pub fn recompute(mode: RecomputeMode) -> Self {
        Self {
            recompute: Some(mode),
            ..Self::default()
        }
    }
}

/// True iff `modified_at + expiry` lies in the past.
pub fn is_stale(expiry: &Expiry, modified_at: OffsetDateTime) -> bool {
    is_stale_at(expiry, modified_at, OffsetDateTime::now_utc())
}

pub fn is_stale_at(expiry: &Expiry, modified_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    let Some(duration) = expiry.duration() else {
        return false;
    };
    let Ok(duration) = time::Duration::try_from(duration) else {
        return false;
    };
    match modified_at.checked_add(duration) {
        Some(expires_at) => expires_at < now,
        None => false,
    }
}

/// Expiry hint stored with durable records; `None` never expires.
pub fn expires_hint(expiry: &Expiry, modified_at: OffsetDateTime) -> Option<OffsetDateTime> {
    let duration = time::Duration::try_from(expiry.duration()?).ok()?;
    modified_at.checked_add(duration)
}

/// Result of the cache read, as seen by the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Fresh,
    Stale,
}

/// What an invocation does after reading the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ReturnCached,
    RecomputeInline,
    /// Serve the cached (stale) value now and refresh in the background.
    ServeStaleAndRefresh,
    /// Serve the default now and compute in the background.
    DefaultAndRefresh,
    /// Serve the default without computing.
    ReturnDefault,
}

pub fn decide(mode: RecomputeMode, lookup: Lookup) -> Decision {
    use Decision::*;
    use RecomputeMode as M;

    match (mode, lookup) {
        (M::Yes, _) => RecomputeInline,

        (M::No | M::Lookup, Lookup::Missing) => ReturnDefault,
        (M::No | M::Lookup, _) => ReturnCached,

        (M::Auto, Lookup::Fresh) => ReturnCached,
        (M::Auto, _) => RecomputeInline,

        (M::Defer, Lookup::Fresh) => ReturnCached,
        (M::Defer, Lookup::Stale) => ServeStaleAndRefresh,
        (M::Defer, Lookup::Missing) => RecomputeInline,

        (M::AlwaysDefer, Lookup::Fresh) => ReturnCached,
        (M::AlwaysDefer, Lookup::Stale) => ServeStaleAndRefresh,
        (M::AlwaysDefer, Lookup::Missing) => DefaultAndRefresh,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;

    #[test]
    fn staleness_boundaries() {
        let minute = Expiry::After(Duration::from_secs(60));
        let now = datetime!(2024-05-01 12:00:00 UTC);

        assert!(is_stale_at(&minute, now - time::Duration::seconds(61), now));
        assert!(!is_stale_at(&minute, now - time::Duration::seconds(30), now));
        assert!(!is_stale_at(&minute, now - time::Duration::seconds(60), now));
        assert!(!is_stale_at(&Expiry::Never, datetime!(1970-01-01 0:00 UTC), now));
    }

    #[test]
    fn is_stale_uses_wall_clock() {
        let minute = Expiry::After(Duration::from_secs(60));
        let now = OffsetDateTime::now_utc();
        assert!(is_stale(&minute, now - time::Duration::seconds(61)));
        assert!(!is_stale(&minute, now - time::Duration::seconds(30)));
        assert!(!is_stale(&Expiry::Never, now - time::Duration::days(10_000)));
    }

    #[test]
    fn expires_hint_follows_expiry() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        assert_eq!(expires_hint(&Expiry::Never, now), None);
        assert_eq!(
            expires_hint(&Expiry::After(Duration::from_secs(3_600)), now),
            Some(datetime!(2024-05-01 13:00:00 UTC))
        );
    }

    #[test]
    fn decision_table() {
        use Decision::*;
        use Lookup::*;
        use RecomputeMode as M;

        let table = [
            (M::Yes, [RecomputeInline, RecomputeInline, RecomputeInline]),
            (M::No, [ReturnCached, ReturnCached, ReturnDefault]),
            (M::Lookup, [ReturnCached, ReturnCached, ReturnDefault]),
            (M::Auto, [ReturnCached, RecomputeInline, RecomputeInline]),
            (M::Defer, [ReturnCached, ServeStaleAndRefresh, RecomputeInline]),
            (
                M::AlwaysDefer,
                [ReturnCached, ServeStaleAndRefresh, DefaultAndRefresh],
            ),
        ];

        for (mode, [fresh, stale, missing]) in table {
            assert_eq!(decide(mode, Fresh), fresh, "{mode} fresh");
            assert_eq!(decide(mode, Stale), stale, "{mode} stale");
            assert_eq!(decide(mode, Missing), missing, "{mode} missing");
        }
    }

    #[test]
    fn override_is_copy_on_write() {
        let base = Policy::builder()
            .version(3)
            .expires_in("10m")
            .recompute(RecomputeMode::Defer)
            .build()
            .expect("valid policy");

        let overrides = PolicyOverride::<String> {
            version: Some("4".into()),
            recompute: Some(RecomputeMode::No),
            ..Default::default()
        };
        let merged = base.merged(&overrides);

        assert_eq!(merged.version, "4");
        assert_eq!(merged.recompute, RecomputeMode::No);
        assert_eq!(merged.expiry, Expiry::After(Duration::from_secs(600)));
        assert_eq!(base.version, "3");
        assert_eq!(base.recompute, RecomputeMode::Defer);
    }

    #[test]
    fn bypass_disables_both_tiers() {
        let merged = Policy::default().merged(&PolicyOverride::<()> {
            bypass_cache: true,
            use_volatile: Some(true),
            ..Default::default()
        });
        assert!(!merged.use_volatile);
        assert!(!merged.use_durable);
    }

    #[test]
    fn builder_rejects_invalid_input() {
        assert!(Policy::builder().expires_in("tomorrow").build().is_err());
        assert!(Policy::builder().effort(-1.0).build().is_err());
        assert!(Policy::builder().effort(f64::NAN).build().is_err());
    }

    #[test]
    fn forced_recompute_keeps_other_fields() {
        let base = Policy::builder()
            .version("7")
            .recompute(RecomputeMode::AlwaysDefer)
            .build()
            .unwrap();
        let forced = base.forced_recompute();
        assert_eq!(forced.recompute, RecomputeMode::Yes);
        assert_eq!(forced.version, "7");
    }
}
