use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_thread_names(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tierstash_volatile_hit_total",
            Unit::Count,
            "Invocations answered from the volatile tier."
        );
        describe_counter!(
            "tierstash_durable_hit_total",
            Unit::Count,
            "Invocations answered from the durable tier."
        );
        describe_counter!(
            "tierstash_recompute_total",
            Unit::Count,
            "Values produced by running the wrapped function."
        );
        describe_counter!(
            "tierstash_miss_total",
            Unit::Count,
            "Invocations that returned the default value."
        );
        describe_counter!(
            "tierstash_volatile_evict_total",
            Unit::Count,
            "Volatile tier evictions due to capacity."
        );
        describe_counter!(
            "tierstash_deferred_total",
            Unit::Count,
            "Background recomputes handed to the executor."
        );
        describe_counter!(
            "tierstash_deferred_skipped_total",
            Unit::Count,
            "Background recomputes skipped because the key was already locked."
        );
        describe_counter!(
            "tierstash_deferred_failed_total",
            Unit::Count,
            "Background recomputes that returned an error or panicked."
        );
        describe_counter!(
            "tierstash_tier_error_total",
            Unit::Count,
            "Tier reads or writes that failed and were degraded."
        );
        describe_histogram!(
            "tierstash_recompute_ms",
            Unit::Milliseconds,
            "Wrapped function latency in milliseconds."
        );
    });
}
