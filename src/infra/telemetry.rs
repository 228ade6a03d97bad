use std::sync::Once;

use metrics::{Unit, describe_counter};
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
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tiercache_cache_hit_total",
            Unit::Count,
            "Bounded cache lookups that found a live entry, labelled by cache."
        );
        describe_counter!(
            "tiercache_cache_miss_total",
            Unit::Count,
            "Bounded cache lookups that found nothing live, labelled by cache."
        );
        describe_counter!(
            "tiercache_cache_evict_total",
            Unit::Count,
            "Entries evicted to stay within capacity, labelled by cache."
        );
        describe_counter!(
            "tiercache_cache_expired_total",
            Unit::Count,
            "Entries dropped because their expiration passed, labelled by cache."
        );
        describe_counter!(
            "tiercache_hybrid_remote_total",
            Unit::Count,
            "Hybrid cache remote tier operations by outcome (hit, miss, error)."
        );
        describe_counter!(
            "tiercache_hybrid_compute_total",
            Unit::Count,
            "Hybrid cache computations by outcome (ok, error)."
        );
        describe_counter!(
            "tiercache_response_total",
            Unit::Count,
            "Response cache decisions by outcome."
        );
    });
}
