use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "gazette_cache_hit_total",
            Unit::Count,
            "Cache lookups answered from a store, labelled by tier."
        );
        describe_counter!(
            "gazette_cache_miss_total",
            Unit::Count,
            "Cache lookups that found nothing usable."
        );
        describe_counter!(
            "gazette_cache_fallback_total",
            Unit::Count,
            "Distributed cache operations that failed over to memory, labelled by operation."
        );
        describe_counter!(
            "gazette_cache_evict_total",
            Unit::Count,
            "Entries evicted from the in-process store due to capacity."
        );
        describe_gauge!(
            "gazette_cache_remote_ready",
            Unit::Count,
            "1 while the distributed cache is ready, 0 otherwise."
        );
        describe_counter!(
            "gazette_cache_invalidated_total",
            Unit::Count,
            "Entries removed by tag or pattern invalidation."
        );
        describe_counter!(
            "gazette_cache_write_failed_total",
            Unit::Count,
            "Cache writes dropped because the value could not be stored."
        );
    });
}
