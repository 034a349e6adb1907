use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cachegate_cache_hit_total",
            Unit::Count,
            "Total number of response-cache hits, labelled by content class."
        );
        describe_counter!(
            "cachegate_cache_miss_total",
            Unit::Count,
            "Total number of response-cache misses."
        );
        describe_counter!(
            "cachegate_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted due to capacity."
        );
        describe_counter!(
            "cachegate_cache_expired_total",
            Unit::Count,
            "Total number of entries removed after their TTL elapsed."
        );
        describe_gauge!(
            "cachegate_event_queue_len",
            Unit::Count,
            "Current number of pending mutation events in the queue."
        );
        describe_counter!(
            "cachegate_event_dropped_total",
            Unit::Count,
            "Total number of mutation events dropped due to queue overflow."
        );
        describe_counter!(
            "cachegate_broadcast_node_failure_total",
            Unit::Count,
            "Total number of failed or timed-out purge calls, labelled by node."
        );
        describe_histogram!(
            "cachegate_consume_ms",
            Unit::Milliseconds,
            "Invalidation consumption latency in milliseconds."
        );
        describe_histogram!(
            "cachegate_broadcast_ms",
            Unit::Milliseconds,
            "Purge broadcast latency across all nodes in milliseconds."
        );
    });
}
