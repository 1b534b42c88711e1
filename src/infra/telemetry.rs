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

/// Register descriptions for every metric the service emits.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "courtwatch_realtime_events_total",
            Unit::Count,
            "Total number of change events received from the realtime channel."
        );
        describe_counter!(
            "courtwatch_realtime_throttled_total",
            Unit::Count,
            "Total number of change events dropped inside a table's cool-down window."
        );
        describe_counter!(
            "courtwatch_realtime_unmapped_total",
            Unit::Count,
            "Total number of change events for tables with no mapped query keys."
        );
        describe_counter!(
            "courtwatch_realtime_reconnects_total",
            Unit::Count,
            "Total number of scheduled reconnect attempts."
        );
        describe_gauge!(
            "courtwatch_realtime_connected",
            Unit::Count,
            "1 while the realtime channel is subscribed, 0 otherwise."
        );
        describe_histogram!(
            "courtwatch_cache_invalidate_ms",
            Unit::Milliseconds,
            "Query cache invalidation latency in milliseconds, refetches included."
        );
        describe_counter!(
            "courtwatch_cache_refetch_total",
            Unit::Count,
            "Total number of refetches triggered by invalidation, by result."
        );
        describe_counter!(
            "courtwatch_cache_gc_evicted_total",
            Unit::Count,
            "Total number of idle unobserved queries removed by garbage collection."
        );
    });
}
