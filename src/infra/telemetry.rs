use std::io;
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_GENERATE_MS, METRIC_REMEMBER_BYPASS, METRIC_REMEMBER_HIT, METRIC_REMEMBER_MISS,
    METRIC_STORE_EVICT, METRIC_STORE_WRITE,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Per-statement sqlx logging is only kept at debug and below.
const QUIET_BELOW_DEBUG: &[&str] = &["sqlx::query=warn"];

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr; stdout is reserved for command output.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    if logging.level < LevelFilter::DEBUG {
        for directive in QUIET_BELOW_DEBUG {
            match directive.parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(err) => {
                    return Err(InfraError::telemetry(format!(
                        "invalid log directive `{directive}`: {err}"
                    )));
                }
            }
        }
    }

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("tracing subscriber already installed: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_REMEMBER_HIT,
            Unit::Count,
            "Total number of remember() calls served from the store."
        );
        describe_counter!(
            METRIC_REMEMBER_MISS,
            Unit::Count,
            "Total number of remember() calls that ran their generator."
        );
        describe_counter!(
            METRIC_REMEMBER_BYPASS,
            Unit::Count,
            "Total number of remember() calls that skipped the cache entirely."
        );
        describe_counter!(
            METRIC_STORE_WRITE,
            Unit::Count,
            "Total number of cache entries written."
        );
        describe_counter!(
            METRIC_STORE_EVICT,
            Unit::Count,
            "Total number of cache entries evicted by the entry limit."
        );
        describe_histogram!(
            METRIC_GENERATE_MS,
            Unit::Milliseconds,
            "Generator latency of remember() misses in milliseconds."
        );
    });
}
