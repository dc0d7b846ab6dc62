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

/// Statement logging from sqlx drowns out the cache's own events at `info`.
const QUIET_DIRECTIVES: &[&str] = &["sqlx::query=warn", "apalis_sql=info"];

enum MetricKind {
    Counter,
    Histogram,
}

const METRICS: &[(&str, MetricKind, &str)] = &[
    (
        "tessera_fragment_hit_total",
        MetricKind::Counter,
        "Fragment lookups served from the cache.",
    ),
    (
        "tessera_fragment_miss_total",
        MetricKind::Counter,
        "Fragment lookups that found no live row.",
    ),
    (
        "tessera_fragment_write_total",
        MetricKind::Counter,
        "Fragments persisted when their scope closed.",
    ),
    (
        "tessera_fragment_write_skipped_total",
        MetricKind::Counter,
        "Closed scopes that were not persisted, labelled by reason.",
    ),
    (
        "tessera_invalidated_total",
        MetricKind::Counter,
        "Fragments deleted by invalidation.",
    ),
    (
        "tessera_swept_total",
        MetricKind::Counter,
        "Expired fragments removed by the sweeper.",
    ),
    (
        "tessera_requery_malformed_total",
        MetricKind::Counter,
        "Stored saved queries that could not be decoded during requery.",
    ),
    (
        "tessera_requery_ms",
        MetricKind::Histogram,
        "Deferred requery run latency in milliseconds.",
    ),
];

/// Install the global tracing subscriber and register metric descriptions.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    for directive in QUIET_DIRECTIVES {
        let directive = directive
            .parse()
            .map_err(|err| InfraError::telemetry(format!("bad log directive `{directive}`: {err}")))?;
        env_filter = env_filter.add_directive(directive);
    }

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, kind, description) in METRICS {
            match kind {
                MetricKind::Counter => describe_counter!(*name, Unit::Count, *description),
                MetricKind::Histogram => {
                    describe_histogram!(*name, Unit::Milliseconds, *description)
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_directives_parse() {
        for directive in QUIET_DIRECTIVES {
            assert!(
                directive
                    .parse::<tracing_subscriber::filter::Directive>()
                    .is_ok(),
                "{directive}"
            );
        }
    }

    #[test]
    fn metric_names_are_unique_and_prefixed() {
        let mut names: Vec<&str> = METRICS.iter().map(|(name, _, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), METRICS.len());
        assert!(names.iter().all(|name| name.starts_with("tessera_")));
    }
}
