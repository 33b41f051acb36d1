use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::time::Duration;

use crate::error::{ExporterError, Result};
use crate::ingest::event::{ErrorEvent, LogEvent, MalformedQuery, QueryEvent, QueryKind};

pub const QUERY_TOTAL: &str = "postgres_query_total";
pub const QUERY_DURATION_SECONDS: &str = "postgres_query_duration_seconds";
pub const PARSE_ERRORS_TOTAL: &str = "postgres_log_parse_errors_total";
pub const VERSION: &str = "version";

/// Destination for finalized log events
pub trait MetricsSink: Send + Sync {
    /// Count one query and observe its duration
    fn record_query(&self, database: &str, kind: QueryKind, duration_ms: f64);

    /// Count one error record (`error`, `fatal`, ...)
    fn record_error(&self, database: &str, kind: &str);

    /// Count one query record whose duration could not be parsed
    fn record_parse_error(&self, database: &str, kind: QueryKind);
}

/// Route a parser event to the matching sink call
pub fn dispatch(sink: &dyn MetricsSink, event: &LogEvent) {
    match event {
        LogEvent::Query(QueryEvent {
            database,
            query_kind,
            duration_ms,
        }) => sink.record_query(database, *query_kind, *duration_ms),
        LogEvent::Error(ErrorEvent {
            database,
            error_kind,
        }) => sink.record_error(database, error_kind),
        LogEvent::Malformed(MalformedQuery {
            database,
            query_kind,
            ..
        }) => sink.record_parse_error(database, *query_kind),
    }
}

/// Prometheus-backed metric registry.
///
/// Owns its recorder instead of installing a global one, so several
/// registries can live in one process (tests, multiple pipelines).
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Build a registry whose duration histogram uses `buckets` (seconds)
    pub fn new(buckets: &[f64]) -> Result<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(QUERY_DURATION_SECONDS.to_string()), buckets)
            .map_err(|e| ExporterError::MetricsSetup(e.to_string()))?
            .build_recorder();
        let handle = recorder.handle();

        let registry = Self { recorder, handle };
        registry.init_metric_descriptions();

        Ok(registry)
    }

    fn init_metric_descriptions(&self) {
        metrics::with_local_recorder(&self.recorder, || {
            describe_counter!(QUERY_TOTAL, "Postgres query total calls");
            describe_histogram!(
                QUERY_DURATION_SECONDS,
                metrics::Unit::Seconds,
                "Postgres query duration in seconds"
            );
            describe_counter!(
                PARSE_ERRORS_TOTAL,
                "Postgres query log records with an unparseable duration"
            );
            describe_gauge!(VERSION, "Version information about this exporter");

            gauge!(VERSION, "postgres_query_exporter_build_info" => env!("CARGO_PKG_VERSION"))
                .set(1.0);
        });
    }

    /// Handle for rendering the exposition text
    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    /// Current metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_query(&self, database: &str, kind: QueryKind, duration_ms: f64) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                QUERY_TOTAL,
                "database" => database.to_string(),
                "query" => kind.as_str()
            )
            .increment(1);

            histogram!(
                QUERY_DURATION_SECONDS,
                "database" => database.to_string(),
                "query" => kind.as_str()
            )
            .record(duration_ms / 1000.0);
        });
    }

    fn record_error(&self, database: &str, kind: &str) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                QUERY_TOTAL,
                "database" => database.to_string(),
                "query" => kind.to_string()
            )
            .increment(1);
        });
    }

    fn record_parse_error(&self, database: &str, kind: QueryKind) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                PARSE_ERRORS_TOTAL,
                "database" => database.to_string(),
                "query" => kind.as_str()
            )
            .increment(1);
        });
    }
}

/// Spawn the periodic upkeep a non-installed recorder needs to bound histogram memory
pub fn spawn_upkeep(handle: PrometheusHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            handle.run_upkeep();
        }
    })
}
