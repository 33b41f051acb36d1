//! Log ingestion pipeline
//!
//! The reader opens the file the resolver names for "now", follows it, and
//! hands every complete line to the parser. Each opened file is a generation
//! with its own follower, rotation watcher and rate limiter. When the watcher
//! reports a new name the old generation is drained and torn down before the
//! next file is opened, so files are processed strictly one after another.

pub mod event;
pub mod format;
pub mod parser;
pub mod rate_limit;
pub mod resolver;
pub mod tailer;
pub mod watcher;

pub use event::{ErrorEvent, LogEvent, MalformedQuery, QueryEvent, QueryKind};
pub use format::{LogFormat, MarkerPatterns};
pub use parser::LogParser;
pub use rate_limit::RateLimiter;
pub use resolver::{system_clock, Clock, FilenameResolver};
pub use tailer::FileTailer;
pub use watcher::RotationSignal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{Config, StartPosition};
use crate::error::{ExporterError, Result};
use crate::metrics::{self, MetricsSink};

/// Timing and sizing knobs of the reader
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    /// How often the rotation watcher re-resolves the file name
    pub poll_interval: Duration,
    /// Delay before retrying a file that could not be opened
    pub retry_interval: Duration,
    /// How often the follower checks for appended bytes
    pub follow_interval: Duration,
    pub queue_capacity: usize,
    pub rate_tokens: u32,
    pub rate_refill_interval: Duration,
    /// Where to start in the first file; later files are read from the beginning
    pub start_position: StartPosition,
}

impl ReaderSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.ingest.poll_interval(),
            retry_interval: cfg.ingest.retry_interval(),
            follow_interval: cfg.ingest.follow_interval(),
            queue_capacity: cfg.ingest.queue_capacity,
            rate_tokens: cfg.ingest.rate_limit.tokens,
            rate_refill_interval: cfg.ingest.rate_limit.refill_interval(),
            start_position: cfg.log.start_position,
        }
    }
}

/// How a file generation ended
#[derive(Debug)]
enum Generation {
    Rotated(PathBuf),
    FollowerLost,
    Shutdown,
}

/// Reader, parser and sink wired together
pub struct Pipeline {
    resolver: FilenameResolver,
    clock: Clock,
    settings: ReaderSettings,
    parser: LogParser,
    sink: Arc<dyn MetricsSink>,
    lines_read: u64,
}

impl Pipeline {
    pub fn new(
        resolver: FilenameResolver,
        format: LogFormat,
        settings: ReaderSettings,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            resolver,
            clock: system_clock(),
            settings,
            parser: LogParser::new(format),
            sink,
            lines_read: 0,
        }
    }

    /// Build the pipeline described by a validated config
    pub fn from_config(cfg: &Config, sink: Arc<dyn MetricsSink>) -> Result<Self> {
        let offset = cfg
            .log
            .timezone()
            .map_err(|e| ExporterError::InvalidTimezone(e.to_string()))?;
        let resolver = FilenameResolver::new(&cfg.log.directory, &cfg.log.file_pattern, offset)?;
        let format = LogFormat::from_config(&cfg.log)?;

        Ok(Self::new(
            resolver,
            format,
            ReaderSettings::from_config(cfg),
            sink,
        ))
    }

    /// Replace the wall clock used to resolve file names
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Follow the log until `shutdown` fires (or its sender is dropped)
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            directory = %self.resolver.directory().display(),
            format = self.parser.format_name(),
            "Log reader started"
        );

        let mut start = self.settings.start_position;
        let mut next: Option<PathBuf> = None;

        loop {
            let path = next
                .take()
                .unwrap_or_else(|| self.resolver.resolve((self.clock)()));

            let tailer = match FileTailer::open(&path, start).await {
                Ok(tailer) => tailer,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_secs = self.settings.retry_interval.as_secs_f64(),
                        "Failed to open log file, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.settings.retry_interval) => continue,
                    }
                }
            };

            match self.follow_generation(tailer, &mut shutdown).await {
                Generation::Rotated(path) => {
                    start = StartPosition::Beginning;
                    next = Some(path);
                }
                Generation::FollowerLost => {
                    // Resume at the end: re-reading the file would count its lines twice
                    start = StartPosition::End;
                }
                Generation::Shutdown => break,
            }
        }

        let closed = self.parser.reset();
        self.publish(closed);

        tracing::info!(
            lines = self.lines_read,
            discarded_records = self.parser.discarded(),
            "Log reader stopped"
        );
    }

    async fn follow_generation(
        &mut self,
        tailer: FileTailer,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Generation {
        let path = tailer.path().to_path_buf();
        tracing::info!(path = %path.display(), offset = tailer.offset(), "Following log file");

        let (line_tx, mut line_rx) = mpsc::channel(self.settings.queue_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let follower = tailer::spawn_follower(
            tailer,
            line_tx,
            self.settings.follow_interval,
            stop_rx,
        );
        let (mut rotation_rx, watcher) = watcher::spawn_rotation_watcher(
            path.clone(),
            self.resolver.clone(),
            self.clock.clone(),
            self.settings.poll_interval,
        );
        let mut limiter =
            RateLimiter::new(self.settings.rate_tokens, self.settings.rate_refill_interval);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break Generation::Shutdown,
                signal = &mut rotation_rx => match signal {
                    Ok(RotationSignal { path }) => break Generation::Rotated(path),
                    Err(_) => {
                        tracing::error!("Rotation watcher ended without a signal");
                        break Generation::FollowerLost;
                    }
                },
                line = line_rx.recv() => match line {
                    Some(line) => self.process_line(&mut limiter, &line).await,
                    None => {
                        tracing::error!(path = %path.display(), "Log follower ended unexpectedly");
                        break Generation::FollowerLost;
                    }
                },
            }
        };

        match &outcome {
            Generation::Rotated(_) => {
                // Let the follower read the old file to its end, then take everything it queued
                let _ = stop_tx.send(());
                while let Some(line) = line_rx.recv().await {
                    self.process_line(&mut limiter, &line).await;
                }
                let closed = self.parser.reset();
                self.publish(closed);
            }
            Generation::FollowerLost | Generation::Shutdown => {
                drop(stop_tx);
                drop(line_rx);
            }
        }
        drop(rotation_rx);

        if let Err(e) = follower.await {
            tracing::error!(error = %e, path = %path.display(), "Log follower task failed");
        }
        if let Err(e) = watcher.await {
            tracing::error!(error = %e, path = %path.display(), "Rotation watcher task failed");
        }

        tracing::debug!(
            path = %path.display(),
            waits = limiter.total_waits(),
            "Log file generation finished"
        );
        outcome
    }

    async fn process_line(&mut self, limiter: &mut RateLimiter, line: &str) {
        limiter.acquire().await;
        self.lines_read += 1;

        let events = self.parser.feed(line);
        self.publish(events);
    }

    fn publish(&self, events: Vec<LogEvent>) {
        for event in events {
            match &event {
                LogEvent::Query(query) => tracing::debug!(
                    database = %query.database,
                    query = %query.query_kind,
                    duration_ms = query.duration_ms,
                    "Query parsed"
                ),
                LogEvent::Error(error) => tracing::debug!(
                    database = %error.database,
                    kind = %error.error_kind,
                    "Error parsed"
                ),
                LogEvent::Malformed(malformed) => tracing::debug!(
                    database = %malformed.database,
                    query = %malformed.query_kind,
                    raw_duration = %malformed.raw_duration,
                    "Query record counted as parse error"
                ),
            }
            metrics::dispatch(self.sink.as_ref(), &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone, Utc};
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MetricsSink for RecordingSink {
        fn record_query(&self, database: &str, kind: QueryKind, duration_ms: f64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("query {} {} {}", database, kind, duration_ms));
        }

        fn record_error(&self, database: &str, kind: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("error {} {}", database, kind));
        }

        fn record_parse_error(&self, database: &str, kind: QueryKind) {
            self.events
                .lock()
                .unwrap()
                .push(format!("malformed {} {}", database, kind));
        }
    }

    fn settings(start_position: StartPosition) -> ReaderSettings {
        ReaderSettings {
            poll_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
            follow_interval: Duration::from_millis(10),
            queue_capacity: 16,
            rate_tokens: 1000,
            rate_refill_interval: Duration::from_secs(1),
            start_position,
        }
    }

    fn pipeline(dir: &Path, start: StartPosition, sink: Arc<RecordingSink>) -> Pipeline {
        let resolver = FilenameResolver::new(
            dir,
            "postgresql-%Y-%m-%d.log",
            FixedOffset::east_opt(0).unwrap(),
        )
        .unwrap();
        let clock_now: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Pipeline::new(resolver, LogFormat::stderr().unwrap(), settings(start), sink)
            .with_clock(Arc::new(move || clock_now))
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    async fn wait_for_events(sink: &RecordingSink, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let events = sink.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.events()
    }

    const QUERY_LINE: &str = "2024-01-01 12:00:00.100 UTC [42] db=app,user=postgres LOG:  duration: 12.50 ms  statement: SELECT 1\n";
    const ERROR_LINE: &str = "2024-01-01 12:00:01.000 UTC [42] db=app,user=postgres ERROR:  relation \"x\" does not exist\n";

    #[tokio::test]
    async fn test_counts_existing_and_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("postgresql-2024-01-01.log");
        append(&log, QUERY_LINE);

        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::Beginning, sink.clone()).spawn(shutdown_rx);

        assert_eq!(wait_for_events(&sink, 1).await, vec!["query app select 12.5"]);

        append(&log, ERROR_LINE);
        let events = wait_for_events(&sink, 2).await;
        assert_eq!(events[1], "error app error");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_at_end_skips_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("postgresql-2024-01-01.log");
        append(&log, QUERY_LINE);

        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::End, sink.clone()).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.events().is_empty());

        append(&log, ERROR_LINE);
        assert_eq!(wait_for_events(&sink, 1).await, vec!["error app error"]);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_until_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::Beginning, sink.clone()).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        append(&dir.path().join("postgresql-2024-01-01.log"), QUERY_LINE);

        assert_eq!(wait_for_events(&sink, 1).await, vec!["query app select 12.5"]);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::Beginning, sink).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pipeline should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_duration_reaches_sink_when_record_closes() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("postgresql-2024-01-01.log");
        append(
            &log,
            "2024-01-01 12:00:00 UTC [7] db=app LOG:  duration: 1,5x ms  statement: UPDATE t SET a = 1\n",
        );

        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::Beginning, sink.clone()).spawn(shutdown_rx);

        // A later line may still bring a valid duration
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.events().is_empty());

        append(&log, "2024-01-01 12:00:01 UTC [7] db=app LOG:  connection received\n");
        assert_eq!(wait_for_events(&sink, 1).await, vec!["malformed app update"]);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_record() {
        let dir = tempfile::tempdir().unwrap();
        append(
            &dir.path().join("postgresql-2024-01-01.log"),
            "2024-01-01 12:00:00 UTC [7] db=app LOG:  duration: oops ms  statement: DELETE FROM t\n",
        );

        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = pipeline(dir.path(), StartPosition::Beginning, sink.clone()).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(sink.events(), vec!["malformed app delete"]);
    }
}
