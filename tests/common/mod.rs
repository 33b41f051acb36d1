#![allow(dead_code)]

use chrono::{DateTime, Utc};
use pg_query_exporter::ingest::{Clock, QueryKind};
use pg_query_exporter::metrics::MetricsSink;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 记录下来的一次 sink 调用
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Query {
        database: String,
        kind: QueryKind,
        duration_ms: f64,
    },
    Error {
        database: String,
        kind: String,
    },
    ParseError {
        database: String,
        kind: QueryKind,
    },
}

/// 按调用顺序保存事件的 sink
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    /// Durations of recorded queries, in call order
    pub fn query_durations(&self) -> Vec<f64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Recorded::Query { duration_ms, .. } => Some(duration_ms),
                _ => None,
            })
            .collect()
    }

    /// Poll until at least `count` calls were recorded or about two seconds pass
    pub async fn wait_for(&self, count: usize) -> Vec<Recorded> {
        for _ in 0..200 {
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls()
    }
}

impl MetricsSink for RecordingSink {
    fn record_query(&self, database: &str, kind: QueryKind, duration_ms: f64) {
        self.calls.lock().unwrap().push(Recorded::Query {
            database: database.to_string(),
            kind,
            duration_ms,
        });
    }

    fn record_error(&self, database: &str, kind: &str) {
        self.calls.lock().unwrap().push(Recorded::Error {
            database: database.to_string(),
            kind: kind.to_string(),
        });
    }

    fn record_parse_error(&self, database: &str, kind: QueryKind) {
        self.calls.lock().unwrap().push(Recorded::ParseError {
            database: database.to_string(),
            kind,
        });
    }
}

/// Clock whose time is moved by the test
pub fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
    let now = Arc::new(Mutex::new(start));
    let shared = now.clone();
    let clock: Clock = Arc::new(move || *shared.lock().unwrap());
    (clock, now)
}

pub fn append(path: &Path, content: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
}

/// Stderr-format line for a completed statement
pub fn query_line(database: &str, duration_ms: &str, statement: &str) -> String {
    format!(
        "2024-01-01 10:00:00.000 UTC [4242] db={},user=postgres LOG:  duration: {} ms  statement: {}\n",
        database, duration_ms, statement
    )
}

/// Value of the first sample of `metric` carrying every label in `labels`.
/// Histogram bucket lines are skipped.
pub fn sample_value(rendered: &str, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
    rendered.lines().find_map(|line| {
        let rest = line.strip_prefix(metric)?;
        if !(rest.starts_with('{') || rest.starts_with(' ')) || rest.contains("le=\"") {
            return None;
        }
        if !labels
            .iter()
            .all(|(k, v)| rest.contains(&format!("{}=\"{}\"", k, v)))
        {
            return None;
        }
        rest.rsplit(' ').next()?.parse().ok()
    })
}
