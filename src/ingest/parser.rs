//! Log event parser
//!
//! Turns raw lines into [`LogEvent`]s. A logical record may span several
//! lines, so query and error records are each assembled in their own
//! accumulator:
//!
//! - a start marker closes whatever the accumulator held and opens a new record
//! - field markers fill the open record (first value wins)
//! - once all required fields are present the record is emitted and the
//!   accumulator goes back to `Empty`
//!
//! Fields seen while no record is open are ignored, so a partial record is
//! never emitted and a completed one is never emitted twice.
//!
//! A duration that does not parse counts as not supplied: a later valid
//! duration can still complete the record. If the record closes without one
//! while holding database and kind, it is emitted as [`LogEvent::Malformed`].

use super::event::{ErrorEvent, LogEvent, MalformedQuery, QueryEvent, QueryKind};
use super::format::LogFormat;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFields {
    pub database: Option<String>,
    pub duration_ms: Option<f64>,
    pub query_kind: Option<QueryKind>,
    /// First duration text that was not a non-negative number
    pub malformed_duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub database: Option<String>,
    pub error_kind: Option<String>,
}

/// In-progress record
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Accumulator<F> {
    /// No record open
    #[default]
    Empty,
    /// Record open, some fields possibly missing
    Partial(F),
}

impl<F: Default + PartialEq> Accumulator<F> {
    /// Open a new record, returning the previous one if it held any field
    fn start(&mut self) -> Option<F> {
        match std::mem::replace(self, Self::Partial(F::default())) {
            Self::Partial(stale) if stale != F::default() => Some(stale),
            _ => None,
        }
    }

    /// Close the record without opening another, returning it if it held any field
    fn close(&mut self) -> Option<F> {
        match std::mem::take(self) {
            Self::Partial(stale) if stale != F::default() => Some(stale),
            _ => None,
        }
    }

    fn fields_mut(&mut self) -> Option<&mut F> {
        match self {
            Self::Partial(fields) => Some(fields),
            Self::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Take the open record if `ready` says it is complete
    fn take_if(&mut self, ready: impl Fn(&F) -> bool) -> Option<F> {
        let complete = match self {
            Self::Partial(fields) => ready(fields),
            Self::Empty => false,
        };
        if !complete {
            return None;
        }
        match std::mem::take(self) {
            Self::Partial(fields) => Some(fields),
            Self::Empty => None,
        }
    }
}

impl QueryFields {
    fn is_complete(&self) -> bool {
        self.database.is_some() && self.duration_ms.is_some() && self.query_kind.is_some()
    }

    /// Holds something beyond the database name, which every prefix line carries
    fn has_content(&self) -> bool {
        self.duration_ms.is_some() || self.query_kind.is_some() || self.malformed_duration.is_some()
    }

    fn into_event(self) -> Option<LogEvent> {
        Some(LogEvent::Query(QueryEvent {
            database: self.database?,
            query_kind: self.query_kind?,
            duration_ms: self.duration_ms?,
        }))
    }

    /// Parse-error event for a record closing with only an unusable duration
    fn into_malformed(self) -> Result<LogEvent, Self> {
        match self {
            QueryFields {
                database: Some(database),
                duration_ms: None,
                query_kind: Some(query_kind),
                malformed_duration: Some(raw_duration),
            } => Ok(LogEvent::Malformed(MalformedQuery {
                database,
                query_kind,
                raw_duration,
            })),
            other => Err(other),
        }
    }
}

impl ErrorFields {
    fn is_complete(&self) -> bool {
        self.database.is_some() && self.error_kind.is_some()
    }

    fn has_content(&self) -> bool {
        self.error_kind.is_some()
    }

    fn into_event(self) -> Option<LogEvent> {
        Some(LogEvent::Error(ErrorEvent {
            database: self.database?,
            error_kind: self.error_kind?,
        }))
    }
}

/// Stateful line parser. Owned by a single ingestion loop.
#[derive(Debug)]
pub struct LogParser {
    format: LogFormat,
    query: Accumulator<QueryFields>,
    error: Accumulator<ErrorFields>,
    discarded: u64,
}

impl LogParser {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            query: Accumulator::Empty,
            error: Accumulator::Empty,
            discarded: 0,
        }
    }

    /// Consume one raw line, returning the records it completed
    pub fn feed(&mut self, raw: &str) -> Vec<LogEvent> {
        let line = raw.to_lowercase();
        let mut events = Vec::new();

        if self.format.query_start.is_match(&line) {
            if let Some(stale) = self.query.start() {
                self.close_query(stale, &mut events);
            }
        }
        if self.format.error_start.is_match(&line) {
            if let Some(stale) = self.error.start() {
                self.close_error(stale);
            }
        }

        if let Some(fields) = self.query.fields_mut() {
            fill_query(&self.format, &line, fields);
        }
        if let Some(fields) = self.error.fields_mut() {
            fill_error(&self.format, &line, fields);
        }

        if let Some(event) = self
            .query
            .take_if(QueryFields::is_complete)
            .and_then(QueryFields::into_event)
        {
            events.push(event);
        }
        if let Some(event) = self
            .error
            .take_if(ErrorFields::is_complete)
            .and_then(ErrorFields::into_event)
        {
            events.push(event);
        }

        if self.format.self_contained {
            self.close_open(&mut events);
        }

        events
    }

    /// Close any open records (used when switching files or stopping).
    /// Returns the parse-error events they turn into.
    pub fn reset(&mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        self.close_open(&mut events);
        events
    }

    pub fn format_name(&self) -> &str {
        self.format.name()
    }

    /// Number of incomplete records dropped, not counting error records that
    /// held nothing but the line prefix
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn query_state(&self) -> &Accumulator<QueryFields> {
        &self.query
    }

    pub fn error_state(&self) -> &Accumulator<ErrorFields> {
        &self.error
    }

    fn close_open(&mut self, events: &mut Vec<LogEvent>) {
        if let Some(stale) = self.query.close() {
            self.close_query(stale, events);
        }
        if let Some(stale) = self.error.close() {
            self.close_error(stale);
        }
    }

    fn close_query(&mut self, stale: QueryFields, events: &mut Vec<LogEvent>) {
        match stale.into_malformed() {
            Ok(event) => events.push(event),
            Err(stale) if stale.has_content() => {
                self.discarded += 1;
                tracing::trace!(?stale, "Discarding incomplete query record");
            }
            Err(_) => {}
        }
    }

    fn close_error(&mut self, stale: ErrorFields) {
        if stale.has_content() {
            self.discarded += 1;
            tracing::trace!(?stale, "Discarding incomplete error record");
        }
    }
}

fn capture<'a>(regex: &regex::Regex, line: &'a str) -> Option<&'a str> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn fill_query(format: &LogFormat, line: &str, fields: &mut QueryFields) {
    if fields.database.is_none() {
        if let Some(database) = capture(&format.database, line) {
            fields.database = Some(database.to_string());
        }
    }

    if fields.duration_ms.is_none() {
        if let Some(raw) = capture(&format.duration, line) {
            match parse_duration(raw) {
                Some(ms) => fields.duration_ms = Some(ms),
                None if fields.malformed_duration.is_none() => {
                    fields.malformed_duration = Some(raw.to_string());
                }
                None => {}
            }
        }
    }

    if fields.query_kind.is_none() {
        fields.query_kind = capture(&format.query_kind, line).and_then(QueryKind::from_keyword);
    }
}

fn fill_error(format: &LogFormat, line: &str, fields: &mut ErrorFields) {
    if fields.database.is_none() {
        if let Some(database) = capture(&format.database, line) {
            fields.database = Some(database.to_string());
        }
    }

    if fields.error_kind.is_none() {
        if let Some(kind) = capture(&format.error_kind, line) {
            fields.error_kind = Some(kind.to_string());
        }
    }
}

/// Milliseconds, or `None` (with a warning) for anything but a non-negative number
fn parse_duration(raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms >= 0.0 => Some(ms),
        Ok(ms) => {
            tracing::warn!(duration = ms, "Duration out of range, skipping observation");
            None
        }
        Err(e) => {
            tracing::warn!(duration = raw, error = %e, "Failed to parse duration, skipping observation");
            None
        }
    }
}
