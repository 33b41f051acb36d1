//! Log line formats
//!
//! A format is the set of markers the parser looks for. Which set applies is
//! a deployment detail (it follows `log_line_prefix` and whether statements
//! are logged on one line), so formats are data rather than code.
//!
//! All patterns are matched against the lower-cased line.

use regex::Regex;

use crate::config::{FormatKind, LogConfig, PatternOverrides};
use crate::error::{ExporterError, Result};

const TIMESTAMP_START: &str = r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}";
const DATABASE: &str = r"\b(?:db|database)=([^\s,;@\[\]]+)";
const DURATION: &str = r"duration: (\S+) ms";
const ERROR_KIND: &str = r"\b(error|fatal|panic):\s";

/// Uncompiled marker set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPatterns {
    /// Opens (and resets) the query accumulator
    pub query_start: String,
    /// Opens (and resets) the error accumulator
    pub error_start: String,
    /// Capture 1: database name
    pub database: String,
    /// Capture 1: duration in milliseconds
    pub duration: String,
    /// Capture 1: select | insert | update | delete
    pub query_kind: String,
    /// Capture 1: error | fatal | panic
    pub error_kind: String,
    /// Records never continue past the line that started them
    pub self_contained: bool,
}

impl MarkerPatterns {
    /// PostgreSQL stderr output with a timestamped `log_line_prefix`.
    /// Statements may continue on indented lines.
    pub fn stderr() -> Self {
        Self {
            query_start: TIMESTAMP_START.to_string(),
            error_start: TIMESTAMP_START.to_string(),
            database: DATABASE.to_string(),
            duration: DURATION.to_string(),
            query_kind: r"(?:statement:\s+|execute [^:]*:\s+|^\s+)(select|insert|update|delete)\b"
                .to_string(),
            error_kind: ERROR_KIND.to_string(),
            self_contained: false,
        }
    }

    /// `log_min_duration_statement` lines carrying duration and statement together
    pub fn single_line() -> Self {
        Self {
            query_start: r"duration: \S+ ms\s+(?:statement|execute [^:]*):".to_string(),
            error_start: ERROR_KIND.to_string(),
            database: DATABASE.to_string(),
            duration: DURATION.to_string(),
            query_kind: r"(?:statement|execute [^:]*):\s+(select|insert|update|delete)\b"
                .to_string(),
            error_kind: ERROR_KIND.to_string(),
            self_contained: true,
        }
    }

    /// Replace markers with any configured overrides
    pub fn with_overrides(mut self, overrides: &PatternOverrides) -> Self {
        let pairs = [
            (&mut self.query_start, &overrides.query_start),
            (&mut self.error_start, &overrides.error_start),
            (&mut self.database, &overrides.database),
            (&mut self.duration, &overrides.duration),
            (&mut self.query_kind, &overrides.query_kind),
            (&mut self.error_kind, &overrides.error_kind),
        ];
        for (slot, value) in pairs {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        self
    }

    pub fn compile(&self, name: impl Into<String>) -> Result<LogFormat> {
        Ok(LogFormat {
            name: name.into(),
            query_start: compile("query_start", &self.query_start)?,
            error_start: compile("error_start", &self.error_start)?,
            database: compile_capturing("database", &self.database)?,
            duration: compile_capturing("duration", &self.duration)?,
            query_kind: compile_capturing("query_kind", &self.query_kind)?,
            error_kind: compile_capturing("error_kind", &self.error_kind)?,
            self_contained: self.self_contained,
        })
    }
}

fn compile(name: &'static str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| ExporterError::InvalidPattern { name, source })
}

fn compile_capturing(name: &'static str, pattern: &str) -> Result<Regex> {
    let regex = compile(name, pattern)?;
    if regex.captures_len() < 2 {
        return Err(ExporterError::Config(format!(
            "pattern '{}' for {} needs a capture group",
            pattern, name
        )));
    }
    Ok(regex)
}

/// Compiled marker set used by the parser
#[derive(Debug, Clone)]
pub struct LogFormat {
    name: String,
    pub(crate) query_start: Regex,
    pub(crate) error_start: Regex,
    pub(crate) database: Regex,
    pub(crate) duration: Regex,
    pub(crate) query_kind: Regex,
    pub(crate) error_kind: Regex,
    pub(crate) self_contained: bool,
}

impl LogFormat {
    pub fn stderr() -> Result<Self> {
        MarkerPatterns::stderr().compile("stderr")
    }

    pub fn single_line() -> Result<Self> {
        MarkerPatterns::single_line().compile("single_line")
    }

    /// Build the format selected in `[log]`, applying `[log.patterns]` overrides
    pub fn from_config(log: &LogConfig) -> Result<Self> {
        let (name, base) = match log.format {
            FormatKind::Stderr => ("stderr", MarkerPatterns::stderr()),
            FormatKind::SingleLine => ("single_line", MarkerPatterns::single_line()),
            FormatKind::Custom => ("custom", MarkerPatterns::stderr()),
        };
        base.with_overrides(&log.patterns).compile(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
