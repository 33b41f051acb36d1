//! Time-derived log file naming.
//!
//! PostgreSQL's `log_filename` is a strftime pattern, so "today's" file is a
//! pure function of the wall clock, the configured offset and that pattern.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, Utc};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ExporterError, Result};

/// Source of "now". Shared between the reader and each generation's watcher.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Resolves the path of the log file PostgreSQL is writing at a given instant
#[derive(Debug, Clone)]
pub struct FilenameResolver {
    directory: PathBuf,
    file_pattern: String,
    offset: FixedOffset,
}

impl FilenameResolver {
    /// Build a resolver, rejecting patterns chrono cannot format
    pub fn new(
        directory: impl Into<PathBuf>,
        file_pattern: impl Into<String>,
        offset: FixedOffset,
    ) -> Result<Self> {
        let file_pattern = file_pattern.into();

        if file_pattern.is_empty() {
            return Err(ExporterError::InvalidFileTemplate(
                "file pattern is empty".to_string(),
            ));
        }
        if StrftimeItems::new(&file_pattern).any(|item| matches!(item, Item::Error)) {
            return Err(ExporterError::InvalidFileTemplate(format!(
                "'{}' contains an unsupported format specifier",
                file_pattern
            )));
        }

        Ok(Self {
            directory: directory.into(),
            file_pattern,
            offset,
        })
    }

    /// Path of the file for instant `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> PathBuf {
        resolve_path(now, self.offset, &self.directory, &self.file_pattern)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Format `directory/pattern` at `now` shifted by `offset`.
///
/// Patterns are validated in [`FilenameResolver::new`]; should formatting still
/// fail, the raw pattern is used as the file name.
pub fn resolve_path(
    now: DateTime<Utc>,
    offset: FixedOffset,
    directory: &Path,
    file_pattern: &str,
) -> PathBuf {
    let local = now.with_timezone(&offset);

    let mut name = String::with_capacity(file_pattern.len() + 8);
    if write!(name, "{}", local.format(file_pattern)).is_err() {
        name = file_pattern.to_string();
    }

    directory.join(name)
}
