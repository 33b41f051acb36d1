use std::path::PathBuf;
use thiserror::Error;

/// Exporter error types
#[derive(Debug, Error)]
pub enum ExporterError {
    /// File could not be opened, stat'd or read
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A log format marker failed to compile
    #[error("Invalid pattern '{name}': {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },

    /// Timezone offset is not of the form `+HH:MM`
    #[error("Invalid timezone offset: {0}")]
    InvalidTimezone(String),

    /// File name template cannot produce a dated file name
    #[error("Invalid log file template: {0}")]
    InvalidFileTemplate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Prometheus recorder could not be built
    #[error("Metrics setup error: {0}")]
    MetricsSetup(String),
}

impl ExporterError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
