use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `PG_QUERY_EXPORTER__LOG__DIRECTORY`
pub const ENV_PREFIX: &str = "PG_QUERY_EXPORTER";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub log: LogConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Directory PostgreSQL writes its log files into
    pub directory: PathBuf,
    /// strftime pattern for the daily file name
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    /// Offset applied to UTC before formatting the file name (`+07:00`, `-03:30`, `7h`)
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset: String,
    #[serde(default)]
    pub format: FormatKind,
    #[serde(default)]
    pub start_position: StartPosition,
    #[serde(default)]
    pub patterns: PatternOverrides,
}

fn default_file_pattern() -> String {
    "postgresql-%Y-%m-%d.log".to_string()
}

fn default_timezone_offset() -> String {
    "+00:00".to_string()
}

impl LogConfig {
    pub fn timezone(&self) -> anyhow::Result<FixedOffset> {
        parse_timezone_offset(&self.timezone_offset)
    }
}

/// Which built-in marker set the parser uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// Multi-line records started by a timestamp prefix
    #[default]
    Stderr,
    /// One self-contained line per query
    SingleLine,
    /// All markers come from `[log.patterns]`
    Custom,
}

/// Where to begin reading the first file the process opens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    Beginning,
    End,
}

/// Regex overrides for individual markers (matched against lower-cased lines)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PatternOverrides {
    pub query_start: Option<String>,
    pub error_start: Option<String>,
    pub database: Option<String>,
    pub duration: Option<String>,
    pub query_kind: Option<String>,
    pub error_kind: Option<String>,
}

impl PatternOverrides {
    fn missing(&self) -> Vec<&'static str> {
        let fields = [
            ("query_start", &self.query_start),
            ("error_start", &self.error_start),
            ("database", &self.database),
            ("duration", &self.duration),
            ("query_kind", &self.query_kind),
            ("error_kind", &self.error_kind),
        ];
        fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How often the rotation watcher re-resolves the file name
    pub poll_interval_secs: u64,
    /// Wait between attempts to open a missing log file
    pub retry_interval_secs: u64,
    /// How often the follower checks the open file for appended bytes
    pub follow_interval_ms: u64,
    /// Lines buffered between the follower and the parser
    pub queue_capacity: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            retry_interval_secs: 60,
            follow_interval_ms: 250,
            queue_capacity: 1024,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn follow_interval(&self) -> Duration {
        Duration::from_millis(self.follow_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Lines allowed per refill interval (also the burst size)
    pub tokens: u32,
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens: 1000,
            refill_interval_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub endpoint: String,
    /// Histogram bucket upper bounds, in seconds
    pub buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            endpoint: "/metrics".to_string(),
            buckets: vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        }
    }
}

/// Load configuration from an optional TOML file overlaid with environment variables
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    build_config(builder)
}

/// Parse configuration from TOML text (no environment overlay)
pub fn parse_config(toml_text: &str) -> anyhow::Result<Config> {
    let builder = config::Config::builder()
        .add_source(config::File::from_str(toml_text, config::FileFormat::Toml));

    build_config(builder)
}

fn build_config(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> anyhow::Result<Config> {
    let config = builder.build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.log.directory.as_os_str().is_empty() {
        anyhow::bail!("log.directory cannot be empty");
    }

    if !has_date_specifier(&cfg.log.file_pattern) {
        anyhow::bail!(
            "log.file_pattern '{}' has no date specifier, the file would never rotate",
            cfg.log.file_pattern
        );
    }

    cfg.log.timezone()?;

    if cfg.log.format == FormatKind::Custom {
        let missing = cfg.log.patterns.missing();
        if !missing.is_empty() {
            anyhow::bail!(
                "log.format = \"custom\" requires log.patterns.{}",
                missing.join(", log.patterns.")
            );
        }
    }

    if cfg.ingest.poll_interval_secs == 0 {
        anyhow::bail!("ingest.poll_interval_secs must be greater than 0");
    }
    if cfg.ingest.retry_interval_secs == 0 {
        anyhow::bail!("ingest.retry_interval_secs must be greater than 0");
    }
    if cfg.ingest.follow_interval_ms == 0 {
        anyhow::bail!("ingest.follow_interval_ms must be greater than 0");
    }
    if cfg.ingest.queue_capacity == 0 {
        anyhow::bail!("ingest.queue_capacity must be greater than 0");
    }
    if cfg.ingest.rate_limit.tokens == 0 || cfg.ingest.rate_limit.refill_interval_ms == 0 {
        anyhow::bail!("ingest.rate_limit tokens and refill_interval_ms must be greater than 0");
    }

    if cfg.metrics.buckets.is_empty() {
        anyhow::bail!("metrics.buckets cannot be empty");
    }
    if cfg.metrics.buckets.windows(2).any(|w| w[0] >= w[1]) {
        anyhow::bail!("metrics.buckets must be strictly increasing");
    }
    if !cfg.metrics.endpoint.starts_with('/') {
        anyhow::bail!("metrics.endpoint must start with '/'");
    }

    Ok(())
}

fn has_date_specifier(pattern: &str) -> bool {
    ["%Y", "%y", "%m", "%d", "%e", "%F", "%j", "%D"]
        .iter()
        .any(|spec| pattern.contains(spec))
}

/// Parse a timezone offset given either as `+HH:MM` or as a signed duration
/// made of hour/minute/second components (`7h`, `-3h30m`, `30m`, `0h`)
pub fn parse_timezone_offset(value: &str) -> anyhow::Result<FixedOffset> {
    let value = value.trim();

    if let Some(secs) = parse_duration_secs(value) {
        return i32::try_from(secs)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| anyhow::anyhow!("Timezone offset out of range: {}", value));
    }

    value
        .parse::<FixedOffset>()
        .map_err(|e| anyhow::anyhow!("Invalid timezone offset '{}': {}", value, e))
}

/// Whole seconds of a duration such as `5h30m`, `-1.5h` or `90s`.
/// Returns `None` unless the entire input is made of such components.
fn parse_duration_secs(value: &str) -> Option<i64> {
    let (sign, body) = match value.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, value.strip_prefix('+').unwrap_or(value)),
    };
    if body == "0" {
        return Some(0);
    }

    let component = regex::Regex::new(r"(\d+(?:\.\d*)?|\.\d+)([hms])").ok()?;
    let mut consumed = 0;
    let mut total = 0.0;
    for caps in component.captures_iter(body) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let amount: f64 = caps[1].parse().ok()?;
        total += amount
            * match &caps[2] {
                "h" => 3600.0,
                "m" => 60.0,
                _ => 1.0,
            };
    }
    if consumed == 0 || consumed != body.len() {
        return None;
    }

    let secs = sign * total;
    if secs.fract() != 0.0 {
        return None;
    }
    Some(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[log]
directory = "/var/log/postgresql"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();

        assert_eq!(cfg.server.port, 9080);
        assert_eq!(cfg.log.file_pattern, "postgresql-%Y-%m-%d.log");
        assert_eq!(cfg.log.format, FormatKind::Stderr);
        assert_eq!(cfg.log.start_position, StartPosition::Beginning);
        assert_eq!(cfg.ingest.poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.ingest.rate_limit.tokens, 1000);
        assert_eq!(cfg.metrics.endpoint, "/metrics");
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let result = parse_config("[server]\nport = 9000\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_pattern_without_date_is_rejected() {
        let text = r#"
[log]
directory = "/var/log/postgresql"
file_pattern = "postgresql.log"
"#;
        let result = parse_config(text);
        assert!(result.unwrap_err().to_string().contains("no date specifier"));
    }

    #[test]
    fn test_custom_format_requires_patterns() {
        let text = r#"
[log]
directory = "/var/log/postgresql"
format = "custom"

[log.patterns]
database = "db=(\\w+)"
"#;
        let err = parse_config(text).unwrap_err().to_string();
        assert!(err.contains("log.patterns.query_start"));
        assert!(!err.contains("log.patterns.database"));
    }

    #[test]
    fn test_zero_rate_limit_is_rejected() {
        let text = r#"
[log]
directory = "/var/log/postgresql"

[ingest.rate_limit]
tokens = 0
"#;
        assert!(parse_config(text).is_err());
    }

    #[test]
    fn test_unsorted_buckets_are_rejected() {
        let text = r#"
[log]
directory = "/var/log/postgresql"

[metrics]
buckets = [1.0, 0.5]
"#;
        assert!(parse_config(text).is_err());
    }

    #[test]
    fn test_parse_timezone_offset() {
        assert_eq!(
            parse_timezone_offset("+07:00").unwrap(),
            FixedOffset::east_opt(7 * 3600).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("-03:30").unwrap(),
            FixedOffset::west_opt(3 * 3600 + 1800).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("0h").unwrap(),
            FixedOffset::east_opt(0).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("-5h").unwrap(),
            FixedOffset::west_opt(5 * 3600).unwrap()
        );
        assert!(parse_timezone_offset("soon").is_err());
        assert!(parse_timezone_offset("30h").is_err());
    }

    #[test]
    fn test_parse_timezone_offset_duration_components() {
        assert_eq!(
            parse_timezone_offset("30m").unwrap(),
            FixedOffset::east_opt(1800).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("5h30m").unwrap(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("-3h30m").unwrap(),
            FixedOffset::west_opt(3 * 3600 + 1800).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("1.5h").unwrap(),
            FixedOffset::east_opt(5400).unwrap()
        );
        assert_eq!(
            parse_timezone_offset("0").unwrap(),
            FixedOffset::east_opt(0).unwrap()
        );
        assert!(parse_timezone_offset("5h 30m").is_err());
        assert!(parse_timezone_offset("5ms").is_err());
        assert!(parse_timezone_offset("h").is_err());
    }
}
