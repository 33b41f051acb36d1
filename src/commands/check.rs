use anyhow::Result;
use colored::Colorize;
use pg_query_exporter::config;
use pg_query_exporter::ingest::{FilenameResolver, LogFormat};
use std::path::Path;
use tracing::info;

/// Execute the check command
///
/// Validates the configuration and compiles the log format without starting
/// anything, then shows which file would be followed right now.
pub fn execute(path: &Path) -> Result<()> {
    println!("{}", "Checking configuration...".yellow());
    info!(path = %path.display(), "Loading and validating configuration");

    let cfg = config::load_config(path)?;
    let format = LogFormat::from_config(&cfg.log)?;
    let resolver = FilenameResolver::new(
        &cfg.log.directory,
        &cfg.log.file_pattern,
        cfg.log.timezone()?,
    )?;
    let current = resolver.resolve(chrono::Utc::now());

    println!("{}", "✓ Configuration check successful".green());
    println!();

    println!("{}", "Configuration Summary:".bold());
    println!("  {}: {}:{}", "Server".cyan(), cfg.server.host, cfg.server.port);
    println!("  {}: {}", "Metrics Endpoint".cyan(), cfg.metrics.endpoint);
    println!("  {}: {}", "Log Level".cyan(), cfg.server.log_level);
    println!();

    println!("  {}: {}", "Log Directory".cyan(), cfg.log.directory.display());
    println!("  {}: {}", "File Pattern".cyan(), cfg.log.file_pattern);
    println!("  {}: {}", "Timezone Offset".cyan(), cfg.log.timezone_offset);
    println!("  {}: {}", "Log Format".cyan(), format.name());
    let status = if current.is_file() {
        "present".green()
    } else {
        "missing".red()
    };
    println!("  {}: {} ({})", "Current File".cyan(), current.display(), status);
    println!();

    println!(
        "  {}: every {}s, retry after {}s",
        "Rotation Check".cyan(),
        cfg.ingest.poll_interval_secs,
        cfg.ingest.retry_interval_secs
    );
    println!(
        "  {}: {} lines per {}ms",
        "Rate Limit".cyan(),
        cfg.ingest.rate_limit.tokens,
        cfg.ingest.rate_limit.refill_interval_ms
    );

    info!("Configuration check completed successfully");
    Ok(())
}
