use anyhow::Result;
use colored::Colorize;
use pg_query_exporter::{config::Config, server};
use tracing::info;

/// Execute the start command
///
/// Runs the log pipeline and the metrics server until SIGTERM/SIGINT.
pub async fn execute(cfg: Config) -> Result<()> {
    println!("{}", "Starting pg-query-exporter...".green());
    info!(
        directory = %cfg.log.directory.display(),
        pattern = %cfg.log.file_pattern,
        "Starting pg-query-exporter"
    );

    server::start_server(cfg).await?;

    Ok(())
}
