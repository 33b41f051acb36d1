use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use pg_query_exporter::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    // Non-server commands keep the console quiet unless --debug is given
    let quiet_level = if args.debug { "debug" } else { "warn" };

    match args.get_command() {
        cli::Commands::Start => {
            // Logging settings live in the config file, so it is loaded first
            let cfg = config::load_config(&args.config)?;
            let level = if args.debug {
                "debug"
            } else {
                cfg.server.log_level.as_str()
            };
            init_tracing(level, cfg.server.log_format == "json");

            commands::start::execute(cfg).await?;
        }
        cli::Commands::Check => {
            init_tracing(quiet_level, false);
            commands::check::execute(&args.config)?;
        }
        cli::Commands::Config { action } => {
            init_tracing(quiet_level, false);
            match action {
                cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            }
        }
        cli::Commands::Version => {
            println!("pg-query-exporter v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
