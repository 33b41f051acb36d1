//! Command implementations for the CLI
//!
//! - start: Follow the log and serve metrics
//! - check: Validate configuration and resolve the current log file
//! - config: Configuration display

pub mod check;
pub mod config;
pub mod start;
