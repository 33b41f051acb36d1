pub mod health;
pub mod metrics_handler;
