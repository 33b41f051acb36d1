use anyhow::Result;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    handlers,
    ingest::Pipeline,
    metrics::{self, MetricsRegistry},
    signals::setup_signal_handlers,
};

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Start the exporter
///
/// This function:
/// 1. Builds the metric registry
/// 2. Sets up signal handlers for graceful shutdown
/// 3. Spawns the log pipeline
/// 4. Serves the metrics endpoint until shutdown
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let registry = Arc::new(MetricsRegistry::new(&config.metrics.buckets)?);
    let metrics_handle = Arc::new(registry.handle());
    let upkeep = metrics::spawn_upkeep(registry.handle(), UPKEEP_INTERVAL);

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let pipeline = Pipeline::from_config(&config, registry.clone())?;
    let pipeline_handle = pipeline.spawn(shutdown_tx.subscribe());

    let app = create_router(&config.metrics.endpoint, metrics_handle);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!(
        %addr,
        endpoint = %config.metrics.endpoint,
        "Serving metrics"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    // A server error exits before any signal; make sure the pipeline hears about it
    let _ = shutdown_tx.send(());
    if let Err(e) = pipeline_handle.await {
        error!(error = %e, "Log pipeline task failed");
    }
    upkeep.abort();
    signal_handle.abort();

    info!("Exporter stopped gracefully");
    Ok(())
}

/// Create the Axum router
fn create_router(endpoint: &str, metrics_handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(endpoint, get(handlers::metrics_handler::metrics))
        .with_state(metrics_handle)
        .layer(TraceLayer::new_for_http())
}
