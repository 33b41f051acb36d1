use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Handle the metrics endpoint
pub async fn metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], metrics)
}
