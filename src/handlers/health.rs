use axum::{http::StatusCode, response::IntoResponse};

/// Liveness probe
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
