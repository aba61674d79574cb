use crate::api::AppState;
use crate::container::HealthReport;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

/// Dependency health. Answers 200 when everything is ok and 503 when degraded.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.container.health().await;

    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: String,
    pub version: String,
}

/// Process liveness, no dependency checks
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus metrics endpoint
///
/// Returns metrics in Prometheus text exposition format
pub async fn metrics() -> (StatusCode, String) {
    let metrics = crate::messaging::gather_metrics();
    (StatusCode::OK, metrics)
}
