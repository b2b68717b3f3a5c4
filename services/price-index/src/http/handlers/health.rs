use axum::{extract::State, http::StatusCode, Json};

use crate::http::state::AppState;
use crate::service::HealthReport;

/// 200 while the snapshot store answers, 503 otherwise. A cache outage only
/// degrades the report.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.components.health().await;
    let status = if report.store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
