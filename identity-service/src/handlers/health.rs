use service_core::axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::AppState;

/// Liveness. Stays 200 when identity services failed to start so the
/// process is not restarted in a loop over bad key material.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let identity = if state.identity.is_ready() {
        "ready"
    } else {
        "unavailable"
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": state.service_name,
            "identity": identity,
        })),
    )
}
