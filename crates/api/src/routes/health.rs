use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.monetization.pricing.current_phase().await {
        Ok(phase) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "phase": phase.as_str()
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check could not read pricing config");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
    }
}
