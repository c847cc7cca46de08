//! Provider webhook endpoint
//!
//! Providers retry anything that is not a 2xx. Deliveries that can never
//! succeed on retry (unmatched transaction, unknown status, amount mismatch)
//! are acknowledged and left in the audit log for operators; only signature,
//! payload and storage failures are rejected.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use teranga_monetization::{should_acknowledge, WebhookOutcome, SIGNATURE_HEADER};

use crate::{error::ApiError, state::AppState};

/// POST /payments/webhook/{provider}
pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let result = state
        .monetization
        .webhooks
        .handle_delivery(&provider, &body, signature)
        .await;

    if should_acknowledge(&result) {
        let outcome = match &result {
            Ok(reconciliation) => reconciliation.outcome(),
            Err(e) => WebhookOutcome::for_error(e),
        };
        return (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "outcome": outcome.as_str()
            })),
        )
            .into_response();
    }

    match result {
        Err(e) => {
            tracing::warn!(provider = %provider, error = %e, "Webhook delivery rejected");
            ApiError::from(e).into_response()
        }
        Ok(_) => StatusCode::OK.into_response(),
    }
}
