//! API error type and its HTTP rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use teranga_monetization::MonetizationError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Payment required: {0}")]
    PaymentRequired(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Bad gateway: {0}")]
    BadGateway(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MonetizationError> for ApiError {
    fn from(err: MonetizationError) -> Self {
        match err {
            MonetizationError::QuotaExceeded => ApiError::PaymentRequired(err.to_string()),
            MonetizationError::NotOwner => ApiError::Forbidden,
            MonetizationError::SignatureInvalid => ApiError::Unauthorized,
            MonetizationError::InvalidState { .. }
            | MonetizationError::InvalidTransition(_)
            | MonetizationError::AmountMismatch { .. }
            | MonetizationError::Conflict(_) => ApiError::Conflict(err.to_string()),
            MonetizationError::NotFound(_) | MonetizationError::PaymentNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            MonetizationError::InvalidDate(_)
            | MonetizationError::InvalidInput(_)
            | MonetizationError::InvalidPayload(_)
            | MonetizationError::UnknownStatus(_)
            | MonetizationError::UnsupportedProvider(_) => ApiError::Validation(err.to_string()),
            MonetizationError::Gateway(_) => ApiError::BadGateway(err.to_string()),
            MonetizationError::Database(_) | MonetizationError::Config(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details go to the log, not the client.
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::Forbidden => "Insufficient permissions".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monetization_error_status_mapping() {
        let cases = [
            (MonetizationError::QuotaExceeded, StatusCode::PAYMENT_REQUIRED),
            (MonetizationError::NotOwner, StatusCode::FORBIDDEN),
            (
                MonetizationError::InvalidState {
                    expected: "draft",
                    actual: "active".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                MonetizationError::InvalidTransition("x".into()),
                StatusCode::CONFLICT,
            ),
            (MonetizationError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                MonetizationError::PaymentNotFound("tx".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                MonetizationError::InvalidDate("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (MonetizationError::SignatureInvalid, StatusCode::UNAUTHORIZED),
            (
                MonetizationError::Database("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let label = err.to_string();
            assert_eq!(ApiError::from(err).status(), expected, "{}", label);
        }
    }

    #[test]
    fn test_internal_error_body_hides_detail() {
        let response = ApiError::Internal("connection reset by peer".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
