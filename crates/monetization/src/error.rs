//! Monetization error taxonomy

/// Result alias used throughout the monetization crate
pub type MonetizationResult<T> = Result<T, MonetizationError>;

#[derive(Debug, thiserror::Error)]
pub enum MonetizationError {
    #[error("Monthly free listing quota exceeded")]
    QuotaExceeded,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Caller does not own this listing")]
    NotOwner,

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Unsupported payment provider: {0}")]
    UnsupportedProvider(String),

    #[error("Unknown provider status: {0}")]
    UnknownStatus(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: i64, received: i64 },

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl MonetizationError {
    /// Errors that a webhook provider should not retry
    pub fn is_permanent(&self) -> bool {
        !matches!(self, MonetizationError::Database(_))
    }
}

impl From<sqlx::Error> for MonetizationError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            if db.is_unique_violation() {
                return MonetizationError::Conflict(
                    db.constraint().unwrap_or("unique constraint").to_string(),
                );
            }
        }
        MonetizationError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for MonetizationError {
    fn from(e: serde_json::Error) -> Self {
        MonetizationError::InvalidPayload(e.to_string())
    }
}
