//! Payment gateway client
//!
//! Opening a payment asks the gateway for a checkout reference and redirect
//! URL. Completion never comes back on this path; it arrives later through the
//! provider webhook.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{MonetizationError, MonetizationResult};
use crate::payment::Payment;

/// Reference returned by the gateway for a newly opened payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCheckout {
    pub reference: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + fmt::Debug {
    async fn create_checkout(&self, payment: &Payment) -> MonetizationResult<GatewayCheckout>;
}

/// Used when no gateway is configured; every checkout fails
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_checkout(&self, _payment: &Payment) -> MonetizationResult<GatewayCheckout> {
        Err(MonetizationError::Gateway(
            "payment gateway is not configured".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct CheckoutRequest<'a> {
    transaction_id: &'a str,
    amount: i64,
    currency: &'a str,
    method: &'a str,
}

enum AttemptError {
    Transient(String),
    Permanent(String),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }
}

/// HTTP checkout client with bounded exponential retry on transient errors
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: usize,
}

impl fmt::Debug for HttpPaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPaymentGateway")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> MonetizationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonetizationError::Config(format!("failed to build gateway client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
            max_retries: 3,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn attempt(&self, payment: &Payment) -> Result<GatewayCheckout, AttemptError> {
        let body = CheckoutRequest {
            transaction_id: &payment.transaction_id,
            amount: payment.amount,
            currency: &payment.currency,
            method: payment.method.as_str(),
        };

        let mut request = self.client.post(self.endpoint("checkouts")).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Transient(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Permanent(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        response
            .json::<GatewayCheckout>()
            .await
            .map_err(|e| AttemptError::Permanent(format!("invalid gateway response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_checkout(&self, payment: &Payment) -> MonetizationResult<GatewayCheckout> {
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::spawn(
            strategy,
            || self.attempt(payment),
            |e: &AttemptError| e.is_transient(),
        )
        .await;

        match result {
            Ok(checkout) => {
                tracing::debug!(
                    payment_id = %payment.id,
                    reference = %checkout.reference,
                    "Gateway checkout created"
                );
                Ok(checkout)
            }
            Err(AttemptError::Transient(msg)) | Err(AttemptError::Permanent(msg)) => {
                Err(MonetizationError::Gateway(msg))
            }
        }
    }
}
