//! Provider webhook reconciliation
//!
//! Applies a provider callback to payment, listing and quota state exactly
//! once. Deliveries are at-least-once and may be duplicated or reordered, so
//! the transaction id is the idempotency key: once the payment is terminal,
//! every later delivery for it is acknowledged without side effects.
//!
//! Every verified delivery is written to the webhook audit log with its
//! outcome so unmatched or suspicious callbacks stay visible to operators.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheInvalidator, CacheKey};
use crate::clock::Clock;
use crate::error::{MonetizationError, MonetizationResult};
use crate::listing::{Listing, LISTING_TTL};
use crate::payment::{Payment, PaymentLedger, PaymentStatus, PaymentTransition};
use crate::pricing::PricingPhaseStore;
use crate::providers::{CanonicalNotification, Provider, ProviderStatus};
use crate::signature::SignatureVerifier;
use crate::store::{MonetizationStore, SettleOutcome};

const DEFAULT_FAILURE_REASON: &str = "provider_failed";
const DEFAULT_CANCEL_REASON: &str = "provider_cancelled";

/// Audit classification of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Unmatched,
    UnknownStatus,
    AmountMismatch,
    Error,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Unmatched => "unmatched",
            WebhookOutcome::UnknownStatus => "unknown_status",
            WebhookOutcome::AmountMismatch => "amount_mismatch",
            WebhookOutcome::Error => "error",
        }
    }
}

impl WebhookOutcome {
    /// Audit classification of a failed delivery
    pub fn for_error(err: &MonetizationError) -> WebhookOutcome {
        match err {
            MonetizationError::PaymentNotFound(_) => WebhookOutcome::Unmatched,
            MonetizationError::UnknownStatus(_) => WebhookOutcome::UnknownStatus,
            MonetizationError::AmountMismatch { .. } => WebhookOutcome::AmountMismatch,
            _ => WebhookOutcome::Error,
        }
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookOutcome {
    type Err = MonetizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(WebhookOutcome::Processed),
            "duplicate" => Ok(WebhookOutcome::Duplicate),
            "unmatched" => Ok(WebhookOutcome::Unmatched),
            "unknown_status" => Ok(WebhookOutcome::UnknownStatus),
            "amount_mismatch" => Ok(WebhookOutcome::AmountMismatch),
            "error" => Ok(WebhookOutcome::Error),
            other => Err(MonetizationError::InvalidInput(format!(
                "unknown webhook outcome '{}'",
                other
            ))),
        }
    }
}

/// One row of the webhook audit log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub transaction_id: Option<String>,
    pub provider_status: Option<String>,
    pub outcome: WebhookOutcome,
    pub error_message: Option<String>,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// What a delivery did
#[derive(Debug, Clone)]
pub enum Reconciliation {
    /// Payment settled; `listing` is the listing it activated, if any
    Succeeded {
        payment: Payment,
        listing: Option<Listing>,
    },
    /// Payment moved to failed or cancelled; its listing keeps waiting
    Failed { payment: Payment },
    /// Payment was already final; nothing changed
    Duplicate { payment: Payment },
}

impl Reconciliation {
    pub fn payment(&self) -> &Payment {
        match self {
            Reconciliation::Succeeded { payment, .. }
            | Reconciliation::Failed { payment }
            | Reconciliation::Duplicate { payment } => payment,
        }
    }

    pub fn outcome(&self) -> WebhookOutcome {
        match self {
            Reconciliation::Duplicate { .. } => WebhookOutcome::Duplicate,
            _ => WebhookOutcome::Processed,
        }
    }
}

/// Whether the provider should be told the delivery was handled
///
/// Unmatched, unknown-status and mismatched deliveries are acknowledged so
/// the provider stops retrying; they are flagged in the audit log instead.
/// Only storage failures ask for a retry.
pub fn should_acknowledge(result: &MonetizationResult<Reconciliation>) -> bool {
    match result {
        Ok(_) => true,
        Err(
            MonetizationError::PaymentNotFound(_)
            | MonetizationError::UnknownStatus(_)
            | MonetizationError::AmountMismatch { .. },
        ) => true,
        Err(_) => false,
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn MonetizationStore>,
    pricing: PricingPhaseStore,
    payments: PaymentLedger,
    verifier: Arc<dyn SignatureVerifier>,
    cache: Arc<dyn CacheInvalidator>,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn MonetizationStore>,
        pricing: PricingPhaseStore,
        payments: PaymentLedger,
        verifier: Arc<dyn SignatureVerifier>,
        cache: Arc<dyn CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pricing,
            payments,
            verifier,
            cache,
            clock,
        }
    }

    /// Entry point for a raw HTTP delivery
    ///
    /// Signature verification happens before anything is parsed or looked
    /// up. Verified deliveries are audited whatever their outcome.
    pub async fn handle_delivery(
        &self,
        provider: &str,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> MonetizationResult<Reconciliation> {
        let provider: Provider = provider.parse().map_err(|e| {
            tracing::warn!(provider = %provider, "Webhook for unsupported provider");
            e
        })?;

        self.verifier.verify(provider, raw_body, signature)?;

        let notification = match provider.parse(raw_body) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Unparseable webhook payload");
                self.audit(provider, None, raw_body, WebhookOutcome::Error, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let result = self.reconcile(provider, notification.clone()).await;

        let (outcome, error_message) = match &result {
            Ok(r) => (r.outcome(), None),
            Err(e) => (WebhookOutcome::for_error(e), Some(e.to_string())),
        };
        self.audit(
            provider,
            Some(&notification),
            raw_body,
            outcome,
            error_message,
        )
        .await;

        result
    }

    /// Apply a canonical notification
    pub async fn reconcile(
        &self,
        provider: Provider,
        notification: CanonicalNotification,
    ) -> MonetizationResult<Reconciliation> {
        let transaction_id = notification.transaction_id.as_str();

        let payment = match self.payments.find_by_transaction_id(transaction_id).await? {
            Some(p) => p,
            None => {
                tracing::warn!(
                    provider = %provider,
                    transaction_id = %transaction_id,
                    "RECONCILIATION NEEDED: webhook for unknown transaction"
                );
                return Err(MonetizationError::PaymentNotFound(transaction_id.to_string()));
            }
        };

        if payment.method != provider.method() {
            tracing::warn!(
                provider = %provider,
                transaction_id = %transaction_id,
                payment_method = %payment.method,
                "RECONCILIATION NEEDED: webhook provider does not match payment method"
            );
            return Err(MonetizationError::PaymentNotFound(transaction_id.to_string()));
        }

        // Idempotency guard
        if payment.status.is_terminal() {
            let late_success = matches!(
                ProviderStatus::classify(&notification.status),
                Ok(ProviderStatus::Success)
            ) && payment.status != PaymentStatus::Success;

            if late_success {
                tracing::warn!(
                    payment_id = %payment.id,
                    transaction_id = %transaction_id,
                    status = %payment.status,
                    "RECONCILIATION NEEDED: provider reports success for a payment already {}",
                    payment.status
                );
            } else {
                tracing::debug!(
                    payment_id = %payment.id,
                    transaction_id = %transaction_id,
                    "Duplicate webhook delivery ignored"
                );
            }
            return Ok(Reconciliation::Duplicate { payment });
        }

        let status = ProviderStatus::classify(&notification.status).map_err(|e| {
            tracing::error!(
                payment_id = %payment.id,
                provider_status = %notification.status,
                "Unknown provider status; payment left pending"
            );
            e
        })?;

        match status {
            ProviderStatus::Success => self.settle(payment, notification.amount).await,
            ProviderStatus::Failed => {
                let reason = notification.reason.as_deref().unwrap_or(DEFAULT_FAILURE_REASON);
                let transition = self.payments.mark_failed(payment.id, reason).await?;
                Ok(self.after_failure(transition))
            }
            ProviderStatus::Cancelled => {
                let reason = notification.reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON);
                let transition = self.payments.mark_cancelled(payment.id, reason).await?;
                Ok(self.after_failure(transition))
            }
        }
    }

    /// Audit log, newest first
    pub async fn list_events(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> MonetizationResult<Vec<WebhookEvent>> {
        self.store
            .list_webhook_events(outcome, limit.clamp(1, 500))
            .await
    }

    async fn settle(
        &self,
        payment: Payment,
        amount: Option<i64>,
    ) -> MonetizationResult<Reconciliation> {
        if let Some(received) = amount {
            if received != payment.amount {
                tracing::error!(
                    payment_id = %payment.id,
                    expected = payment.amount,
                    received,
                    "RECONCILIATION NEEDED: webhook amount does not match payment"
                );
                return Err(MonetizationError::AmountMismatch {
                    expected: payment.amount,
                    received,
                });
            }
        }

        let config = self.pricing.config().await?;
        let now = self.clock.now();

        match self
            .store
            .settle_payment_success(
                payment.id,
                config.monthly_free_limit,
                now + LISTING_TTL,
                now,
            )
            .await?
        {
            SettleOutcome::AlreadyFinal(payment) => {
                tracing::debug!(
                    payment_id = %payment.id,
                    "Payment settled by a concurrent delivery"
                );
                Ok(Reconciliation::Duplicate { payment })
            }
            SettleOutcome::Settled { payment, activated } => {
                match (payment.listing_id, &activated) {
                    (Some(listing_id), Some(_)) => {
                        tracing::info!(
                            payment_id = %payment.id,
                            listing_id = %listing_id,
                            user_id = %payment.user_id,
                            "Payment settled, listing activated"
                        );
                        self.cache.invalidate(vec![
                            CacheKey::Listing(listing_id),
                            CacheKey::Quota(payment.user_id),
                        ]);
                    }
                    (Some(listing_id), None) => {
                        tracing::error!(
                            payment_id = %payment.id,
                            listing_id = %listing_id,
                            "RECONCILIATION NEEDED: paid listing is no longer awaiting payment; refund candidate"
                        );
                    }
                    (None, _) => {
                        tracing::info!(payment_id = %payment.id, "Payment settled");
                    }
                }
                Ok(Reconciliation::Succeeded {
                    payment,
                    listing: activated,
                })
            }
        }
    }

    fn after_failure(&self, transition: PaymentTransition) -> Reconciliation {
        match transition {
            PaymentTransition::Applied(payment) => Reconciliation::Failed { payment },
            PaymentTransition::AlreadyFinal(payment) => Reconciliation::Duplicate { payment },
        }
    }

    async fn audit(
        &self,
        provider: Provider,
        notification: Option<&CanonicalNotification>,
        raw_body: &[u8],
        outcome: WebhookOutcome,
        error_message: Option<String>,
    ) {
        let payload = serde_json::from_slice::<Value>(raw_body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw_body).into_owned()));

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            provider: provider.as_str().to_string(),
            transaction_id: notification.map(|n| n.transaction_id.clone()),
            provider_status: notification.map(|n| n.status.clone()),
            outcome,
            error_message,
            payload,
            received_at: self.clock.now(),
        };

        if let Err(e) = self.store.record_webhook_event(&event).await {
            tracing::warn!(
                provider = %provider,
                outcome = %outcome,
                error = %e,
                "Failed to write webhook audit record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parse() {
        assert_eq!(
            "unknown_status".parse::<WebhookOutcome>().unwrap(),
            WebhookOutcome::UnknownStatus
        );
        assert!("ok".parse::<WebhookOutcome>().is_err());
    }

    #[test]
    fn test_acknowledgement_policy() {
        assert!(should_acknowledge(&Err(MonetizationError::PaymentNotFound(
            "TRG-1".into()
        ))));
        assert!(should_acknowledge(&Err(MonetizationError::UnknownStatus(
            "processing".into()
        ))));
        assert!(should_acknowledge(&Err(MonetizationError::AmountMismatch {
            expected: 1000,
            received: 10
        })));

        assert!(!should_acknowledge(&Err(MonetizationError::SignatureInvalid)));
        assert!(!should_acknowledge(&Err(MonetizationError::InvalidPayload(
            "bad".into()
        ))));
        assert!(!should_acknowledge(&Err(MonetizationError::Database(
            "down".into()
        ))));
    }

    #[test]
    fn test_audit_outcome_mapping() {
        assert_eq!(
            WebhookOutcome::for_error(&MonetizationError::PaymentNotFound("x".into())),
            WebhookOutcome::Unmatched
        );
        assert_eq!(
            WebhookOutcome::for_error(&MonetizationError::Database("x".into())),
            WebhookOutcome::Error
        );
    }
}
