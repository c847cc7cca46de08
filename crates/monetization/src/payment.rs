//! Payment ledger
//!
//! Records payment attempts and moves them through
//! `pending → {success, failed, cancelled}` and `success → refunded`.
//! Every transition is a conditional update on the current status, so
//! repeating a transition is a no-op that reports the existing final state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{MonetizationError, MonetizationResult};
use crate::gateway::{GatewayCheckout, PaymentGateway};
use crate::store::MonetizationStore;
use crate::sweeper::{SweepCounts, SWEEP_BATCH_SIZE};

/// Pending payments fail automatically after this long
pub const PAYMENT_TTL: Duration = Duration::minutes(30);

/// Upper bound on the gateway call made while a publish request is open
pub const CHECKOUT_TIMEOUT: StdDuration = StdDuration::from_secs(3);

/// Failure reason recorded by the timeout sweep
pub const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    OrangeMoney,
    Wave,
    FreeMoney,
    BankCard,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::OrangeMoney => "orange_money",
            PaymentMethod::Wave => "wave",
            PaymentMethod::FreeMoney => "free_money",
            PaymentMethod::BankCard => "bank_card",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = MonetizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orange_money" => Ok(PaymentMethod::OrangeMoney),
            "wave" => Ok(PaymentMethod::Wave),
            "free_money" => Ok(PaymentMethod::FreeMoney),
            "bank_card" => Ok(PaymentMethod::BankCard),
            other => Err(MonetizationError::InvalidInput(format!(
                "unknown payment method '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Anything but `pending` is final for webhook purposes
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Pending,
        PaymentStatus::Success,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
        PaymentStatus::Refunded,
    ];

    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        matches!(
            (self, to),
            (
                PaymentStatus::Pending,
                PaymentStatus::Success | PaymentStatus::Failed | PaymentStatus::Cancelled
            ) | (PaymentStatus::Success, PaymentStatus::Refunded)
        )
    }

    /// The only status that may move to `to`; every target has at most one
    pub fn source_of(to: PaymentStatus) -> Option<PaymentStatus> {
        PaymentStatus::ALL
            .into_iter()
            .find(|from| from.can_transition_to(to))
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = MonetizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(MonetizationError::Database(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub listing_id: Option<Uuid>,
    /// Idempotency key shared with the provider
    pub transaction_id: String,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub gateway_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Payment {
    /// A fresh pending payment with a locally generated transaction id
    pub fn new_pending(
        user_id: Uuid,
        listing_id: Option<Uuid>,
        amount: i64,
        currency: &str,
        method: PaymentMethod,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            listing_id,
            transaction_id: generate_transaction_id(),
            amount,
            currency: currency.to_string(),
            method,
            status: PaymentStatus::Pending,
            failure_reason: None,
            gateway_reference: None,
            expires_at: now + PAYMENT_TTL,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn generate_transaction_id() -> String {
    format!("TRG-{}", Uuid::new_v4().simple()).to_ascii_uppercase()
}

/// Result of a status transition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTransition {
    /// This call moved the payment
    Applied(Payment),
    /// The payment was already final; nothing changed
    AlreadyFinal(Payment),
}

impl PaymentTransition {
    pub fn payment(&self) -> &Payment {
        match self {
            PaymentTransition::Applied(p) | PaymentTransition::AlreadyFinal(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            PaymentTransition::Applied(p) | PaymentTransition::AlreadyFinal(p) => p,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, PaymentTransition::Applied(_))
    }
}

#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn MonetizationStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    checkout_timeout: StdDuration,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn MonetizationStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            checkout_timeout: CHECKOUT_TIMEOUT,
        }
    }

    pub fn with_checkout_timeout(mut self, timeout: StdDuration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Open a pending payment
    pub async fn open(
        &self,
        user_id: Uuid,
        listing_id: Option<Uuid>,
        amount: i64,
        currency: &str,
        method: PaymentMethod,
    ) -> MonetizationResult<Payment> {
        if amount < 0 {
            return Err(MonetizationError::InvalidInput(
                "payment amount must be >= 0".to_string(),
            ));
        }

        let payment = Payment::new_pending(
            user_id,
            listing_id,
            amount,
            currency,
            method,
            self.clock.now(),
        );
        self.store.insert_payment(&payment).await?;

        tracing::info!(
            payment_id = %payment.id,
            user_id = %user_id,
            listing_id = ?listing_id,
            transaction_id = %payment.transaction_id,
            amount,
            method = %method,
            "Payment opened"
        );

        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> MonetizationResult<Payment> {
        self.store
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| MonetizationError::PaymentNotFound(payment_id.to_string()))
    }

    /// Idempotency lookup used by webhook reconciliation
    pub async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> MonetizationResult<Option<Payment>> {
        self.store.find_payment_by_transaction(transaction_id).await
    }

    pub async fn mark_success(&self, payment_id: Uuid) -> MonetizationResult<PaymentTransition> {
        self.finish_pending(payment_id, PaymentStatus::Success, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> MonetizationResult<PaymentTransition> {
        self.finish_pending(payment_id, PaymentStatus::Failed, Some(reason))
            .await
    }

    pub async fn mark_cancelled(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> MonetizationResult<PaymentTransition> {
        self.finish_pending(payment_id, PaymentStatus::Cancelled, Some(reason))
            .await
    }

    /// Refund a successful payment
    pub async fn refund(&self, payment_id: Uuid, reason: &str) -> MonetizationResult<Payment> {
        match self
            .guarded_transition(payment_id, PaymentStatus::Refunded, Some(reason))
            .await?
        {
            Some(payment) => {
                tracing::info!(
                    payment_id = %payment_id,
                    amount = payment.amount,
                    reason = %reason,
                    "Payment refunded"
                );
                Ok(payment)
            }
            None => {
                let current = self.get(payment_id).await?;
                Err(MonetizationError::InvalidTransition(format!(
                    "cannot refund payment in status {}",
                    current.status
                )))
            }
        }
    }

    /// Fail every pending payment past its expiry with reason `timeout`
    pub async fn sweep_expired_pending(&self) -> MonetizationResult<SweepCounts> {
        let mut counts = SweepCounts::default();

        loop {
            let now = self.clock.now();
            let expired = self
                .store
                .expired_pending_payments(now, SWEEP_BATCH_SIZE)
                .await?;
            let batch_len = expired.len() as i64;
            let mut progressed = false;

            for payment in expired {
                match self.mark_failed(payment.id, TIMEOUT_REASON).await {
                    Ok(PaymentTransition::Applied(p)) => {
                        progressed = true;
                        counts.processed += 1;
                        tracing::info!(
                            payment_id = %p.id,
                            listing_id = ?p.listing_id,
                            "Pending payment timed out"
                        );
                    }
                    Ok(PaymentTransition::AlreadyFinal(_)) => {
                        progressed = true;
                    }
                    Err(e) => {
                        counts.failed += 1;
                        tracing::error!(
                            payment_id = %payment.id,
                            error = %e,
                            "Failed to time out pending payment"
                        );
                    }
                }
            }

            if batch_len < SWEEP_BATCH_SIZE || !progressed {
                break;
            }
        }

        Ok(counts)
    }

    /// Ask the gateway for a checkout reference
    ///
    /// Bounded by the checkout timeout. Failure is logged and swallowed: the
    /// payment stays pending under its transaction id, so a late checkout is
    /// still settled by the provider webhook.
    pub async fn initiate_checkout(&self, payment: &Payment) -> Option<GatewayCheckout> {
        let attempt = self.gateway.create_checkout(payment);
        let result = match tokio::time::timeout(self.checkout_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    transaction_id = %payment.transaction_id,
                    timeout_ms = self.checkout_timeout.as_millis() as u64,
                    "Payment gateway checkout timed out"
                );
                return None;
            }
        };

        match result {
            Ok(checkout) => {
                if let Err(e) = self
                    .store
                    .set_gateway_reference(payment.id, &checkout.reference)
                    .await
                {
                    tracing::warn!(
                        payment_id = %payment.id,
                        error = %e,
                        "Failed to store gateway reference"
                    );
                }
                Some(checkout)
            }
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment.id,
                    method = %payment.method,
                    error = %e,
                    "Payment gateway checkout failed"
                );
                None
            }
        }
    }

    async fn finish_pending(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        reason: Option<&str>,
    ) -> MonetizationResult<PaymentTransition> {
        if let Some(payment) = self.guarded_transition(payment_id, to, reason).await? {
            tracing::info!(
                payment_id = %payment_id,
                status = %to,
                reason = ?reason,
                "Payment status updated"
            );
            return Ok(PaymentTransition::Applied(payment));
        }

        let current = self.get(payment_id).await?;
        if current.status.is_terminal() {
            tracing::debug!(
                payment_id = %payment_id,
                status = %current.status,
                requested = %to,
                "Payment already final; transition ignored"
            );
            return Ok(PaymentTransition::AlreadyFinal(current));
        }

        Err(MonetizationError::InvalidTransition(format!(
            "payment {} could not move from {} to {}",
            payment_id, current.status, to
        )))
    }

    /// Conditional update from the table's source status for `to`
    async fn guarded_transition(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        reason: Option<&str>,
    ) -> MonetizationResult<Option<Payment>> {
        let from = PaymentStatus::source_of(to).ok_or_else(|| {
            MonetizationError::InvalidTransition(format!("no payment transition leads to {}", to))
        })?;
        self.store
            .transition_payment(payment_id, from, to, reason, self.clock.now())
            .await
    }
}
