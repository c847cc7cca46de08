//! Persistence boundary
//!
//! Every mutation on [`MonetizationStore`] is a guarded conditional update:
//! the write only happens if the row is still in the expected state, and the
//! caller learns whether it did. The three combined operations
//! (`publish_free`, `open_listing_payment`, `settle_payment_success`) run in a
//! single transaction so a partial failure leaves nothing behind.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::MonetizationResult;
use crate::listing::{Listing, ListingStatus};
use crate::payment::{Payment, PaymentStatus};
use crate::pricing::{Phase, PricingConfig};
use crate::quota::{PeriodKey, QuotaPeriod};
use crate::webhooks::{WebhookEvent, WebhookOutcome};

/// Result of [`MonetizationStore::publish_free`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishFreeOutcome {
    Published(Listing),
    /// The cap was hit; nothing was written
    QuotaExhausted,
    /// The listing was not an owned draft any more; nothing was written
    ListingNotDraft,
}

/// Result of [`MonetizationStore::settle_payment_success`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Payment was no longer pending; nothing was written
    AlreadyFinal(Payment),
    Settled {
        payment: Payment,
        /// Listing activated by this settlement. `None` for a listing-scoped
        /// payment means the listing had left `PendingPayment`.
        activated: Option<Listing>,
    },
}

#[async_trait]
pub trait MonetizationStore: Send + Sync {
    // Pricing

    async fn load_pricing(&self) -> MonetizationResult<PricingConfig>;

    /// Set the phase to `to` if it is still `from`
    async fn advance_phase(
        &self,
        from: Phase,
        to: Phase,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool>;

    /// Move the launch end date, only while the stored phase is `launch`
    async fn set_launch_end_date(
        &self,
        end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool>;

    async fn update_pricing(
        &self,
        monthly_free_limit: i32,
        standard_listing_price: i64,
        currency: &str,
        now: OffsetDateTime,
    ) -> MonetizationResult<PricingConfig>;

    // Quota

    /// Upsert on the unique key; an existing row is returned untouched
    async fn get_or_create_period(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod>;

    async fn find_period(&self, key: PeriodKey) -> MonetizationResult<Option<QuotaPeriod>>;

    /// Increment `free_used`, guarded by `free_used < free_limit` when
    /// `enforce_cap` is set. Returns whether a row was updated.
    async fn consume_free(
        &self,
        key: PeriodKey,
        enforce_cap: bool,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool>;

    /// Increment `paid_count`, creating the period if needed
    async fn add_paid(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod>;

    /// Newest first
    async fn list_periods(&self, user_id: Uuid, limit: i64)
        -> MonetizationResult<Vec<QuotaPeriod>>;

    /// Delete periods whose month index is strictly below `cutoff`
    async fn delete_periods_before(&self, cutoff: i32) -> MonetizationResult<u64>;

    // Listings

    async fn insert_listing(&self, listing: &Listing) -> MonetizationResult<()>;

    async fn find_listing(&self, id: Uuid) -> MonetizationResult<Option<Listing>>;

    /// Move a listing to `to` if its status is one of `from`. `expires_at`
    /// replaces the stored value when given.
    async fn transition_listing(
        &self,
        id: Uuid,
        from: &[ListingStatus],
        to: ListingStatus,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>>;

    /// Active → Expired, guarded by `expires_at < now`
    async fn expire_listing(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>>;

    async fn expired_listing_ids(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Uuid>>;

    /// Draft → Active plus one free slot, atomically
    #[allow(clippy::too_many_arguments)]
    async fn publish_free(
        &self,
        listing_id: Uuid,
        owner_id: Uuid,
        key: PeriodKey,
        free_limit: i32,
        enforce_cap: bool,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<PublishFreeOutcome>;

    /// Draft → PendingPayment plus the payment insert, atomically. Returns
    /// false if the listing was not an owned draft.
    async fn open_listing_payment(
        &self,
        listing_id: Uuid,
        owner_id: Uuid,
        payment: &Payment,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool>;

    // Payments

    async fn insert_payment(&self, payment: &Payment) -> MonetizationResult<()>;

    async fn find_payment(&self, id: Uuid) -> MonetizationResult<Option<Payment>>;

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> MonetizationResult<Option<Payment>>;

    async fn pending_payment_for_listing(
        &self,
        listing_id: Uuid,
    ) -> MonetizationResult<Option<Payment>>;

    /// Move a payment from `from` to `to`. Leaving `pending` stamps
    /// `processed_at`; `reason` is recorded when given.
    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Payment>>;

    async fn set_gateway_reference(&self, id: Uuid, reference: &str) -> MonetizationResult<()>;

    /// Pending payments with `expires_at < now`, oldest first
    async fn expired_pending_payments(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Payment>>;

    /// pending → success, PendingPayment → Active and `paid_count + 1`,
    /// atomically. The listing and counter only move if the listing is still
    /// waiting for this payment.
    async fn settle_payment_success(
        &self,
        payment_id: Uuid,
        free_limit: i32,
        listing_expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<SettleOutcome>;

    // Webhook audit log

    async fn record_webhook_event(&self, event: &WebhookEvent) -> MonetizationResult<()>;

    /// Newest first
    async fn list_webhook_events(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> MonetizationResult<Vec<WebhookEvent>>;
}
