//! Listing publication lifecycle
//!
//! ```text
//! Draft ──free slot──► Active ──expires_at passed──► Expired
//!   │                    ▲
//!   └─no slot─► PendingPayment ──payment success──┘
//!
//! any state except Deleted ──► Sold | Suspended | Deleted
//! ```
//!
//! Transitions are applied with a guarded update on the stored status. A
//! listing that moved in the meantime is reported as `InvalidState`, never
//! overwritten.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::{CacheInvalidator, CacheKey};
use crate::clock::Clock;
use crate::error::{MonetizationError, MonetizationResult};
use crate::gateway::GatewayCheckout;
use crate::payment::{Payment, PaymentLedger, PaymentMethod};
use crate::pricing::PricingPhaseStore;
use crate::providers::Provider;
use crate::quota::{PeriodKey, QuotaLedger};
use crate::store::{MonetizationStore, PublishFreeOutcome};
use crate::sweeper::{SweepCounts, SWEEP_BATCH_SIZE};

/// How long a listing stays visible once activated
pub const LISTING_TTL: Duration = Duration::days(30);

const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    PendingPayment,
    Active,
    Expired,
    Sold,
    Suspended,
    Deleted,
}

impl ListingStatus {
    pub const ALL: [ListingStatus; 7] = [
        ListingStatus::Draft,
        ListingStatus::PendingPayment,
        ListingStatus::Active,
        ListingStatus::Expired,
        ListingStatus::Sold,
        ListingStatus::Suspended,
        ListingStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::PendingPayment => "pending_payment",
            ListingStatus::Active => "active",
            ListingStatus::Expired => "expired",
            ListingStatus::Sold => "sold",
            ListingStatus::Suspended => "suspended",
            ListingStatus::Deleted => "deleted",
        }
    }

    /// Single transition table for listings
    pub fn can_transition_to(&self, to: ListingStatus) -> bool {
        use ListingStatus::*;

        match (self, to) {
            (Deleted, _) => false,
            (from, Sold | Suspended | Deleted) => *from != to,
            (Draft, PendingPayment | Active) => true,
            (PendingPayment, Active) => true,
            (Active, Expired) => true,
            _ => false,
        }
    }

    /// Every status that may move to `to`
    pub fn sources_of(to: ListingStatus) -> Vec<ListingStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = MonetizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MonetizationError::Database(format!("unknown listing status '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Asking price shown to buyers, unrelated to the listing fee
    pub price: Option<i64>,
    pub status: ListingStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields supplied by the owner when creating a listing
#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub category_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
}

impl NewListing {
    fn validate(&self) -> MonetizationResult<()> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(MonetizationError::InvalidInput(
                "title must not be empty".to_string(),
            ));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(MonetizationError::InvalidInput(format!(
                "title longer than {} characters",
                MAX_TITLE_LEN
            )));
        }
        if matches!(self.price, Some(p) if p < 0) {
            return Err(MonetizationError::InvalidInput(
                "price must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a publish request
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// Consumed a free slot; the listing is live
    PublishedFree { listing: Listing },
    /// The listing waits for the returned payment
    PaymentRequired {
        listing: Listing,
        payment: Payment,
        /// Absent when the gateway could not be reached
        checkout: Option<GatewayCheckout>,
    },
}

impl PublishOutcome {
    pub fn listing(&self) -> &Listing {
        match self {
            PublishOutcome::PublishedFree { listing }
            | PublishOutcome::PaymentRequired { listing, .. } => listing,
        }
    }
}

#[derive(Clone)]
pub struct ListingLifecycle {
    store: Arc<dyn MonetizationStore>,
    pricing: PricingPhaseStore,
    quota: QuotaLedger,
    payments: PaymentLedger,
    cache: Arc<dyn CacheInvalidator>,
    clock: Arc<dyn Clock>,
}

impl ListingLifecycle {
    pub fn new(
        store: Arc<dyn MonetizationStore>,
        pricing: PricingPhaseStore,
        quota: QuotaLedger,
        payments: PaymentLedger,
        cache: Arc<dyn CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pricing,
            quota,
            payments,
            cache,
            clock,
        }
    }

    /// Create a draft owned by `user_id`
    pub async fn create(&self, user_id: Uuid, fields: NewListing) -> MonetizationResult<Listing> {
        fields.validate()?;
        let now = self.clock.now();

        let listing = Listing {
            id: Uuid::new_v4(),
            user_id,
            category_id: fields.category_id,
            title: fields.title.trim().to_string(),
            description: fields.description,
            price: fields.price,
            status: ListingStatus::Draft,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_listing(&listing).await?;

        tracing::debug!(listing_id = %listing.id, user_id = %user_id, "Listing draft created");
        Ok(listing)
    }

    pub async fn get(&self, listing_id: Uuid) -> MonetizationResult<Listing> {
        self.store
            .find_listing(listing_id)
            .await?
            .ok_or_else(|| MonetizationError::NotFound(format!("listing {}", listing_id)))
    }

    /// Publish a draft, for free if the owner has a slot left
    pub async fn request_publish(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
        method: PaymentMethod,
    ) -> MonetizationResult<PublishOutcome> {
        ensure_settleable(method)?;
        let listing = self.get(listing_id).await?;
        ensure_owner(&listing, user_id)?;
        ensure_status(&listing, ListingStatus::Draft)?;

        if self.quota.can_consume_free(user_id).await? {
            let config = self.pricing.config().await?;
            let now = self.clock.now();
            let key = PeriodKey::current(user_id, now);

            match self
                .store
                .publish_free(
                    listing_id,
                    user_id,
                    key,
                    config.monthly_free_limit,
                    !config.is_launch_active(now),
                    now + LISTING_TTL,
                    now,
                )
                .await?
            {
                PublishFreeOutcome::Published(listing) => {
                    tracing::info!(
                        listing_id = %listing_id,
                        user_id = %user_id,
                        phase = %config.effective_phase(now),
                        "Listing published with free slot"
                    );
                    self.cache
                        .invalidate(vec![CacheKey::Listing(listing_id), CacheKey::Quota(user_id)]);
                    return Ok(PublishOutcome::PublishedFree { listing });
                }
                PublishFreeOutcome::ListingNotDraft => {
                    return Err(self.stale_state(listing_id, ListingStatus::Draft).await);
                }
                PublishFreeOutcome::QuotaExhausted => {
                    // Lost the last slot to a concurrent publish
                    tracing::debug!(
                        listing_id = %listing_id,
                        user_id = %user_id,
                        "Free slot taken concurrently, falling back to payment"
                    );
                }
            }
        }

        self.publish_paid(listing_id, user_id, method).await
    }

    async fn publish_paid(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
        method: PaymentMethod,
    ) -> MonetizationResult<PublishOutcome> {
        let config = self.pricing.config().await?;
        let now = self.clock.now();
        let payment = Payment::new_pending(
            user_id,
            Some(listing_id),
            config.standard_listing_price,
            &config.currency,
            method,
            now,
        );

        if !self
            .store
            .open_listing_payment(listing_id, user_id, &payment, now)
            .await?
        {
            return Err(self.stale_state(listing_id, ListingStatus::Draft).await);
        }

        tracing::info!(
            listing_id = %listing_id,
            user_id = %user_id,
            payment_id = %payment.id,
            amount = payment.amount,
            currency = %payment.currency,
            "Listing awaiting payment"
        );
        self.cache.invalidate(vec![CacheKey::Listing(listing_id)]);

        let checkout = self.payments.initiate_checkout(&payment).await;
        let listing = self.get(listing_id).await?;

        Ok(PublishOutcome::PaymentRequired {
            listing,
            payment,
            checkout,
        })
    }

    /// Open a new payment for a listing whose previous attempt did not succeed
    pub async fn retry_payment(
        &self,
        listing_id: Uuid,
        user_id: Uuid,
        method: PaymentMethod,
    ) -> MonetizationResult<PublishOutcome> {
        ensure_settleable(method)?;
        let listing = self.get(listing_id).await?;
        ensure_owner(&listing, user_id)?;
        ensure_status(&listing, ListingStatus::PendingPayment)?;

        if let Some(pending) = self.store.pending_payment_for_listing(listing_id).await? {
            return Err(MonetizationError::Conflict(format!(
                "payment {} is still pending for this listing",
                pending.id
            )));
        }

        let config = self.pricing.config().await?;
        // The partial unique index turns a concurrent retry into Conflict
        let payment = self
            .payments
            .open(
                user_id,
                Some(listing_id),
                config.standard_listing_price,
                &config.currency,
                method,
            )
            .await?;
        let checkout = self.payments.initiate_checkout(&payment).await;

        Ok(PublishOutcome::PaymentRequired {
            listing,
            payment,
            checkout,
        })
    }

    /// Activate a listing after its payment succeeded
    ///
    /// Only a listing still in `PendingPayment` moves; anything else (for
    /// example a draft the owner deleted) is `InvalidState`.
    pub async fn activate_after_payment(&self, listing_id: Uuid) -> MonetizationResult<Listing> {
        let now = self.clock.now();
        match self
            .store
            .transition_listing(
                listing_id,
                &[ListingStatus::PendingPayment],
                ListingStatus::Active,
                Some(now + LISTING_TTL),
                now,
            )
            .await?
        {
            Some(listing) => {
                tracing::info!(listing_id = %listing_id, "Listing activated after payment");
                self.cache.invalidate(vec![CacheKey::Listing(listing_id)]);
                Ok(listing)
            }
            None => Err(self
                .stale_state(listing_id, ListingStatus::PendingPayment)
                .await),
        }
    }

    pub async fn mark_sold(&self, listing_id: Uuid, user_id: Uuid) -> MonetizationResult<Listing> {
        let listing = self.get(listing_id).await?;
        ensure_owner(&listing, user_id)?;
        self.move_to(listing_id, ListingStatus::Sold).await
    }

    /// Owner deletion; terminal
    pub async fn delete(&self, listing_id: Uuid, user_id: Uuid) -> MonetizationResult<Listing> {
        let listing = self.get(listing_id).await?;
        ensure_owner(&listing, user_id)?;
        self.move_to(listing_id, ListingStatus::Deleted).await
    }

    /// Admin suspension
    pub async fn suspend(&self, listing_id: Uuid) -> MonetizationResult<Listing> {
        self.move_to(listing_id, ListingStatus::Suspended).await
    }

    /// Admin deletion, regardless of owner
    pub async fn admin_delete(&self, listing_id: Uuid) -> MonetizationResult<Listing> {
        self.move_to(listing_id, ListingStatus::Deleted).await
    }

    /// Expire one listing if it is active and past `expires_at`
    ///
    /// Returns `None` when there was nothing to do.
    pub async fn expire(&self, listing_id: Uuid) -> MonetizationResult<Option<Listing>> {
        let expired = self
            .store
            .expire_listing(listing_id, self.clock.now())
            .await?;

        if let Some(listing) = &expired {
            tracing::info!(
                listing_id = %listing.id,
                user_id = %listing.user_id,
                "Listing expired"
            );
            self.cache.invalidate(vec![CacheKey::Listing(listing.id)]);
        }
        Ok(expired)
    }

    /// Expire every overdue active listing, one row at a time
    pub async fn sweep_expired(&self) -> MonetizationResult<SweepCounts> {
        let mut counts = SweepCounts::default();

        loop {
            let ids = self
                .store
                .expired_listing_ids(self.clock.now(), SWEEP_BATCH_SIZE)
                .await?;
            let batch_len = ids.len() as i64;
            let mut progressed = false;

            for id in ids {
                match self.expire(id).await {
                    Ok(Some(_)) => {
                        counts.processed += 1;
                        progressed = true;
                    }
                    Ok(None) => progressed = true,
                    Err(e) => {
                        counts.failed += 1;
                        tracing::error!(listing_id = %id, error = %e, "Failed to expire listing");
                    }
                }
            }

            if batch_len < SWEEP_BATCH_SIZE || !progressed {
                break;
            }
        }

        Ok(counts)
    }

    async fn move_to(&self, listing_id: Uuid, to: ListingStatus) -> MonetizationResult<Listing> {
        let sources = ListingStatus::sources_of(to);
        match self
            .store
            .transition_listing(listing_id, &sources, to, None, self.clock.now())
            .await?
        {
            Some(listing) => {
                tracing::info!(listing_id = %listing_id, status = %to, "Listing status changed");
                self.cache.invalidate(vec![CacheKey::Listing(listing_id)]);
                Ok(listing)
            }
            None => {
                let current = self.get(listing_id).await?;
                Err(MonetizationError::InvalidTransition(format!(
                    "listing cannot move from {} to {}",
                    current.status, to
                )))
            }
        }
    }

    /// Error for a guarded update that matched no row
    async fn stale_state(&self, listing_id: Uuid, expected: ListingStatus) -> MonetizationError {
        match self.get(listing_id).await {
            Ok(current) => MonetizationError::InvalidState {
                expected: expected.as_str(),
                actual: current.status.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn ensure_owner(listing: &Listing, user_id: Uuid) -> MonetizationResult<()> {
    if listing.user_id != user_id {
        return Err(MonetizationError::NotOwner);
    }
    Ok(())
}

/// Only methods with a webhook provider can ever be settled
fn ensure_settleable(method: PaymentMethod) -> MonetizationResult<()> {
    if Provider::for_method(method).is_none() {
        return Err(MonetizationError::InvalidInput(format!(
            "payment method {} is not supported for listing payments",
            method
        )));
    }
    Ok(())
}

fn ensure_status(listing: &Listing, expected: ListingStatus) -> MonetizationResult<()> {
    if listing.status != expected {
        return Err(MonetizationError::InvalidState {
            expected: expected.as_str(),
            actual: listing.status.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ListingStatus::*;

        assert!(Draft.can_transition_to(Active));
        assert!(Draft.can_transition_to(PendingPayment));
        assert!(PendingPayment.can_transition_to(Active));
        assert!(Active.can_transition_to(Expired));

        assert!(!Draft.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Sold.can_transition_to(Active));
        assert!(!PendingPayment.can_transition_to(Draft));
    }

    #[test]
    fn test_deleted_is_terminal() {
        for to in ListingStatus::ALL {
            assert!(!ListingStatus::Deleted.can_transition_to(to));
        }
    }

    #[test]
    fn test_moderation_targets_reachable_from_live_states() {
        use ListingStatus::*;

        assert_eq!(
            ListingStatus::sources_of(Deleted),
            vec![Draft, PendingPayment, Active, Expired, Sold, Suspended]
        );
        assert!(!ListingStatus::sources_of(Sold).contains(&Sold));
        assert_eq!(ListingStatus::sources_of(Expired), vec![Active]);
    }

    #[test]
    fn test_status_parse() {
        for status in ListingStatus::ALL {
            assert_eq!(status.as_str().parse::<ListingStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ListingStatus>().is_err());
    }

    #[test]
    fn test_only_provider_methods_are_settleable() {
        assert!(ensure_settleable(PaymentMethod::Wave).is_ok());
        assert!(ensure_settleable(PaymentMethod::OrangeMoney).is_ok());
        assert!(ensure_settleable(PaymentMethod::FreeMoney).is_ok());
        assert!(matches!(
            ensure_settleable(PaymentMethod::BankCard),
            Err(MonetizationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_new_listing_validation() {
        let mut fields = NewListing {
            category_id: Uuid::new_v4(),
            title: "  ".to_string(),
            description: None,
            price: None,
        };
        assert!(fields.validate().is_err());

        fields.title = "Vélo tout terrain".to_string();
        assert!(fields.validate().is_ok());

        fields.price = Some(-5);
        assert!(fields.validate().is_err());
    }
}
