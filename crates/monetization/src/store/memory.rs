//! In-memory store
//!
//! All tables sit behind one mutex, so each trait call is atomic the same way
//! a single guarded statement or transaction is in Postgres. Used by tests and
//! by the API when no database is configured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{MonetizationStore, PublishFreeOutcome, SettleOutcome};
use crate::error::{MonetizationError, MonetizationResult};
use crate::listing::{Listing, ListingStatus};
use crate::payment::{Payment, PaymentStatus};
use crate::pricing::{Phase, PricingConfig};
use crate::quota::{PeriodKey, QuotaPeriod};
use crate::webhooks::{WebhookEvent, WebhookOutcome};

#[derive(Debug)]
struct Tables {
    pricing: PricingConfig,
    periods: HashMap<PeriodKey, QuotaPeriod>,
    listings: HashMap<Uuid, Listing>,
    payments: HashMap<Uuid, Payment>,
    webhook_events: Vec<WebhookEvent>,
}

impl Tables {
    fn period_entry(
        &mut self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> &mut QuotaPeriod {
        self.periods
            .entry(key)
            .or_insert_with(|| QuotaPeriod::new(key, free_limit, now))
    }

    fn check_payment_constraints(&self, payment: &Payment) -> MonetizationResult<()> {
        if self.payments.contains_key(&payment.id) {
            return Err(MonetizationError::Conflict("payments_pkey".to_string()));
        }
        if self
            .payments
            .values()
            .any(|p| p.transaction_id == payment.transaction_id)
        {
            return Err(MonetizationError::Conflict(
                "payments_transaction_id_key".to_string(),
            ));
        }
        if payment.status == PaymentStatus::Pending {
            if let Some(listing_id) = payment.listing_id {
                let clash = self.payments.values().any(|p| {
                    p.listing_id == Some(listing_id) && p.status == PaymentStatus::Pending
                });
                if clash {
                    return Err(MonetizationError::Conflict(
                        "payments_one_pending_per_listing".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new(pricing: PricingConfig) -> Self {
        Self {
            tables: Mutex::new(Tables {
                pricing,
                periods: HashMap::new(),
                listings: HashMap::new(),
                payments: HashMap::new(),
                webhook_events: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Poisoning is ignored; writes below only start once all checks pass
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MonetizationStore for MemoryStore {
    async fn load_pricing(&self) -> MonetizationResult<PricingConfig> {
        Ok(self.lock().pricing.clone())
    }

    async fn advance_phase(
        &self,
        from: Phase,
        to: Phase,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let mut t = self.lock();
        if t.pricing.phase != from {
            return Ok(false);
        }
        t.pricing.phase = to;
        t.pricing.updated_at = now;
        Ok(true)
    }

    async fn set_launch_end_date(
        &self,
        end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let mut t = self.lock();
        if t.pricing.phase != Phase::Launch {
            return Ok(false);
        }
        t.pricing.launch_end_date = end;
        t.pricing.updated_at = now;
        Ok(true)
    }

    async fn update_pricing(
        &self,
        monthly_free_limit: i32,
        standard_listing_price: i64,
        currency: &str,
        now: OffsetDateTime,
    ) -> MonetizationResult<PricingConfig> {
        let mut t = self.lock();
        t.pricing.monthly_free_limit = monthly_free_limit;
        t.pricing.standard_listing_price = standard_listing_price;
        t.pricing.currency = currency.to_string();
        t.pricing.updated_at = now;
        Ok(t.pricing.clone())
    }

    async fn get_or_create_period(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod> {
        Ok(self.lock().period_entry(key, free_limit, now).clone())
    }

    async fn find_period(&self, key: PeriodKey) -> MonetizationResult<Option<QuotaPeriod>> {
        Ok(self.lock().periods.get(&key).cloned())
    }

    async fn consume_free(
        &self,
        key: PeriodKey,
        enforce_cap: bool,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let mut t = self.lock();
        let Some(period) = t.periods.get_mut(&key) else {
            return Ok(false);
        };
        if enforce_cap && period.free_used >= period.free_limit {
            return Ok(false);
        }
        period.free_used += 1;
        period.updated_at = now;
        Ok(true)
    }

    async fn add_paid(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod> {
        let mut t = self.lock();
        let period = t.period_entry(key, free_limit, now);
        period.paid_count += 1;
        period.updated_at = now;
        Ok(period.clone())
    }

    async fn list_periods(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> MonetizationResult<Vec<QuotaPeriod>> {
        let t = self.lock();
        let mut periods: Vec<QuotaPeriod> = t
            .periods
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        periods.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
        periods.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(periods)
    }

    async fn delete_periods_before(&self, cutoff: i32) -> MonetizationResult<u64> {
        let mut t = self.lock();
        let before = t.periods.len();
        t.periods.retain(|key, _| key.month_index() >= cutoff);
        Ok((before - t.periods.len()) as u64)
    }

    async fn insert_listing(&self, listing: &Listing) -> MonetizationResult<()> {
        let mut t = self.lock();
        if t.listings.contains_key(&listing.id) {
            return Err(MonetizationError::Conflict("listings_pkey".to_string()));
        }
        t.listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn find_listing(&self, id: Uuid) -> MonetizationResult<Option<Listing>> {
        Ok(self.lock().listings.get(&id).cloned())
    }

    async fn transition_listing(
        &self,
        id: Uuid,
        from: &[ListingStatus],
        to: ListingStatus,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>> {
        let mut t = self.lock();
        let Some(listing) = t.listings.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&listing.status) {
            return Ok(None);
        }
        listing.status = to;
        if expires_at.is_some() {
            listing.expires_at = expires_at;
        }
        listing.updated_at = now;
        Ok(Some(listing.clone()))
    }

    async fn expire_listing(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>> {
        let mut t = self.lock();
        let Some(listing) = t.listings.get_mut(&id) else {
            return Ok(None);
        };
        let overdue = matches!(listing.expires_at, Some(at) if at < now);
        if listing.status != ListingStatus::Active || !overdue {
            return Ok(None);
        }
        listing.status = ListingStatus::Expired;
        listing.updated_at = now;
        Ok(Some(listing.clone()))
    }

    async fn expired_listing_ids(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Uuid>> {
        let t = self.lock();
        let mut overdue: Vec<(OffsetDateTime, Uuid)> = t
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .filter_map(|l| l.expires_at.filter(|at| *at < now).map(|at| (at, l.id)))
            .collect();
        overdue.sort();
        overdue.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(overdue.into_iter().map(|(_, id)| id).collect())
    }

    async fn publish_free(
        &self,
        listing_id: Uuid,
        owner_id: Uuid,
        key: PeriodKey,
        free_limit: i32,
        enforce_cap: bool,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<PublishFreeOutcome> {
        let mut t = self.lock();

        let is_owned_draft = t
            .listings
            .get(&listing_id)
            .is_some_and(|l| l.user_id == owner_id && l.status == ListingStatus::Draft);
        if !is_owned_draft {
            return Ok(PublishFreeOutcome::ListingNotDraft);
        }

        let period = t.period_entry(key, free_limit, now);
        if enforce_cap && period.free_used >= period.free_limit {
            return Ok(PublishFreeOutcome::QuotaExhausted);
        }
        period.free_used += 1;
        period.updated_at = now;

        match t.listings.get_mut(&listing_id) {
            Some(listing) => {
                listing.status = ListingStatus::Active;
                listing.expires_at = Some(expires_at);
                listing.updated_at = now;
                Ok(PublishFreeOutcome::Published(listing.clone()))
            }
            None => Ok(PublishFreeOutcome::ListingNotDraft),
        }
    }

    async fn open_listing_payment(
        &self,
        listing_id: Uuid,
        owner_id: Uuid,
        payment: &Payment,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let mut t = self.lock();

        let is_owned_draft = t
            .listings
            .get(&listing_id)
            .is_some_and(|l| l.user_id == owner_id && l.status == ListingStatus::Draft);
        if !is_owned_draft {
            return Ok(false);
        }
        t.check_payment_constraints(payment)?;

        t.payments.insert(payment.id, payment.clone());
        if let Some(listing) = t.listings.get_mut(&listing_id) {
            listing.status = ListingStatus::PendingPayment;
            listing.updated_at = now;
        }
        Ok(true)
    }

    async fn insert_payment(&self, payment: &Payment) -> MonetizationResult<()> {
        let mut t = self.lock();
        t.check_payment_constraints(payment)?;
        t.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> MonetizationResult<Option<Payment>> {
        Ok(self.lock().payments.get(&id).cloned())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> MonetizationResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.transaction_id == transaction_id)
            .cloned())
    }

    async fn pending_payment_for_listing(
        &self,
        listing_id: Uuid,
    ) -> MonetizationResult<Option<Payment>> {
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.listing_id == Some(listing_id) && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Payment>> {
        let mut t = self.lock();
        let Some(payment) = t.payments.get_mut(&id) else {
            return Ok(None);
        };
        if payment.status != from {
            return Ok(None);
        }
        payment.status = to;
        if from == PaymentStatus::Pending {
            payment.processed_at = Some(now);
        }
        if let Some(reason) = reason {
            payment.failure_reason = Some(reason.to_string());
        }
        payment.updated_at = now;
        Ok(Some(payment.clone()))
    }

    async fn set_gateway_reference(&self, id: Uuid, reference: &str) -> MonetizationResult<()> {
        let mut t = self.lock();
        match t.payments.get_mut(&id) {
            Some(payment) => {
                payment.gateway_reference = Some(reference.to_string());
                Ok(())
            }
            None => Err(MonetizationError::PaymentNotFound(id.to_string())),
        }
    }

    async fn expired_pending_payments(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Payment>> {
        let t = self.lock();
        let mut expired: Vec<Payment> = t
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.expires_at < now)
            .cloned()
            .collect();
        expired.sort_by_key(|p| p.expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expired)
    }

    async fn settle_payment_success(
        &self,
        payment_id: Uuid,
        free_limit: i32,
        listing_expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<SettleOutcome> {
        let mut t = self.lock();

        let payment = match t.payments.get_mut(&payment_id) {
            None => return Err(MonetizationError::PaymentNotFound(payment_id.to_string())),
            Some(p) if p.status != PaymentStatus::Pending => {
                return Ok(SettleOutcome::AlreadyFinal(p.clone()))
            }
            Some(p) => {
                p.status = PaymentStatus::Success;
                p.processed_at = Some(now);
                p.updated_at = now;
                p.clone()
            }
        };

        let Some(listing_id) = payment.listing_id else {
            return Ok(SettleOutcome::Settled {
                payment,
                activated: None,
            });
        };

        let activated = match t.listings.get_mut(&listing_id) {
            Some(listing) if listing.status == ListingStatus::PendingPayment => {
                listing.status = ListingStatus::Active;
                listing.expires_at = Some(listing_expires_at);
                listing.updated_at = now;
                Some(listing.clone())
            }
            _ => None,
        };

        if activated.is_some() {
            let key = PeriodKey::current(payment.user_id, now);
            let period = t.period_entry(key, free_limit, now);
            period.paid_count += 1;
            period.updated_at = now;
        }

        Ok(SettleOutcome::Settled { payment, activated })
    }

    async fn record_webhook_event(&self, event: &WebhookEvent) -> MonetizationResult<()> {
        self.lock().webhook_events.push(event.clone());
        Ok(())
    }

    async fn list_webhook_events(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> MonetizationResult<Vec<WebhookEvent>> {
        let t = self.lock();
        Ok(t.webhook_events
            .iter()
            .rev()
            .filter(|e| outcome.map_or(true, |o| e.outcome == o))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
