//! Postgres store
//!
//! Guarded updates check the current status in the `WHERE` clause and report
//! whether a row matched. Combined operations run in one transaction and roll
//! back on any early return.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{MonetizationStore, PublishFreeOutcome, SettleOutcome};
use crate::error::{MonetizationError, MonetizationResult};
use crate::listing::{Listing, ListingStatus};
use crate::payment::{Payment, PaymentStatus};
use crate::pricing::{Phase, PricingConfig};
use crate::quota::{PeriodKey, QuotaPeriod};
use crate::webhooks::{WebhookEvent, WebhookOutcome};

#[derive(Debug, sqlx::FromRow)]
struct PricingRow {
    phase: String,
    launch_end_date: OffsetDateTime,
    monthly_free_limit: i32,
    standard_listing_price: i64,
    currency: String,
    updated_at: OffsetDateTime,
}

impl TryFrom<PricingRow> for PricingConfig {
    type Error = MonetizationError;

    fn try_from(row: PricingRow) -> Result<Self, Self::Error> {
        Ok(PricingConfig {
            phase: row.phase.parse()?,
            launch_end_date: row.launch_end_date,
            monthly_free_limit: row.monthly_free_limit,
            standard_listing_price: row.standard_listing_price,
            currency: row.currency,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    user_id: Uuid,
    category_id: Uuid,
    title: String,
    description: Option<String>,
    price: Option<i64>,
    status: String,
    expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ListingRow> for Listing {
    type Error = MonetizationError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        Ok(Listing {
            id: row.id,
            user_id: row.user_id,
            category_id: row.category_id,
            title: row.title,
            description: row.description,
            price: row.price,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    listing_id: Option<Uuid>,
    transaction_id: String,
    amount: i64,
    currency: String,
    method: String,
    status: String,
    failure_reason: Option<String>,
    gateway_reference: Option<String>,
    expires_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = MonetizationError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            user_id: row.user_id,
            listing_id: row.listing_id,
            transaction_id: row.transaction_id,
            amount: row.amount,
            currency: row.currency,
            method: row.method.parse().map_err(|_| {
                MonetizationError::Database(format!("unknown payment method '{}'", row.method))
            })?,
            status: row.status.parse()?,
            failure_reason: row.failure_reason,
            gateway_reference: row.gateway_reference,
            expires_at: row.expires_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    provider: String,
    transaction_id: Option<String>,
    provider_status: Option<String>,
    outcome: String,
    error_message: Option<String>,
    payload: Option<serde_json::Value>,
    received_at: OffsetDateTime,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = MonetizationError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            id: row.id,
            provider: row.provider,
            transaction_id: row.transaction_id,
            provider_status: row.provider_status,
            outcome: row.outcome.parse().map_err(|_| {
                MonetizationError::Database(format!("unknown webhook outcome '{}'", row.outcome))
            })?,
            error_message: row.error_message,
            payload: row.payload.unwrap_or(serde_json::Value::Null),
            received_at: row.received_at,
        })
    }
}

fn listing_opt(row: Option<ListingRow>) -> MonetizationResult<Option<Listing>> {
    row.map(Listing::try_from).transpose()
}

fn payment_opt(row: Option<PaymentRow>) -> MonetizationResult<Option<Payment>> {
    row.map(Payment::try_from).transpose()
}

/// Create-if-absent on the unique key; never touches counters of an existing row
async fn upsert_period(
    conn: &mut PgConnection,
    key: PeriodKey,
    free_limit: i32,
    now: OffsetDateTime,
) -> MonetizationResult<QuotaPeriod> {
    let period = sqlx::query_as::<_, QuotaPeriod>(
        r#"
        INSERT INTO quota_periods (id, user_id, month, year, free_used, free_limit, paid_count, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 0, $5, 0, $6, $6)
        ON CONFLICT (user_id, month, year)
        DO UPDATE SET user_id = quota_periods.user_id
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(key.user_id)
    .bind(i16::from(key.month))
    .bind(key.year)
    .bind(free_limit)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(period)
}

async fn increment_paid(
    conn: &mut PgConnection,
    key: PeriodKey,
    free_limit: i32,
    now: OffsetDateTime,
) -> MonetizationResult<QuotaPeriod> {
    let period = sqlx::query_as::<_, QuotaPeriod>(
        r#"
        INSERT INTO quota_periods (id, user_id, month, year, free_used, free_limit, paid_count, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 0, $5, 1, $6, $6)
        ON CONFLICT (user_id, month, year)
        DO UPDATE SET paid_count = quota_periods.paid_count + 1, updated_at = EXCLUDED.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(key.user_id)
    .bind(i16::from(key.month))
    .bind(key.year)
    .bind(free_limit)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(period)
}

async fn insert_payment_row(conn: &mut PgConnection, payment: &Payment) -> MonetizationResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payments (
            id, user_id, listing_id, transaction_id, amount, currency, method, status,
            failure_reason, gateway_reference, expires_at, processed_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(payment.id)
    .bind(payment.user_id)
    .bind(payment.listing_id)
    .bind(&payment.transaction_id)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(payment.method.as_str())
    .bind(payment.status.as_str())
    .bind(&payment.failure_reason)
    .bind(&payment.gateway_reference)
    .bind(payment.expires_at)
    .bind(payment.processed_at)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MonetizationStore for PgStore {
    async fn load_pricing(&self) -> MonetizationResult<PricingConfig> {
        let row: Option<PricingRow> = sqlx::query_as(
            r#"
            SELECT phase, launch_end_date, monthly_free_limit, standard_listing_price, currency, updated_at
            FROM pricing_config
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| MonetizationError::Config("pricing_config row is missing".to_string()))?
            .try_into()
    }

    async fn advance_phase(
        &self,
        from: Phase,
        to: Phase,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let result = sqlx::query(
            "UPDATE pricing_config SET phase = $2, updated_at = $3 WHERE id = 1 AND phase = $1",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_launch_end_date(
        &self,
        end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pricing_config
            SET launch_end_date = $1, updated_at = $2
            WHERE id = 1 AND phase = 'launch'
            "#,
        )
        .bind(end)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_pricing(
        &self,
        monthly_free_limit: i32,
        standard_listing_price: i64,
        currency: &str,
        now: OffsetDateTime,
    ) -> MonetizationResult<PricingConfig> {
        let row: PricingRow = sqlx::query_as(
            r#"
            UPDATE pricing_config
            SET monthly_free_limit = $1, standard_listing_price = $2, currency = $3, updated_at = $4
            WHERE id = 1
            RETURNING phase, launch_end_date, monthly_free_limit, standard_listing_price, currency, updated_at
            "#,
        )
        .bind(monthly_free_limit)
        .bind(standard_listing_price)
        .bind(currency)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_or_create_period(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod> {
        let mut conn = self.pool.acquire().await?;
        upsert_period(&mut conn, key, free_limit, now).await
    }

    async fn find_period(&self, key: PeriodKey) -> MonetizationResult<Option<QuotaPeriod>> {
        let period = sqlx::query_as::<_, QuotaPeriod>(
            "SELECT * FROM quota_periods WHERE user_id = $1 AND month = $2 AND year = $3",
        )
        .bind(key.user_id)
        .bind(i16::from(key.month))
        .bind(key.year)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period)
    }

    async fn consume_free(
        &self,
        key: PeriodKey,
        enforce_cap: bool,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE quota_periods
            SET free_used = free_used + 1, updated_at = $5
            WHERE user_id = $1 AND month = $2 AND year = $3
              AND (NOT $4 OR free_used < free_limit)
            "#,
        )
        .bind(key.user_id)
        .bind(i16::from(key.month))
        .bind(key.year)
        .bind(enforce_cap)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn add_paid(
        &self,
        key: PeriodKey,
        free_limit: i32,
        now: OffsetDateTime,
    ) -> MonetizationResult<QuotaPeriod> {
        let mut conn = self.pool.acquire().await?;
        increment_paid(&mut conn, key, free_limit, now).await
    }

    async fn list_periods(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> MonetizationResult<Vec<QuotaPeriod>> {
        let periods = sqlx::query_as::<_, QuotaPeriod>(
            r#"
            SELECT * FROM quota_periods
            WHERE user_id = $1
            ORDER BY year DESC, month DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(periods)
    }

    async fn delete_periods_before(&self, cutoff: i32) -> MonetizationResult<u64> {
        let result = sqlx::query("DELETE FROM quota_periods WHERE year * 12 + month - 1 < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_listing(&self, listing: &Listing) -> MonetizationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (id, user_id, category_id, title, description, price, status, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(listing.id)
        .bind(listing.user_id)
        .bind(listing.category_id)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.price)
        .bind(listing.status.as_str())
        .bind(listing.expires_at)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_listing(&self, id: Uuid) -> MonetizationResult<Option<Listing>> {
        let row: Option<ListingRow> = sqlx::query_as("SELECT * FROM listings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        listing_opt(row)
    }

    async fn transition_listing(
        &self,
        id: Uuid,
        from: &[ListingStatus],
        to: ListingStatus,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let row: Option<ListingRow> = sqlx::query_as(
            r#"
            UPDATE listings
            SET status = $3, expires_at = COALESCE($4, expires_at), updated_at = $5
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        listing_opt(row)
    }

    async fn expire_listing(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Listing>> {
        let row: Option<ListingRow> = sqlx::query_as(
            r#"
            UPDATE listings
            SET status = 'expired', updated_at = $2
            WHERE id = $1 AND status = 'active' AND expires_at < $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        listing_opt(row)
    }

    async fn expired_listing_ids(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM listings
            WHERE status = 'active' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
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
        let mut tx = self.pool.begin().await?;

        let row: Option<ListingRow> = sqlx::query_as(
            r#"
            UPDATE listings
            SET status = 'active', expires_at = $3, updated_at = $4
            WHERE id = $1 AND user_id = $2 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(listing_id)
        .bind(owner_id)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(PublishFreeOutcome::ListingNotDraft);
        };

        upsert_period(&mut tx, key, free_limit, now).await?;

        let consumed = sqlx::query(
            r#"
            UPDATE quota_periods
            SET free_used = free_used + 1, updated_at = $5
            WHERE user_id = $1 AND month = $2 AND year = $3
              AND (NOT $4 OR free_used < free_limit)
            "#,
        )
        .bind(key.user_id)
        .bind(i16::from(key.month))
        .bind(key.year)
        .bind(enforce_cap)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if consumed == 0 {
            tx.rollback().await?;
            return Ok(PublishFreeOutcome::QuotaExhausted);
        }

        tx.commit().await?;
        Ok(PublishFreeOutcome::Published(row.try_into()?))
    }

    async fn open_listing_payment(
        &self,
        listing_id: Uuid,
        owner_id: Uuid,
        payment: &Payment,
        now: OffsetDateTime,
    ) -> MonetizationResult<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE listings
            SET status = 'pending_payment', updated_at = $3
            WHERE id = $1 AND user_id = $2 AND status = 'draft'
            "#,
        )
        .bind(listing_id)
        .bind(owner_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_payment_row(&mut tx, payment).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_payment(&self, payment: &Payment) -> MonetizationResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_payment_row(&mut conn, payment).await
    }

    async fn find_payment(&self, id: Uuid) -> MonetizationResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        payment_opt(row)
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> MonetizationResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payments WHERE transaction_id = $1")
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await?;

        payment_opt(row)
    }

    async fn pending_payment_for_listing(
        &self,
        listing_id: Uuid,
    ) -> MonetizationResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            "SELECT * FROM payments WHERE listing_id = $1 AND status = 'pending'",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;

        payment_opt(row)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> MonetizationResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = $3,
                processed_at = CASE WHEN $2 = 'pending' THEN $5 ELSE processed_at END,
                failure_reason = COALESCE($4, failure_reason),
                updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        payment_opt(row)
    }

    async fn set_gateway_reference(&self, id: Uuid, reference: &str) -> MonetizationResult<()> {
        let result = sqlx::query("UPDATE payments SET gateway_reference = $2 WHERE id = $1")
            .bind(id)
            .bind(reference)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MonetizationError::PaymentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn expired_pending_payments(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> MonetizationResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE status = 'pending' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn settle_payment_success(
        &self,
        payment_id: Uuid,
        free_limit: i32,
        listing_expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MonetizationResult<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        let settled: Option<PaymentRow> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = 'success', processed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let payment = match settled {
            Some(row) => Payment::try_from(row)?,
            None => {
                let existing: Option<PaymentRow> =
                    sqlx::query_as("SELECT * FROM payments WHERE id = $1")
                        .bind(payment_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                tx.rollback().await?;

                return match payment_opt(existing)? {
                    Some(payment) => Ok(SettleOutcome::AlreadyFinal(payment)),
                    None => Err(MonetizationError::PaymentNotFound(payment_id.to_string())),
                };
            }
        };

        let Some(listing_id) = payment.listing_id else {
            tx.commit().await?;
            return Ok(SettleOutcome::Settled {
                payment,
                activated: None,
            });
        };

        let activated: Option<ListingRow> = sqlx::query_as(
            r#"
            UPDATE listings
            SET status = 'active', expires_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending_payment'
            RETURNING *
            "#,
        )
        .bind(listing_id)
        .bind(listing_expires_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let activated = listing_opt(activated)?;

        if activated.is_some() {
            increment_paid(
                &mut tx,
                PeriodKey::current(payment.user_id, now),
                free_limit,
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(SettleOutcome::Settled { payment, activated })
    }

    async fn record_webhook_event(&self, event: &WebhookEvent) -> MonetizationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_webhook_events (
                id, provider, transaction_id, provider_status, outcome, error_message, payload, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(&event.provider)
        .bind(&event.transaction_id)
        .bind(&event.provider_status)
        .bind(event.outcome.as_str())
        .bind(&event.error_message)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_webhook_events(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> MonetizationResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT * FROM payment_webhook_events
            WHERE ($1::text IS NULL OR outcome = $1)
            ORDER BY received_at DESC
            LIMIT $2
            "#,
        )
        .bind(outcome.map(|o| o.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }
}

/// Run against a scratch database:
/// `TEST_DATABASE_URL=postgres://... cargo test -p teranga-monetization -- --ignored`
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::invariants::InvariantChecker;
    use crate::payment::PaymentMethod;
    use time::Duration;

    async fn store() -> PgStore {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("../shared/migrations").run(&pool).await.unwrap();
        PgStore::new(pool)
    }

    async fn draft(store: &PgStore, user_id: Uuid, now: OffsetDateTime) -> Listing {
        let listing = Listing {
            id: Uuid::new_v4(),
            user_id,
            category_id: Uuid::new_v4(),
            title: "Canapé trois places".to_string(),
            description: None,
            price: Some(120_000),
            status: ListingStatus::Draft,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_listing(&listing).await.unwrap();
        listing
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_consume_free_never_passes_cap_under_concurrency() {
        let store = Arc::new(store().await);
        let now = OffsetDateTime::now_utc();
        let key = PeriodKey::current(Uuid::new_v4(), now);
        store.get_or_create_period(key, 3, now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.consume_free(key, true, now).await.unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(store.find_period(key).await.unwrap().unwrap().free_used, 3);

        // Launch mode counts past the cap
        assert!(store.consume_free(key, false, now).await.unwrap());
        assert_eq!(store.find_period(key).await.unwrap().unwrap().free_used, 4);
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_publish_free_rolls_back_when_cap_is_hit() {
        let store = store().await;
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let key = PeriodKey::current(user, now);
        let first = draft(&store, user, now).await;
        let second = draft(&store, user, now).await;
        let expires_at = now + Duration::days(30);

        let outcome = store
            .publish_free(first.id, user, key, 1, true, expires_at, now)
            .await
            .unwrap();
        let PublishFreeOutcome::Published(published) = outcome else {
            panic!("first publish must use the free slot");
        };
        assert_eq!(published.status, ListingStatus::Active);
        assert!(published.expires_at.is_some());

        let outcome = store
            .publish_free(second.id, user, key, 1, true, expires_at, now)
            .await
            .unwrap();
        assert_eq!(outcome, PublishFreeOutcome::QuotaExhausted);
        let second = store.find_listing(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, ListingStatus::Draft);
        assert!(second.expires_at.is_none());

        // Not a draft any more, and not owned by a stranger
        let outcome = store
            .publish_free(first.id, user, key, 1, false, expires_at, now)
            .await
            .unwrap();
        assert_eq!(outcome, PublishFreeOutcome::ListingNotDraft);
        let outcome = store
            .publish_free(second.id, Uuid::new_v4(), key, 1, false, expires_at, now)
            .await
            .unwrap();
        assert_eq!(outcome, PublishFreeOutcome::ListingNotDraft);

        assert_eq!(store.find_period(key).await.unwrap().unwrap().free_used, 1);
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_settle_payment_success_applies_once() {
        let store = store().await;
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let listing = draft(&store, user, now).await;
        let payment =
            Payment::new_pending(user, Some(listing.id), 1000, "XOF", PaymentMethod::Wave, now);

        assert!(store
            .open_listing_payment(listing.id, user, &payment, now)
            .await
            .unwrap());

        // At most one pending payment per listing
        let second =
            Payment::new_pending(user, Some(listing.id), 1000, "XOF", PaymentMethod::Wave, now);
        assert!(matches!(
            store.insert_payment(&second).await,
            Err(MonetizationError::Conflict(_))
        ));

        let expires_at = now + Duration::days(30);
        let outcome = store
            .settle_payment_success(payment.id, 3, expires_at, now)
            .await
            .unwrap();
        let SettleOutcome::Settled { payment: settled, activated } = outcome else {
            panic!("first settlement must apply");
        };
        assert_eq!(settled.status, PaymentStatus::Success);
        assert_eq!(activated.unwrap().status, ListingStatus::Active);

        let again = store
            .settle_payment_success(payment.id, 3, expires_at, now)
            .await
            .unwrap();
        assert!(matches!(again, SettleOutcome::AlreadyFinal(_)));

        let period = store
            .find_period(PeriodKey::current(user, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(period.paid_count, 1);
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_settle_does_not_resurrect_deleted_listing() {
        let store = store().await;
        let now = OffsetDateTime::now_utc();
        let user = Uuid::new_v4();
        let listing = draft(&store, user, now).await;
        let payment = Payment::new_pending(
            user,
            Some(listing.id),
            1000,
            "XOF",
            PaymentMethod::OrangeMoney,
            now,
        );
        store
            .open_listing_payment(listing.id, user, &payment, now)
            .await
            .unwrap();
        store
            .transition_listing(
                listing.id,
                &[ListingStatus::PendingPayment],
                ListingStatus::Deleted,
                None,
                now,
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .settle_payment_success(payment.id, 3, now + Duration::days(30), now)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SettleOutcome::Settled { activated: None, .. }
        ));
        assert_eq!(
            store.find_listing(listing.id).await.unwrap().unwrap().status,
            ListingStatus::Deleted
        );
        assert!(store
            .find_period(PeriodKey::current(user, now))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_stale_pending_check_follows_injected_clock() {
        let store = store().await;
        let now = OffsetDateTime::now_utc();
        let payment =
            Payment::new_pending(Uuid::new_v4(), None, 1000, "XOF", PaymentMethod::Wave, now);
        store.insert_payment(&payment).await.unwrap();

        let clock = ManualClock::new(now);
        let checker = InvariantChecker::new(store.pool().clone(), Arc::new(clock.clone()));
        let flags_payment = |violations: &[crate::invariants::InvariantViolation]| {
            violations
                .iter()
                .any(|v| v.context["payment_id"] == serde_json::json!(payment.id))
        };

        let violations = checker.run_check("no_stale_pending_payments").await.unwrap();
        assert!(!flags_payment(&violations));

        clock.advance(Duration::hours(2));
        assert!(clock.now() > payment.expires_at + Duration::hours(1));
        let violations = checker.run_check("no_stale_pending_payments").await.unwrap();
        assert!(flags_payment(&violations));
    }
}
