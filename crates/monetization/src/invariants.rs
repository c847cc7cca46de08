//! Monetization invariants
//!
//! Read-only consistency checks over the monetization tables. Safe to run at
//! any time, including after webhook replays; nothing here writes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::MonetizationResult;

/// A single failed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money taken without the matching entitlement
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct OverCapRow {
    user_id: Uuid,
    month: i16,
    year: i32,
    free_used: i32,
    free_limit: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct MultiplePendingRow {
    listing_id: Uuid,
    user_id: Uuid,
    pending_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveWithoutExpiryRow {
    listing_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidNotActiveRow {
    payment_id: Uuid,
    listing_id: Uuid,
    user_id: Uuid,
    amount: i64,
    processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    payment_id: Uuid,
    user_id: Uuid,
    expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanPendingListingRow {
    listing_id: Uuid,
    user_id: Uuid,
}

pub struct InvariantChecker {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub async fn run_all_checks(&self) -> MonetizationResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let mut violations = Vec::new();

        violations.extend(self.check_free_usage_within_cap().await?);
        violations.extend(self.check_single_pending_payment().await?);
        violations.extend(self.check_active_listing_has_expiry().await?);
        violations.extend(self.check_paid_listing_activated().await?);
        violations.extend(self.check_no_stale_pending_payments().await?);
        violations.extend(self.check_pending_listing_has_payment().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Free usage never exceeds the limit outside launch
    ///
    /// Launch-era periods legitimately overrun, so only periods starting
    /// after the launch end date are checked.
    async fn check_free_usage_within_cap(&self) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<OverCapRow> = sqlx::query_as(
            r#"
            SELECT q.user_id, q.month, q.year, q.free_used, q.free_limit
            FROM quota_periods q
            CROSS JOIN pricing_config p
            WHERE q.free_used > q.free_limit
              AND make_date(q.year, q.month, 1) > p.launch_end_date::date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_usage_within_cap".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User used {} free listings against a limit of {} in {}-{:02}",
                    row.free_used, row.free_limit, row.year, row.month
                ),
                context: serde_json::json!({
                    "month": row.month,
                    "year": row.year,
                    "free_used": row.free_used,
                    "free_limit": row.free_limit,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// At most one pending payment per listing
    async fn check_single_pending_payment(&self) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiplePendingRow> = sqlx::query_as(
            r#"
            SELECT listing_id, MIN(user_id::text)::uuid AS user_id, COUNT(*) AS pending_count
            FROM payments
            WHERE status = 'pending' AND listing_id IS NOT NULL
            GROUP BY listing_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Listing {} has {} pending payments",
                    row.listing_id, row.pending_count
                ),
                context: serde_json::json!({
                    "listing_id": row.listing_id,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_active_listing_has_expiry(
        &self,
    ) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveWithoutExpiryRow> = sqlx::query_as(
            r#"
            SELECT id AS listing_id, user_id
            FROM listings
            WHERE status = 'active' AND expires_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_listing_has_expiry".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Active listing {} has no expiry date", row.listing_id),
                context: serde_json::json!({ "listing_id": row.listing_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A successful listing payment left its listing awaiting payment
    async fn check_paid_listing_activated(&self) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidNotActiveRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, l.id AS listing_id, p.user_id, p.amount, p.processed_at
            FROM payments p
            JOIN listings l ON l.id = p.listing_id
            WHERE p.status = 'success'
              AND l.status = 'pending_payment'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_listing_activated".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment {} succeeded but listing {} is still awaiting payment",
                    row.payment_id, row.listing_id
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "listing_id": row.listing_id,
                    "amount": row.amount,
                    "processed_at": row.processed_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Pending payments well past expiry mean the sweeper is not running
    async fn check_no_stale_pending_payments(
        &self,
    ) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, user_id, expires_at
            FROM payments
            WHERE status = 'pending'
              AND expires_at < $1 - INTERVAL '1 hour'
            ORDER BY expires_at
            LIMIT 100
            "#,
        )
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_payments".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment {} is still pending more than an hour after expiry",
                    row.payment_id
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "expires_at": row.expires_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_pending_listing_has_payment(
        &self,
    ) -> MonetizationResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanPendingListingRow> = sqlx::query_as(
            r#"
            SELECT l.id AS listing_id, l.user_id
            FROM listings l
            WHERE l.status = 'pending_payment'
              AND NOT EXISTS (SELECT 1 FROM payments p WHERE p.listing_id = l.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_listing_has_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Listing {} awaits payment but no payment was ever opened",
                    row.listing_id
                ),
                context: serde_json::json!({ "listing_id": row.listing_id }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run one check by name; unknown names yield no violations
    pub async fn run_check(&self, name: &str) -> MonetizationResult<Vec<InvariantViolation>> {
        match name {
            "free_usage_within_cap" => self.check_free_usage_within_cap().await,
            "single_pending_payment" => self.check_single_pending_payment().await,
            "active_listing_has_expiry" => self.check_active_listing_has_expiry().await,
            "paid_listing_activated" => self.check_paid_listing_activated().await,
            "no_stale_pending_payments" => self.check_no_stale_pending_payments().await,
            "pending_listing_has_payment" => self.check_pending_listing_has_payment().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "free_usage_within_cap",
            "single_pending_payment",
            "active_listing_has_expiry",
            "paid_listing_activated",
            "no_stale_pending_payments",
            "pending_listing_has_payment",
        ]
    }
}
