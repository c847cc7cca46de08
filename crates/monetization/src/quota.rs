//! Monthly quota ledger
//!
//! One row per (user, calendar month). Tracks how many free listings the user
//! has consumed against the limit snapshotted when the row was created, and
//! how many paid listings were added.
//!
//! Counters are only ever moved by single conditional updates in the store;
//! nothing here reads a counter, decides, and writes it back.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheInvalidator, CacheKey};
use crate::clock::Clock;
use crate::error::{MonetizationError, MonetizationResult};
use crate::pricing::{Phase, PricingPhaseStore};
use crate::store::MonetizationStore;

/// Earliest year a quota period may belong to
pub const FIRST_QUOTA_YEAR: i32 = 2025;

/// Months of quota history kept by the sweeper
pub const DEFAULT_RETENTION_MONTHS: u32 = 12;

/// Maximum history window served to clients
const MAX_HISTORY_MONTHS: u32 = 24;

/// Unique key of a quota period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodKey {
    pub user_id: Uuid,
    pub month: u8,
    pub year: i32,
}

impl PeriodKey {
    pub fn new(user_id: Uuid, month: u8, year: i32) -> MonetizationResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(MonetizationError::InvalidInput(format!(
                "month {} out of range",
                month
            )));
        }
        if year < FIRST_QUOTA_YEAR {
            return Err(MonetizationError::InvalidInput(format!(
                "year {} is before {}",
                year, FIRST_QUOTA_YEAR
            )));
        }
        Ok(Self {
            user_id,
            month,
            year,
        })
    }

    /// Key of the UTC calendar month containing `now`
    pub fn current(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            month: u8::from(now.month()),
            year: now.year(),
        }
    }

    /// Months since year zero, used for retention comparisons
    pub fn month_index(&self) -> i32 {
        month_index(self.year, self.month)
    }
}

pub(crate) fn month_index(year: i32, month: u8) -> i32 {
    year * 12 + i32::from(month) - 1
}

/// A user's counters for one calendar month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QuotaPeriod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub month: i16,
    pub year: i32,
    pub free_used: i32,
    pub free_limit: i32,
    pub paid_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl QuotaPeriod {
    pub fn new(key: PeriodKey, free_limit: i32, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: key.user_id,
            month: i16::from(key.month),
            year: key.year,
            free_used: 0,
            free_limit,
            paid_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free_remaining(&self) -> i32 {
        (self.free_limit - self.free_used).max(0)
    }

    pub fn has_free_slot(&self) -> bool {
        self.free_used < self.free_limit
    }
}

/// Quota summary for the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub month: u8,
    pub year: i32,
    pub free_used: i32,
    pub free_limit: i32,
    pub free_remaining: i32,
    pub paid_count: i32,
    pub can_create_free: bool,
    pub current_phase: Phase,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn MonetizationStore>,
    pricing: PricingPhaseStore,
    cache: Arc<dyn CacheInvalidator>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn MonetizationStore>,
        pricing: PricingPhaseStore,
        cache: Arc<dyn CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pricing,
            cache,
            clock,
        }
    }

    /// Fetch a period, creating it with the current free limit if absent
    ///
    /// Creation is an upsert on the unique (user, month, year) key; a caller
    /// that loses the race reads the winner's row.
    pub async fn get_or_create(
        &self,
        user_id: Uuid,
        month: u8,
        year: i32,
    ) -> MonetizationResult<QuotaPeriod> {
        let key = PeriodKey::new(user_id, month, year)?;
        let config = self.pricing.config().await?;
        self.store
            .get_or_create_period(key, config.monthly_free_limit, self.clock.now())
            .await
    }

    /// Period for the current calendar month
    pub async fn current_period(&self, user_id: Uuid) -> MonetizationResult<QuotaPeriod> {
        let key = PeriodKey::current(user_id, self.clock.now());
        self.get_or_create(key.user_id, key.month, key.year).await
    }

    /// Whether the next listing can be published for free
    pub async fn can_consume_free(&self, user_id: Uuid) -> MonetizationResult<bool> {
        if self.pricing.is_launch_active().await? {
            return Ok(true);
        }
        let period = self.current_period(user_id).await?;
        Ok(period.has_free_slot())
    }

    /// Consume one free slot in the current period
    ///
    /// During launch the counter still moves but the cap is not enforced.
    pub async fn consume_free(&self, user_id: Uuid) -> MonetizationResult<()> {
        let now = self.clock.now();
        let config = self.pricing.config().await?;
        let key = PeriodKey::current(user_id, now);
        let enforce_cap = !config.is_launch_active(now);

        self.store
            .get_or_create_period(key, config.monthly_free_limit, now)
            .await?;

        if !self.store.consume_free(key, enforce_cap, now).await? {
            tracing::info!(
                user_id = %user_id,
                month = key.month,
                year = key.year,
                "Free listing quota exhausted"
            );
            return Err(MonetizationError::QuotaExceeded);
        }

        self.cache.invalidate(vec![CacheKey::Quota(user_id)]);
        Ok(())
    }

    /// Count one paid listing in the current period
    ///
    /// Unconditional: callers are responsible for not double-counting.
    pub async fn add_paid(&self, user_id: Uuid) -> MonetizationResult<QuotaPeriod> {
        let now = self.clock.now();
        let config = self.pricing.config().await?;
        let period = self
            .store
            .add_paid(
                PeriodKey::current(user_id, now),
                config.monthly_free_limit,
                now,
            )
            .await?;

        self.cache.invalidate(vec![CacheKey::Quota(user_id)]);
        Ok(period)
    }

    /// Delete periods older than `retention_months` before the current month
    pub async fn cleanup(&self, retention_months: u32) -> MonetizationResult<u64> {
        let now = self.clock.now();
        let current = month_index(now.year(), u8::from(now.month()));
        let retention = i32::try_from(retention_months).unwrap_or(i32::MAX);
        let cutoff = current.saturating_sub(retention);

        let deleted = self.store.delete_periods_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, retention_months, "Purged old quota periods");
        }
        Ok(deleted)
    }

    /// Current-month summary
    ///
    /// Does not create the period; a user with no activity this month sees
    /// an empty period with the current limit.
    pub async fn get_status(&self, user_id: Uuid) -> MonetizationResult<QuotaStatus> {
        let now = self.clock.now();
        let config = self.pricing.config().await?;
        let key = PeriodKey::current(user_id, now);
        let period = self
            .store
            .find_period(key)
            .await?
            .unwrap_or_else(|| QuotaPeriod::new(key, config.monthly_free_limit, now));

        let launch_active = config.is_launch_active(now);

        Ok(QuotaStatus {
            month: key.month,
            year: key.year,
            free_used: period.free_used,
            free_limit: period.free_limit,
            free_remaining: period.free_remaining(),
            paid_count: period.paid_count,
            can_create_free: launch_active || period.has_free_slot(),
            current_phase: config.effective_phase(now),
        })
    }

    /// Most recent periods, newest first
    pub async fn get_history(
        &self,
        user_id: Uuid,
        months: u32,
    ) -> MonetizationResult<Vec<QuotaPeriod>> {
        let months = months.clamp(1, MAX_HISTORY_MONTHS);
        self.store.list_periods(user_id, i64::from(months)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCacheInvalidator;
    use crate::clock::ManualClock;
    use crate::pricing::PricingConfig;
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    fn ledger_in(phase: Phase) -> (QuotaLedger, PricingPhaseStore, ManualClock) {
        let now = datetime!(2025-06-15 10:00 UTC);
        let clock = ManualClock::new(now);
        let mut config = PricingConfig::launch(now + Duration::days(10), now);
        config.phase = phase;
        let store: Arc<dyn MonetizationStore> = Arc::new(MemoryStore::new(config));
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let pricing = PricingPhaseStore::new(store.clone(), clock_arc.clone());
        let ledger = QuotaLedger::new(
            store,
            pricing.clone(),
            Arc::new(NoopCacheInvalidator),
            clock_arc,
        );
        (ledger, pricing, clock)
    }

    #[test]
    fn test_period_key_validation() {
        let user = Uuid::new_v4();
        assert!(PeriodKey::new(user, 0, 2025).is_err());
        assert!(PeriodKey::new(user, 13, 2025).is_err());
        assert!(PeriodKey::new(user, 6, 2024).is_err());
        assert!(PeriodKey::new(user, 12, 2025).is_ok());
    }

    #[test]
    fn test_month_index_ordering() {
        assert_eq!(month_index(2026, 1) - month_index(2025, 12), 1);
        assert_eq!(month_index(2026, 6) - month_index(2025, 6), 12);
    }

    #[tokio::test]
    async fn test_get_or_create_snapshots_limit() {
        let (ledger, pricing, _clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        let first = ledger.get_or_create(user, 6, 2025).await.unwrap();
        assert_eq!(first.free_limit, 3);
        assert_eq!(first.free_used, 0);

        // A later pricing change does not touch existing periods
        pricing.update_pricing(10, 1000, "XOF").await.unwrap();
        let again = ledger.get_or_create(user, 6, 2025).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.free_limit, 3);

        let next_month = ledger.get_or_create(user, 7, 2025).await.unwrap();
        assert_eq!(next_month.free_limit, 10);
    }

    #[tokio::test]
    async fn test_consume_free_stops_at_limit() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        for _ in 0..3 {
            assert!(ledger.can_consume_free(user).await.unwrap());
            ledger.consume_free(user).await.unwrap();
        }

        assert!(!ledger.can_consume_free(user).await.unwrap());
        let err = ledger.consume_free(user).await.unwrap_err();
        assert!(matches!(err, MonetizationError::QuotaExceeded));

        let period = ledger.current_period(user).await.unwrap();
        assert_eq!(period.free_used, 3);
    }

    #[tokio::test]
    async fn test_launch_counts_but_never_blocks() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::Launch);
        let user = Uuid::new_v4();

        for _ in 0..5 {
            assert!(ledger.can_consume_free(user).await.unwrap());
            ledger.consume_free(user).await.unwrap();
        }

        let period = ledger.current_period(user).await.unwrap();
        assert_eq!(period.free_used, 5);
        assert_eq!(period.free_remaining(), 0);
    }

    #[tokio::test]
    async fn test_new_month_resets_allowance() {
        let (ledger, _pricing, clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        for _ in 0..3 {
            ledger.consume_free(user).await.unwrap();
        }
        assert!(!ledger.can_consume_free(user).await.unwrap());

        clock.set(datetime!(2025-07-01 00:00 UTC));
        assert!(ledger.can_consume_free(user).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_paid_creates_period_lazily() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::PaidSystem);
        let user = Uuid::new_v4();

        let period = ledger.add_paid(user).await.unwrap();
        assert_eq!(period.paid_count, 1);
        assert_eq!(period.free_used, 0);

        let period = ledger.add_paid(user).await.unwrap();
        assert_eq!(period.paid_count, 2);
    }

    #[tokio::test]
    async fn test_status_without_activity() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        let status = ledger.get_status(user).await.unwrap();
        assert_eq!(status.free_used, 0);
        assert_eq!(status.free_remaining, 3);
        assert!(status.can_create_free);
        assert_eq!(status.current_phase, Phase::CreditSystem);

        // Status is read-only
        assert!(ledger.get_history(user, 12).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        ledger.get_or_create(user, 4, 2025).await.unwrap();
        ledger.get_or_create(user, 6, 2025).await.unwrap();
        ledger.get_or_create(user, 5, 2025).await.unwrap();

        let history = ledger.get_history(user, 2).await.unwrap();
        let months: Vec<i16> = history.iter().map(|p| p.month).collect();
        assert_eq!(months, vec![6, 5]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_retention_window() {
        let (ledger, _pricing, clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();

        ledger.get_or_create(user, 5, 2025).await.unwrap();
        ledger.get_or_create(user, 6, 2025).await.unwrap();

        // June 2026: May 2025 is 13 months old, June 2025 exactly 12
        clock.set(datetime!(2026-06-10 00:00 UTC));
        assert_eq!(ledger.cleanup(DEFAULT_RETENTION_MONTHS).await.unwrap(), 1);
        assert_eq!(ledger.cleanup(DEFAULT_RETENTION_MONTHS).await.unwrap(), 0);

        let remaining = ledger.get_history(user, 24).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].month, 6);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_keeps_everything() {
        let (ledger, _pricing, _clock) = ledger_in(Phase::CreditSystem);
        let user = Uuid::new_v4();
        ledger.get_or_create(user, 1, 2025).await.unwrap();

        // Would wrap to a negative retention if cast
        assert_eq!(ledger.cleanup(u32::MAX).await.unwrap(), 0);
        assert_eq!(ledger.cleanup(i32::MAX as u32 + 1).await.unwrap(), 0);
        assert_eq!(ledger.get_history(user, 24).await.unwrap().len(), 1);
    }
}
