//! Periodic expiry sweep
//!
//! Three independent sub-sweeps: overdue listings, timed-out payments and
//! old quota periods. A failure in one is recorded in the report and does not
//! stop the others. Re-running is always safe.

use serde::Serialize;

use crate::listing::ListingLifecycle;
use crate::payment::PaymentLedger;
use crate::quota::{QuotaLedger, DEFAULT_RETENTION_MONTHS};

/// Rows fetched per sweep batch
pub(crate) const SWEEP_BATCH_SIZE: i64 = 500;

/// Per-row outcome counts of a sub-sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub listings_expired: SweepCounts,
    pub payments_timed_out: SweepCounts,
    pub quota_periods_deleted: u64,
    /// Sub-sweeps that aborted, with their error
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self.listings_expired.failed == 0
            && self.payments_timed_out.failed == 0
    }
}

#[derive(Clone)]
pub struct ExpirySweeper {
    listings: ListingLifecycle,
    payments: PaymentLedger,
    quota: QuotaLedger,
    retention_months: u32,
}

impl ExpirySweeper {
    pub fn new(listings: ListingLifecycle, payments: PaymentLedger, quota: QuotaLedger) -> Self {
        Self {
            listings,
            payments,
            quota,
            retention_months: DEFAULT_RETENTION_MONTHS,
        }
    }

    pub fn with_retention_months(mut self, months: u32) -> Self {
        self.retention_months = months;
        self
    }

    pub async fn run(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.listings.sweep_expired().await {
            Ok(counts) => report.listings_expired = counts,
            Err(e) => {
                tracing::error!(error = %e, "Listing expiry sweep aborted");
                report.errors.push(format!("listings: {}", e));
            }
        }

        match self.payments.sweep_expired_pending().await {
            Ok(counts) => report.payments_timed_out = counts,
            Err(e) => {
                tracing::error!(error = %e, "Payment timeout sweep aborted");
                report.errors.push(format!("payments: {}", e));
            }
        }

        match self.quota.cleanup(self.retention_months).await {
            Ok(deleted) => report.quota_periods_deleted = deleted,
            Err(e) => {
                tracing::error!(error = %e, "Quota retention sweep aborted");
                report.errors.push(format!("quota: {}", e));
            }
        }

        tracing::info!(
            listings_expired = report.listings_expired.processed,
            listings_failed = report.listings_expired.failed,
            payments_timed_out = report.payments_timed_out.processed,
            payments_failed = report.payments_timed_out.failed,
            quota_periods_deleted = report.quota_periods_deleted,
            errors = report.errors.len(),
            "Expiry sweep complete"
        );

        report
    }
}
