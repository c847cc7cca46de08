//! Scheduled job bodies

use std::sync::Arc;

use teranga_monetization::{ExpirySweeper, InvariantChecker, SweepReport, ViolationSeverity};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Runs the expiry sweep, skipping a tick while the previous run is still going
#[derive(Clone)]
pub struct SweepJob {
    sweeper: ExpirySweeper,
    running: Arc<Mutex<()>>,
}

impl SweepJob {
    pub fn new(sweeper: ExpirySweeper) -> Self {
        Self {
            sweeper,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// `None` when the tick was skipped
    pub async fn run(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous expiry sweep still running - skipping this tick");
            return None;
        };

        // The sweeper logs its own summary
        Some(self.sweeper.run().await)
    }
}

pub async fn run_invariant_checks(checker: &InvariantChecker) {
    match checker.run_all_checks().await {
        Ok(summary) if summary.healthy => {
            info!(checks_run = summary.checks_run, "Invariant checks passed");
        }
        Ok(summary) => {
            warn!(
                checks_run = summary.checks_run,
                checks_failed = summary.checks_failed,
                "Invariant checks found violations"
            );
            for violation in &summary.violations {
                match violation.severity {
                    ViolationSeverity::Critical | ViolationSeverity::High => error!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        users = violation.user_ids.len(),
                        context = %violation.context,
                        "RECONCILIATION NEEDED: {}",
                        violation.description
                    ),
                    ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        context = %violation.context,
                        "{}",
                        violation.description
                    ),
                }
            }
        }
        Err(e) => error!(error = %e, "Invariant checks failed to run"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use teranga_monetization::{
        Clock, DisabledGateway, HmacSignatureVerifier, ListingStatus, ManualClock, MemoryStore,
        MonetizationService, NewListing, NoopCacheInvalidator, PaymentMethod, PricingConfig,
        PublishOutcome,
    };
    use time::{macros::datetime, Duration};
    use uuid::Uuid;

    /// Launch ended yesterday, so the monthly allowance applies
    fn service(clock: &ManualClock) -> MonetizationService {
        let now = clock.now();
        let store = Arc::new(MemoryStore::new(PricingConfig::launch(
            now - Duration::days(1),
            now - Duration::days(60),
        )));
        MonetizationService::new(
            store,
            Arc::new(DisabledGateway),
            Arc::new(HmacSignatureVerifier::new()),
            Arc::new(NoopCacheInvalidator),
            Arc::new(clock.clone()),
        )
    }

    fn listing() -> NewListing {
        NewListing {
            category_id: Uuid::new_v4(),
            title: "Samsung Galaxy A54".to_string(),
            description: None,
            price: Some(150_000),
        }
    }

    #[tokio::test]
    async fn test_sweep_job_expires_listings_and_times_out_payments() {
        let clock = ManualClock::new(datetime!(2025-09-15 10:00 UTC));
        let svc = service(&clock);
        let user = Uuid::new_v4();

        let live = svc.listings.create(user, listing()).await.unwrap();
        svc.listings
            .request_publish(live.id, user, PaymentMethod::Wave)
            .await
            .unwrap();

        // Use up the allowance so the last publish needs a payment
        for _ in 0..2 {
            let l = svc.listings.create(user, listing()).await.unwrap();
            svc.listings
                .request_publish(l.id, user, PaymentMethod::Wave)
                .await
                .unwrap();
        }
        let waiting = svc.listings.create(user, listing()).await.unwrap();
        let outcome = svc
            .listings
            .request_publish(waiting.id, user, PaymentMethod::Wave)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::PaymentRequired { .. }));

        clock.advance(Duration::days(31));

        let job = SweepJob::new(svc.sweeper.clone());
        let report = job.run().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.listings_expired.processed, 3);
        assert_eq!(report.payments_timed_out.processed, 1);
        assert_eq!(
            svc.listings.get(live.id).await.unwrap().status,
            ListingStatus::Expired
        );
        assert_eq!(
            svc.listings.get(waiting.id).await.unwrap().status,
            ListingStatus::PendingPayment
        );

        // Nothing left to do on the next tick
        let again = job.run().await.unwrap();
        assert_eq!(again.listings_expired.processed, 0);
        assert_eq!(again.payments_timed_out.processed, 0);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let clock = ManualClock::new(datetime!(2025-09-15 10:00 UTC));
        let job = SweepJob::new(service(&clock).sweeper);

        let _held = job.running.lock().await;
        assert!(job.run().await.is_none());
    }
}
