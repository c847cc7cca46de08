// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Teranga Monetization Engine
//!
//! Decides, per user and calendar month, whether a listing is published for
//! free or behind a payment, and reconciles asynchronous mobile-money
//! callbacks so a paid listing goes live exactly once.
//!
//! ## Components
//!
//! - **PricingPhaseStore**: global phase (`launch` → `credit_system` → `paid_system`)
//! - **QuotaLedger**: monthly free/paid counters with an atomic free-slot cap
//! - **ListingLifecycle**: listing state machine and publish decision
//! - **PaymentLedger**: payment attempts and their guarded status transitions
//! - **WebhookReconciler**: idempotent provider callback handling
//! - **ExpirySweeper**: listing expiry, payment timeouts, quota retention

pub mod cache;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod listing;
pub mod payment;
pub mod pricing;
pub mod providers;
pub mod quota;
pub mod signature;
pub mod store;
pub mod sweeper;
pub mod webhooks;


use std::sync::Arc;

// Cache
pub use cache::{CacheInvalidator, CacheKey, NoopCacheInvalidator, RedisCacheInvalidator};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Error
pub use error::{MonetizationError, MonetizationResult};

// Gateway
pub use gateway::{DisabledGateway, GatewayCheckout, HttpPaymentGateway, PaymentGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Listings
pub use listing::{Listing, ListingLifecycle, ListingStatus, NewListing, PublishOutcome};

// Payments
pub use payment::{Payment, PaymentLedger, PaymentMethod, PaymentStatus, PaymentTransition};

// Pricing
pub use pricing::{Phase, PricingConfig, PricingPhaseStore, PricingSnapshot};

// Providers
pub use providers::{CanonicalNotification, Provider, ProviderStatus};

// Quota
pub use quota::{PeriodKey, QuotaLedger, QuotaPeriod, QuotaStatus};

// Signatures
pub use signature::{HmacSignatureVerifier, SignatureVerifier, SIGNATURE_HEADER};

// Store
pub use store::{MemoryStore, MonetizationStore, PgStore};

// Sweeper
pub use sweeper::{ExpirySweeper, SweepCounts, SweepReport};

// Webhooks
pub use webhooks::{
    should_acknowledge, Reconciliation, WebhookEvent, WebhookOutcome, WebhookReconciler,
};

/// All monetization components wired over one store
#[derive(Clone)]
pub struct MonetizationService {
    pub pricing: PricingPhaseStore,
    pub quota: QuotaLedger,
    pub listings: ListingLifecycle,
    pub payments: PaymentLedger,
    pub webhooks: WebhookReconciler,
    pub sweeper: ExpirySweeper,
}

impl MonetizationService {
    pub fn new(
        store: Arc<dyn MonetizationStore>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: Arc<dyn SignatureVerifier>,
        cache: Arc<dyn CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pricing = PricingPhaseStore::new(store.clone(), clock.clone());
        let quota = QuotaLedger::new(store.clone(), pricing.clone(), cache.clone(), clock.clone());
        let payments = PaymentLedger::new(store.clone(), gateway, clock.clone());
        let listings = ListingLifecycle::new(
            store.clone(),
            pricing.clone(),
            quota.clone(),
            payments.clone(),
            cache.clone(),
            clock.clone(),
        );
        let webhooks = WebhookReconciler::new(
            store,
            pricing.clone(),
            payments.clone(),
            verifier,
            cache,
            clock,
        );
        let sweeper = ExpirySweeper::new(listings.clone(), payments.clone(), quota.clone());

        Self {
            pricing,
            quota,
            listings,
            payments,
            webhooks,
            sweeper,
        }
    }
}
