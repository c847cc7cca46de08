//! Monetization phase store
//!
//! Holds the single global pricing configuration and its phase state machine:
//! `launch` → `credit_system` → `paid_system`. Phases only move forward.
//!
//! The stored phase is not authoritative on its own: while the stored flag is
//! still `launch`, the launch is considered over once `launch_end_date` has
//! passed. All reads must go through [`PricingPhaseStore::current_phase`] (or
//! [`PricingConfig::effective_phase`]) so that lazy transition stays in one place.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::{MonetizationError, MonetizationResult};
use crate::store::MonetizationStore;

/// Global monetization stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Listings are free and unlimited until the launch end date
    Launch,
    /// Monthly free allowance, paid listings beyond it
    CreditSystem,
    /// Every listing beyond the free allowance is paid; no further phase
    PaidSystem,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Launch => "launch",
            Phase::CreditSystem => "credit_system",
            Phase::PaidSystem => "paid_system",
        }
    }

    /// The phase that follows this one, if any
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Launch => Some(Phase::CreditSystem),
            Phase::CreditSystem => Some(Phase::PaidSystem),
            Phase::PaidSystem => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = MonetizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launch" => Ok(Phase::Launch),
            "credit_system" => Ok(Phase::CreditSystem),
            "paid_system" => Ok(Phase::PaidSystem),
            other => Err(MonetizationError::Database(format!(
                "unknown pricing phase '{}'",
                other
            ))),
        }
    }
}

/// Stored pricing configuration (singleton row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricingConfig {
    /// Phase flag as stored; see [`PricingConfig::effective_phase`]
    pub phase: Phase,
    #[serde(with = "time::serde::rfc3339")]
    pub launch_end_date: OffsetDateTime,
    pub monthly_free_limit: i32,
    /// Price of one paid listing, in whole units of `currency`
    pub standard_listing_price: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PricingConfig {
    /// Launch-phase configuration with the default allowance and price
    pub fn launch(launch_end_date: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            phase: Phase::Launch,
            launch_end_date,
            monthly_free_limit: DEFAULT_MONTHLY_FREE_LIMIT,
            standard_listing_price: DEFAULT_LISTING_PRICE,
            currency: DEFAULT_CURRENCY.to_string(),
            updated_at: now,
        }
    }

    /// Phase in force at `now`, applying the lazy launch expiry
    pub fn effective_phase(&self, now: OffsetDateTime) -> Phase {
        match self.phase {
            Phase::Launch if now >= self.launch_end_date => Phase::CreditSystem,
            phase => phase,
        }
    }

    pub fn is_launch_active(&self, now: OffsetDateTime) -> bool {
        self.phase == Phase::Launch && now < self.launch_end_date
    }
}

pub const DEFAULT_MONTHLY_FREE_LIMIT: i32 = 3;
pub const DEFAULT_LISTING_PRICE: i64 = 1000;
pub const DEFAULT_CURRENCY: &str = "XOF";

/// Pricing view returned to admins and the quota surface
#[derive(Debug, Clone, Serialize)]
pub struct PricingSnapshot {
    pub stored_phase: Phase,
    pub current_phase: Phase,
    pub launch_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub launch_end_date: OffsetDateTime,
    pub monthly_free_limit: i32,
    pub standard_listing_price: i64,
    pub currency: String,
}

/// Handle to the global pricing configuration
///
/// Cheap to clone; every component that needs pricing holds one of these
/// instead of reading ambient state.
#[derive(Clone)]
pub struct PricingPhaseStore {
    store: Arc<dyn MonetizationStore>,
    clock: Arc<dyn Clock>,
}

impl PricingPhaseStore {
    pub fn new(store: Arc<dyn MonetizationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Raw stored configuration
    pub async fn config(&self) -> MonetizationResult<PricingConfig> {
        self.store.load_pricing().await
    }

    /// Phase in force right now
    pub async fn current_phase(&self) -> MonetizationResult<Phase> {
        let config = self.store.load_pricing().await?;
        Ok(config.effective_phase(self.clock.now()))
    }

    pub async fn is_launch_active(&self) -> MonetizationResult<bool> {
        let config = self.store.load_pricing().await?;
        Ok(config.is_launch_active(self.clock.now()))
    }

    pub async fn snapshot(&self) -> MonetizationResult<PricingSnapshot> {
        let config = self.store.load_pricing().await?;
        let now = self.clock.now();

        Ok(PricingSnapshot {
            stored_phase: config.phase,
            current_phase: config.effective_phase(now),
            launch_active: config.is_launch_active(now),
            launch_end_date: config.launch_end_date,
            monthly_free_limit: config.monthly_free_limit,
            standard_listing_price: config.standard_listing_price,
            currency: config.currency,
        })
    }

    /// Advance to the next phase
    ///
    /// Starts from the effective phase, so an expired launch advances straight
    /// to `paid_system`. The write is conditional on the stored phase being
    /// unchanged since it was read.
    pub async fn transition_to_next(&self) -> MonetizationResult<Phase> {
        let config = self.store.load_pricing().await?;
        let now = self.clock.now();
        let current = config.effective_phase(now);

        let next = current.next().ok_or_else(|| {
            MonetizationError::InvalidTransition(format!(
                "pricing phase is already {}",
                current
            ))
        })?;

        let advanced = self.store.advance_phase(config.phase, next, now).await?;
        if !advanced {
            return Err(MonetizationError::Conflict(
                "pricing phase was changed concurrently".to_string(),
            ));
        }

        tracing::info!(
            from_phase = %current,
            to_phase = %next,
            "Pricing phase advanced"
        );

        Ok(next)
    }

    /// Move the launch end date
    pub async fn extend_launch(
        &self,
        new_end_date: OffsetDateTime,
    ) -> MonetizationResult<PricingConfig> {
        let now = self.clock.now();
        if new_end_date <= now {
            return Err(MonetizationError::InvalidDate(format!(
                "launch end date {} is not in the future",
                new_end_date
            )));
        }

        let config = self.store.load_pricing().await?;
        if config.phase != Phase::Launch {
            return Err(MonetizationError::InvalidTransition(format!(
                "cannot extend launch once phase is {}",
                config.phase
            )));
        }

        if !self.store.set_launch_end_date(new_end_date, now).await? {
            return Err(MonetizationError::InvalidTransition(
                "launch phase ended before the extension was applied".to_string(),
            ));
        }

        tracing::info!(
            previous_end = %config.launch_end_date,
            new_end = %new_end_date,
            "Launch period extended"
        );

        self.store.load_pricing().await
    }

    /// Change the free allowance and listing price
    ///
    /// Existing quota periods keep the limit they were created with.
    pub async fn update_pricing(
        &self,
        monthly_free_limit: i32,
        standard_listing_price: i64,
        currency: &str,
    ) -> MonetizationResult<PricingConfig> {
        if monthly_free_limit < 0 {
            return Err(MonetizationError::InvalidInput(
                "monthly_free_limit must be >= 0".to_string(),
            ));
        }
        if standard_listing_price < 0 {
            return Err(MonetizationError::InvalidInput(
                "standard_listing_price must be >= 0".to_string(),
            ));
        }
        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MonetizationError::InvalidInput(format!(
                "invalid currency code '{}'",
                currency
            )));
        }

        let config = self
            .store
            .update_pricing(
                monthly_free_limit,
                standard_listing_price,
                &currency,
                self.clock.now(),
            )
            .await?;

        tracing::info!(
            monthly_free_limit,
            standard_listing_price,
            currency = %currency,
            "Pricing updated"
        );

        Ok(config)
    }
}
