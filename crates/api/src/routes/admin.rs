//! Admin routes
//!
//! Pricing console, moderation and payment operations. Every route here sits
//! behind `require_auth` and `require_admin`.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use teranga_monetization::{
    InvariantCheckSummary, Listing, MonetizationError, Payment, PricingConfig, PricingSnapshot,
    WebhookEvent, WebhookOutcome,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_EVENT_LIMIT: i64 = 100;
const DEFAULT_REFUND_REASON: &str = "admin_refund";

#[derive(Debug, Deserialize)]
pub struct UpdatePricingRequest {
    pub monthly_free_limit: i32,
    pub standard_listing_price: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtendLaunchRequest {
    /// RFC 3339 timestamp
    pub launch_end_date: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventsQuery {
    pub outcome: Option<String>,
    pub limit: Option<i64>,
}

/// GET /admin/pricing
pub async fn get_pricing(State(state): State<AppState>) -> ApiResult<Json<PricingSnapshot>> {
    Ok(Json(state.monetization.pricing.snapshot().await?))
}

/// PUT /admin/pricing
pub async fn update_pricing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpdatePricingRequest>,
) -> ApiResult<Json<PricingConfig>> {
    let config = state
        .monetization
        .pricing
        .update_pricing(
            req.monthly_free_limit,
            req.standard_listing_price,
            &req.currency,
        )
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        monthly_free_limit = config.monthly_free_limit,
        standard_listing_price = config.standard_listing_price,
        currency = %config.currency,
        "Admin updated pricing"
    );

    Ok(Json(config))
}

/// POST /admin/pricing/advance
pub async fn advance_phase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PricingSnapshot>> {
    let phase = state.monetization.pricing.transition_to_next().await?;
    tracing::info!(admin_id = %auth_user.user_id, phase = %phase, "Admin advanced pricing phase");

    Ok(Json(state.monetization.pricing.snapshot().await?))
}

/// POST /admin/pricing/extend-launch
pub async fn extend_launch(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ExtendLaunchRequest>,
) -> ApiResult<Json<PricingConfig>> {
    let new_end = OffsetDateTime::parse(req.launch_end_date.trim(), &Rfc3339).map_err(|_| {
        ApiError::from(MonetizationError::InvalidDate(format!(
            "'{}' is not an RFC 3339 timestamp",
            req.launch_end_date
        )))
    })?;

    let config = state.monetization.pricing.extend_launch(new_end).await?;
    tracing::info!(
        admin_id = %auth_user.user_id,
        launch_end_date = %config.launch_end_date,
        "Admin extended launch period"
    );

    Ok(Json(config))
}

/// POST /admin/listings/{id}/suspend
pub async fn suspend_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Listing>> {
    let listing = state.monetization.listings.suspend(listing_id).await?;
    tracing::info!(admin_id = %auth_user.user_id, listing_id = %listing_id, "Admin suspended listing");

    Ok(Json(listing))
}

/// DELETE /admin/listings/{id}
pub async fn delete_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Listing>> {
    let listing = state.monetization.listings.admin_delete(listing_id).await?;
    tracing::info!(admin_id = %auth_user.user_id, listing_id = %listing_id, "Admin deleted listing");

    Ok(Json(listing))
}

/// POST /admin/payments/{id}/refund
pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<Payment>> {
    let reason = req
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REFUND_REASON);

    let payment = state.monetization.payments.refund(payment_id, reason).await?;
    tracing::info!(
        admin_id = %auth_user.user_id,
        payment_id = %payment_id,
        reason = %reason,
        "Admin refunded payment"
    );

    Ok(Json(payment))
}

/// GET /admin/webhooks?outcome=&limit=
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<WebhookEventsQuery>,
) -> ApiResult<Json<Vec<WebhookEvent>>> {
    let outcome = query
        .outcome
        .as_deref()
        .map(str::parse::<WebhookOutcome>)
        .transpose()?;

    let events = state
        .monetization
        .webhooks
        .list_events(outcome, query.limit.unwrap_or(DEFAULT_EVENT_LIMIT))
        .await?;

    Ok(Json(events))
}

/// GET /admin/invariants
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state.invariants.as_ref().ok_or_else(|| {
        ApiError::Unavailable("invariant checks require a database".to_string())
    })?;

    let summary = checker.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }

    Ok(Json(summary))
}
