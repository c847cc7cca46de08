//! HTTP routes

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

pub mod admin;
pub mod health;
pub mod listings;
pub mod payments;
pub mod quota;

#[cfg(test)]
mod router_tests;

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Providers authenticate with signatures, not bearer tokens.
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/payments/webhook/{provider}", post(payments::provider_webhook));

    let user_routes = Router::new()
        .route("/listings", post(listings::create_listing))
        .route(
            "/listings/{id}",
            get(listings::get_listing).delete(listings::delete_listing),
        )
        .route("/listings/{id}/publish", post(listings::publish_listing))
        .route("/listings/{id}/retry-payment", post(listings::retry_payment))
        .route("/listings/{id}/sold", post(listings::mark_sold))
        .route("/quota", get(quota::get_quota))
        .route("/quota/history", get(quota::get_quota_history))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    let admin_routes = Router::new()
        .route(
            "/admin/pricing",
            get(admin::get_pricing).put(admin::update_pricing),
        )
        .route("/admin/pricing/advance", post(admin::advance_phase))
        .route("/admin/pricing/extend-launch", post(admin::extend_launch))
        .route("/admin/listings/{id}/suspend", post(admin::suspend_listing))
        .route("/admin/listings/{id}", delete(admin::delete_listing))
        .route("/admin/payments/{id}/refund", post(admin::refund_payment))
        .route("/admin/webhooks", get(admin::list_webhook_events))
        .route("/admin/invariants", get(admin::run_invariants))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .merge(admin_routes)
        .with_state(state)
}
