//! Listing routes: creation, publication and owner actions

use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use teranga_monetization::{Listing, ListingStatus, NewListing, PaymentMethod, PublishOutcome};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAYMENT_METHOD: PaymentMethod = PaymentMethod::Wave;

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    /// Used only when the listing ends up behind a payment
    pub payment_method: Option<PaymentMethod>,
}

impl PublishRequest {
    /// Empty bodies are allowed; the default method applies
    fn from_body(body: &Bytes) -> ApiResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Validation(format!("invalid publish request: {}", e)))
    }

    fn method(&self) -> PaymentMethod {
        self.payment_method.unwrap_or(DEFAULT_PAYMENT_METHOD)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishResponse {
    PublishedFree {
        listing: Listing,
    },
    DraftPaymentRequired {
        listing: Listing,
        payment_id: Uuid,
        transaction_id: String,
        amount: i64,
        currency: String,
        payment_method: PaymentMethod,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
        /// Absent when the checkout could not be initiated
        redirect_url: Option<String>,
    },
}

impl From<PublishOutcome> for PublishResponse {
    fn from(outcome: PublishOutcome) -> Self {
        match outcome {
            PublishOutcome::PublishedFree { listing } => PublishResponse::PublishedFree { listing },
            PublishOutcome::PaymentRequired {
                listing,
                payment,
                checkout,
            } => PublishResponse::DraftPaymentRequired {
                listing,
                payment_id: payment.id,
                transaction_id: payment.transaction_id,
                amount: payment.amount,
                currency: payment.currency,
                payment_method: payment.method,
                expires_at: payment.expires_at,
                redirect_url: checkout.and_then(|c| c.redirect_url),
            },
        }
    }
}

/// POST /listings
pub async fn create_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(fields): Json<NewListing>,
) -> ApiResult<(StatusCode, Json<Listing>)> {
    let listing = state
        .monetization
        .listings
        .create(auth_user.user_id, fields)
        .await?;

    Ok((StatusCode::CREATED, Json(listing)))
}

/// GET /listings/{id}
///
/// Only live listings are visible to other users.
pub async fn get_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Listing>> {
    let listing = state.monetization.listings.get(listing_id).await?;

    let visible = listing.status == ListingStatus::Active
        || listing.user_id == auth_user.user_id
        || auth_user.is_admin();
    if !visible {
        return Err(ApiError::NotFound(format!("listing {}", listing_id)));
    }

    Ok(Json(listing))
}

/// POST /listings/{id}/publish
pub async fn publish_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<PublishResponse>> {
    let request = PublishRequest::from_body(&body)?;

    let outcome = state
        .monetization
        .listings
        .request_publish(listing_id, auth_user.user_id, request.method())
        .await?;

    Ok(Json(outcome.into()))
}

/// POST /listings/{id}/retry-payment
pub async fn retry_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<PublishResponse>> {
    let request = PublishRequest::from_body(&body)?;

    let outcome = state
        .monetization
        .listings
        .retry_payment(listing_id, auth_user.user_id, request.method())
        .await?;

    Ok(Json(outcome.into()))
}

/// POST /listings/{id}/sold
pub async fn mark_sold(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Listing>> {
    let listing = state
        .monetization
        .listings
        .mark_sold(listing_id, auth_user.user_id)
        .await?;

    Ok(Json(listing))
}

/// DELETE /listings/{id}
pub async fn delete_listing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Listing>> {
    let listing = state
        .monetization
        .listings
        .delete(listing_id, auth_user.user_id)
        .await?;

    Ok(Json(listing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_publish_body_uses_default_method() {
        let request = PublishRequest::from_body(&Bytes::from_static(b"")).unwrap();
        assert_eq!(request.method(), PaymentMethod::Wave);

        let request = PublishRequest::from_body(&Bytes::from_static(b"  \n")).unwrap();
        assert_eq!(request.method(), PaymentMethod::Wave);
    }

    #[test]
    fn test_publish_body_selects_method() {
        let body = Bytes::from_static(br#"{"payment_method":"orange_money"}"#);
        let request = PublishRequest::from_body(&body).unwrap();
        assert_eq!(request.method(), PaymentMethod::OrangeMoney);
    }

    #[test]
    fn test_payment_required_carries_checkout_redirect() {
        use teranga_monetization::{GatewayCheckout, Payment};

        let now = OffsetDateTime::now_utc();
        let user_id = Uuid::new_v4();
        let listing = Listing {
            id: Uuid::new_v4(),
            user_id,
            category_id: Uuid::new_v4(),
            title: "Réfrigérateur LG".to_string(),
            description: None,
            price: Some(180_000),
            status: ListingStatus::PendingPayment,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        let payment =
            Payment::new_pending(user_id, Some(listing.id), 1000, "XOF", PaymentMethod::Wave, now);

        let with_checkout = PublishResponse::from(PublishOutcome::PaymentRequired {
            listing: listing.clone(),
            payment: payment.clone(),
            checkout: Some(GatewayCheckout {
                reference: "chk_1".to_string(),
                redirect_url: Some("https://pay.example/chk_1".to_string()),
            }),
        });
        let PublishResponse::DraftPaymentRequired { redirect_url, .. } = with_checkout else {
            panic!("expected draft_payment_required");
        };
        assert_eq!(redirect_url.as_deref(), Some("https://pay.example/chk_1"));

        let without_checkout = PublishResponse::from(PublishOutcome::PaymentRequired {
            listing,
            payment,
            checkout: None,
        });
        let PublishResponse::DraftPaymentRequired { redirect_url, .. } = without_checkout else {
            panic!("expected draft_payment_required");
        };
        assert!(redirect_url.is_none());
    }

    #[test]
    fn test_unknown_method_is_a_validation_error() {
        let body = Bytes::from_static(br#"{"payment_method":"cash"}"#);
        assert!(matches!(
            PublishRequest::from_body(&body),
            Err(ApiError::Validation(_))
        ));
    }
}
