//! Router-level tests
//!
//! Drive the full router (auth middleware included) over the in-memory store
//! with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use teranga_monetization::{
    signature::sign, ManualClock, MemoryStore, NoopCacheInvalidator, PricingConfig,
    SIGNATURE_HEADER,
};
use time::{macros::datetime, Duration};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    auth::{ROLE_ADMIN, ROLE_USER},
    config::Config,
    routes::create_router,
    state::AppState,
};

const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only";
const WAVE_SECRET: &str = "wave_test_secret";

struct TestApp {
    router: Router,
    state: AppState,
}

fn test_config() -> Config {
    Config {
        database_url: None,
        bind_address: "127.0.0.1:0".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_expiry_hours: 1,
        redis_url: None,
        wave_webhook_secret: WAVE_SECRET.to_string(),
        orange_money_webhook_secret: String::new(),
        free_money_webhook_secret: String::new(),
        payment_gateway_url: None,
        payment_gateway_api_key: None,
        allowed_origins: vec![],
        run_migrations: false,
    }
}

/// Launch already over, so the monthly allowance of 3 applies
fn test_app() -> TestApp {
    let now = datetime!(2025-09-15 10:00 UTC);
    let clock = Arc::new(ManualClock::new(now));
    let store = Arc::new(MemoryStore::new(PricingConfig::launch(
        now - Duration::days(1),
        now - Duration::days(90),
    )));

    let config = test_config();
    let monetization =
        AppState::build_monetization(&config, store, Arc::new(NoopCacheInvalidator), clock)
            .unwrap();
    let state = AppState::new(config, monetization, None);

    TestApp {
        router: create_router(state.clone()),
        state,
    }
}

impl TestApp {
    fn token(&self, user_id: Uuid, role: &str) -> String {
        self.state.jwt_manager.generate_token(user_id, role).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn create_listing(&self, token: &str) -> Uuid {
        let (status, body) = self
            .call(
                Method::POST,
                "/listings",
                Some(token),
                Some(json!({
                    "category_id": Uuid::new_v4(),
                    "title": "Toyota Corolla 2012",
                    "price": 4_500_000
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    async fn publish(&self, token: &str, listing_id: Uuid) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            &format!("/listings/{}/publish", listing_id),
            Some(token),
            None,
        )
        .await
    }

    async fn wave_webhook(&self, payload: Value, secret: &str) -> (StatusCode, Value) {
        let raw = payload.to_string();
        let signature = sign(secret, raw.as_bytes()).unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook/wave")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(raw))
            .unwrap();
        self.send(request).await
    }
}

fn wave_success(transaction_id: &str, amount: i64) -> Value {
    json!({
        "type": "checkout.session.completed",
        "data": {
            "client_reference": transaction_id,
            "payment_status": "succeeded",
            "amount": amount.to_string()
        }
    })
}

#[tokio::test]
async fn test_health_reports_effective_phase() {
    let app = test_app();
    let (status, body) = app.call(Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["phase"], "credit_system");
}

#[tokio::test]
async fn test_listing_routes_require_bearer_token() {
    let app = test_app();

    let (status, body) = app
        .call(Method::POST, "/listings", None, Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = app
        .call(Method::GET, "/quota", Some("not-a-jwt"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_publish_is_free_until_allowance_runs_out() {
    let app = test_app();
    let token = app.token(Uuid::new_v4(), ROLE_USER);

    for _ in 0..3 {
        let listing_id = app.create_listing(&token).await;
        let (status, body) = app.publish(&token, listing_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "published_free");
        assert_eq!(body["listing"]["status"], "active");
    }

    let listing_id = app.create_listing(&token).await;
    let (status, body) = app.publish(&token, listing_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "draft_payment_required");
    assert_eq!(body["amount"], 1000);
    assert_eq!(body["currency"], "XOF");
    assert_eq!(body["payment_method"], "wave");
    assert_eq!(body["listing"]["status"], "pending_payment");
    assert!(body["redirect_url"].is_null());

    let (status, quota) = app.call(Method::GET, "/quota", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quota["free_used"], 3);
    assert_eq!(quota["free_remaining"], 0);
    assert_eq!(quota["can_create_free"], false);
}

#[tokio::test]
async fn test_publish_with_bank_card_is_bad_request() {
    let app = test_app();
    let token = app.token(Uuid::new_v4(), ROLE_USER);
    let listing_id = app.create_listing(&token).await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/listings/{}/publish", listing_id),
            Some(&token),
            Some(json!({ "payment_method": "bank_card" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

    let (status, listing) = app
        .call(Method::GET, &format!("/listings/{}", listing_id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["status"], "draft");
}

#[tokio::test]
async fn test_publish_by_non_owner_is_forbidden() {
    let app = test_app();
    let owner = app.token(Uuid::new_v4(), ROLE_USER);
    let other = app.token(Uuid::new_v4(), ROLE_USER);

    let listing_id = app.create_listing(&owner).await;
    let (status, _) = app.publish(&other, listing_id).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Drafts are hidden from other users
    let (status, _) = app
        .call(
            Method::GET,
            &format!("/listings/{}", listing_id),
            Some(&other),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_republishing_active_listing_conflicts() {
    let app = test_app();
    let token = app.token(Uuid::new_v4(), ROLE_USER);

    let listing_id = app.create_listing(&token).await;
    let (status, _) = app.publish(&token, listing_id).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.publish(&token, listing_id).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);
}

#[tokio::test]
async fn test_wave_success_webhook_activates_listing() {
    let app = test_app();
    let token = app.token(Uuid::new_v4(), ROLE_USER);

    for _ in 0..3 {
        let listing_id = app.create_listing(&token).await;
        app.publish(&token, listing_id).await;
    }
    let listing_id = app.create_listing(&token).await;
    let (_, publish) = app.publish(&token, listing_id).await;
    let transaction_id = publish["transaction_id"].as_str().unwrap().to_string();

    let (status, body) = app
        .wave_webhook(wave_success(&transaction_id, 1000), WAVE_SECRET)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");

    let (_, listing) = app
        .call(
            Method::GET,
            &format!("/listings/{}", listing_id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(listing["status"], "active");

    // Redelivery is acknowledged without another activation
    let (status, body) = app
        .wave_webhook(wave_success(&transaction_id, 1000), WAVE_SECRET)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");

    let (_, quota) = app.call(Method::GET, "/quota", Some(&token), None).await;
    assert_eq!(quota["paid_count"], 1);
}

#[tokio::test]
async fn test_webhook_with_bad_signature_is_rejected() {
    let app = test_app();
    let (status, _) = app
        .wave_webhook(wave_success("TRG-UNKNOWN", 1000), "wrong-secret")
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unmatched_webhook_is_acknowledged() {
    let app = test_app();
    let (status, body) = app
        .wave_webhook(wave_success("TRG-NOT-OURS", 1000), WAVE_SECRET)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unmatched");
}

#[tokio::test]
async fn test_webhook_for_unknown_provider_is_bad_request() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/payments/webhook/paypal")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = test_app();
    let user = app.token(Uuid::new_v4(), ROLE_USER);
    let admin = app.token(Uuid::new_v4(), ROLE_ADMIN);

    let (status, _) = app
        .call(Method::GET, "/admin/pricing", Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .call(Method::GET, "/admin/pricing", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_phase"], "credit_system");
    assert_eq!(body["monthly_free_limit"], 3);
}

#[tokio::test]
async fn test_admin_advances_phase_and_rejects_late_launch_extension() {
    let app = test_app();
    let admin = app.token(Uuid::new_v4(), ROLE_ADMIN);

    let (status, body) = app
        .call(Method::POST, "/admin/pricing/advance", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_phase"], "paid_system");

    let (status, _) = app
        .call(
            Method::POST,
            "/admin/pricing/extend-launch",
            Some(&admin),
            Some(json!({ "launch_end_date": "2030-01-01T00:00:00Z" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .call(
            Method::POST,
            "/admin/pricing/extend-launch",
            Some(&admin),
            Some(json!({ "launch_end_date": "next tuesday" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_webhook_log_filters_by_outcome() {
    let app = test_app();
    let admin = app.token(Uuid::new_v4(), ROLE_ADMIN);

    app.wave_webhook(wave_success("TRG-NOT-OURS", 1000), WAVE_SECRET)
        .await;

    let (status, body) = app
        .call(
            Method::GET,
            "/admin/webhooks?outcome=unmatched",
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["provider"], "wave");

    let (status, _) = app
        .call(
            Method::GET,
            "/admin/webhooks?outcome=bogus",
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invariants_unavailable_without_database() {
    let app = test_app();
    let admin = app.token(Uuid::new_v4(), ROLE_ADMIN);

    let (status, _) = app
        .call(Method::GET, "/admin/invariants", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
