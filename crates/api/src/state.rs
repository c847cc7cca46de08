//! Application state

use std::sync::Arc;

use teranga_monetization::{
    CacheInvalidator, Clock, DisabledGateway, HmacSignatureVerifier, HttpPaymentGateway,
    InvariantChecker, MonetizationResult, MonetizationService, MonetizationStore, PaymentGateway,
    Provider,
};

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub monetization: MonetizationService,
    /// Only available when backed by Postgres
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(
        config: Config,
        monetization: MonetizationService,
        invariants: Option<InvariantChecker>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        Self {
            config,
            jwt_manager,
            monetization,
            invariants: invariants.map(Arc::new),
        }
    }

    /// Wire the monetization components from configuration
    pub fn build_monetization(
        config: &Config,
        store: Arc<dyn MonetizationStore>,
        cache: Arc<dyn CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> MonetizationResult<MonetizationService> {
        let verifier = signature_verifier(config);
        let gateway = payment_gateway(config)?;

        Ok(MonetizationService::new(
            store,
            gateway,
            Arc::new(verifier),
            cache,
            clock,
        ))
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}

fn signature_verifier(config: &Config) -> HmacSignatureVerifier {
    let verifier = HmacSignatureVerifier::new()
        .with_secret(Provider::Wave, config.wave_webhook_secret.as_str())
        .with_secret(Provider::OrangeMoney, config.orange_money_webhook_secret.as_str())
        .with_secret(Provider::FreeMoney, config.free_money_webhook_secret.as_str());

    for provider in [Provider::Wave, Provider::OrangeMoney, Provider::FreeMoney] {
        if !verifier.is_configured(provider) {
            tracing::warn!(
                provider = %provider,
                "Webhook secret not configured - deliveries from this provider will be rejected"
            );
        }
    }

    verifier
}

fn payment_gateway(config: &Config) -> MonetizationResult<Arc<dyn PaymentGateway>> {
    match &config.payment_gateway_url {
        Some(url) => {
            let gateway =
                HttpPaymentGateway::new(url.as_str(), config.payment_gateway_api_key.clone())?;
            tracing::info!(url = %url, "Payment gateway checkout enabled");
            Ok(Arc::new(gateway))
        }
        None => {
            tracing::warn!(
                "PAYMENT_GATEWAY_URL not set - publish responses carry no checkout link"
            );
            Ok(Arc::new(DisabledGateway))
        }
    }
}
