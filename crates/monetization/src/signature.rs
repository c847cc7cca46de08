//! Webhook signature verification
//!
//! Runs before any payload parsing or lookup. Providers post a hex-encoded
//! HMAC-SHA256 of the raw body in the `X-Signature` header.

use std::collections::HashMap;
use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{MonetizationError, MonetizationResult};
use crate::providers::Provider;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider signature
pub const SIGNATURE_HEADER: &str = "x-signature";

pub trait SignatureVerifier: Send + Sync + fmt::Debug {
    fn verify(
        &self,
        provider: Provider,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> MonetizationResult<()>;
}

/// Per-provider shared-secret HMAC verification
#[derive(Clone, Default)]
pub struct HmacSignatureVerifier {
    secrets: HashMap<Provider, String>,
}

impl fmt::Debug for HmacSignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<&str> = self.secrets.keys().map(Provider::as_str).collect();
        providers.sort_unstable();
        f.debug_struct("HmacSignatureVerifier")
            .field("providers", &providers)
            .finish()
    }
}

impl HmacSignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider secret; empty secrets are ignored
    pub fn with_secret(mut self, provider: Provider, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.insert(provider, secret);
        }
        self
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.secrets.contains_key(&provider)
    }
}

impl SignatureVerifier for HmacSignatureVerifier {
    fn verify(
        &self,
        provider: Provider,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> MonetizationResult<()> {
        let Some(secret) = self.secrets.get(&provider) else {
            tracing::error!(provider = %provider, "No webhook secret configured for provider");
            return Err(MonetizationError::SignatureInvalid);
        };

        let signature = signature.ok_or_else(|| {
            tracing::warn!(provider = %provider, "Webhook without signature header");
            MonetizationError::SignatureInvalid
        })?;

        let received = hex::decode(signature.trim().trim_start_matches("sha256="))
            .map_err(|_| MonetizationError::SignatureInvalid)?;
        let expected = compute(secret, raw_body)?;

        if expected.ct_eq(&received).into() {
            Ok(())
        } else {
            tracing::warn!(provider = %provider, "Webhook signature mismatch");
            Err(MonetizationError::SignatureInvalid)
        }
    }
}

/// Hex signature of `body` under `secret`, as a provider would send it
pub fn sign(secret: &str, body: &[u8]) -> MonetizationResult<String> {
    Ok(hex::encode(compute(secret, body)?))
}

fn compute(secret: &str, body: &[u8]) -> MonetizationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| MonetizationError::Config(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> HmacSignatureVerifier {
        HmacSignatureVerifier::new().with_secret(Provider::Wave, "wave_test_secret")
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"data":{}}"#;
        let sig = sign("wave_test_secret", body).unwrap();
        assert!(verifier().verify(Provider::Wave, body, Some(&sig)).is_ok());

        let prefixed = format!("sha256={}", sig);
        assert!(verifier().verify(Provider::Wave, body, Some(&prefixed)).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let sig = sign("wave_test_secret", b"original").unwrap();
        let result = verifier().verify(Provider::Wave, b"tampered", Some(&sig));
        assert!(matches!(result, Err(MonetizationError::SignatureInvalid)));
    }

    #[test]
    fn test_missing_or_garbage_signature() {
        assert!(verifier().verify(Provider::Wave, b"{}", None).is_err());
        assert!(verifier()
            .verify(Provider::Wave, b"{}", Some("not-hex"))
            .is_err());
    }

    #[test]
    fn test_unconfigured_provider_rejected() {
        let sig = sign("wave_test_secret", b"{}").unwrap();
        assert!(!verifier().is_configured(Provider::FreeMoney));
        assert!(verifier()
            .verify(Provider::FreeMoney, b"{}", Some(&sig))
            .is_err());
    }

    #[test]
    fn test_empty_secret_ignored() {
        let v = HmacSignatureVerifier::new().with_secret(Provider::OrangeMoney, "");
        assert!(!v.is_configured(Provider::OrangeMoney));
    }
}
