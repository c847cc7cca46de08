//! Mobile-money provider adapters
//!
//! Each provider posts its own JSON shape. Adapters reduce it to a
//! [`CanonicalNotification`] and the reconciler only ever sees that.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{MonetizationError, MonetizationResult};
use crate::payment::PaymentMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Wave,
    OrangeMoney,
    FreeMoney,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Wave, Provider::OrangeMoney, Provider::FreeMoney];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Wave => "wave",
            Provider::OrangeMoney => "orange_money",
            Provider::FreeMoney => "free_money",
        }
    }

    /// Payment method a payment must carry to be settled by this provider
    pub fn method(&self) -> PaymentMethod {
        match self {
            Provider::Wave => PaymentMethod::Wave,
            Provider::OrangeMoney => PaymentMethod::OrangeMoney,
            Provider::FreeMoney => PaymentMethod::FreeMoney,
        }
    }

    /// Provider whose webhooks settle payments made with `method`
    pub fn for_method(method: PaymentMethod) -> Option<Provider> {
        Provider::ALL.into_iter().find(|p| p.method() == method)
    }

    /// Reduce a raw webhook body to the canonical notification
    pub fn parse(&self, raw: &[u8]) -> MonetizationResult<CanonicalNotification> {
        let notification = match self {
            Provider::Wave => serde_json::from_slice::<WavePayload>(raw)?.into_canonical()?,
            Provider::OrangeMoney => {
                serde_json::from_slice::<OrangeMoneyPayload>(raw)?.into_canonical()?
            }
            Provider::FreeMoney => {
                serde_json::from_slice::<FreeMoneyPayload>(raw)?.into_canonical()?
            }
        };

        if notification.transaction_id.trim().is_empty() {
            return Err(MonetizationError::InvalidPayload(
                "empty transaction id".to_string(),
            ));
        }
        Ok(notification)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = MonetizationError;

    /// Accepts the path segment used in the webhook URL
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "wave" => Ok(Provider::Wave),
            "orange_money" | "orange" => Ok(Provider::OrangeMoney),
            "free_money" | "free" => Ok(Provider::FreeMoney),
            _ => Err(MonetizationError::UnsupportedProvider(s.to_string())),
        }
    }
}

/// Provider-independent webhook content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalNotification {
    pub transaction_id: String,
    /// Status in the provider's own vocabulary
    pub status: String,
    /// Whole currency units; `None` when the provider omitted it
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

/// Canonical outcome of a provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Success,
    Failed,
    Cancelled,
}

impl ProviderStatus {
    pub fn classify(raw: &str) -> MonetizationResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "successful" | "completed" | "complete" => {
                Ok(ProviderStatus::Success)
            }
            "failed" | "failure" | "error" | "expired" => Ok(ProviderStatus::Failed),
            "cancelled" | "canceled" => Ok(ProviderStatus::Cancelled),
            _ => Err(MonetizationError::UnknownStatus(raw.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WavePayload {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    data: WaveData,
}

#[derive(Debug, Deserialize)]
struct WaveData {
    client_reference: String,
    payment_status: String,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    last_payment_error: Option<WaveError>,
}

#[derive(Debug, Deserialize)]
struct WaveError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl WavePayload {
    fn into_canonical(self) -> MonetizationResult<CanonicalNotification> {
        // A payment_failed event can still carry payment_status=processing
        let status = match self.event_type.as_deref() {
            Some("checkout.session.payment_failed") => "failed".to_string(),
            _ => self.data.payment_status,
        };
        let reason = self
            .data
            .last_payment_error
            .and_then(|e| e.message.or(e.code));

        Ok(CanonicalNotification {
            transaction_id: self.data.client_reference,
            status,
            amount: self.data.amount.as_ref().map(parse_amount).transpose()?,
            reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OrangeMoneyPayload {
    status: String,
    /// Our transaction id, echoed back
    order_id: String,
    /// Orange's own reference
    #[serde(default)]
    txnid: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl OrangeMoneyPayload {
    fn into_canonical(self) -> MonetizationResult<CanonicalNotification> {
        let reason = self.message.or_else(|| self.txnid.map(|t| format!("txnid {}", t)));
        Ok(CanonicalNotification {
            transaction_id: self.order_id,
            status: self.status,
            amount: self.amount.as_ref().map(parse_amount).transpose()?,
            reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FreeMoneyPayload {
    transaction_id: String,
    status: String,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

impl FreeMoneyPayload {
    fn into_canonical(self) -> MonetizationResult<CanonicalNotification> {
        Ok(CanonicalNotification {
            transaction_id: self.transaction_id,
            status: self.status,
            amount: self.amount.as_ref().map(parse_amount).transpose()?,
            reason: self.reason,
        })
    }
}

/// Accepts `1000`, `1000.0` or `"1000.00"`; fractional units are rejected
fn parse_amount(value: &Value) -> MonetizationResult<i64> {
    let invalid = || MonetizationError::InvalidPayload(format!("invalid amount {}", value));

    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(v);
            }
            let f = n.as_f64().ok_or_else(invalid)?;
            if f.fract() != 0.0 || f.abs() > i64::MAX as f64 {
                return Err(invalid());
            }
            Ok(f as i64)
        }
        Value::String(s) => {
            let s = s.trim();
            let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
            if !frac.chars().all(|c| c == '0') {
                return Err(invalid());
            }
            whole.parse::<i64>().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_from_path() {
        assert_eq!("wave".parse::<Provider>().unwrap(), Provider::Wave);
        assert_eq!(
            "orange-money".parse::<Provider>().unwrap(),
            Provider::OrangeMoney
        );
        assert_eq!("FREE_MONEY".parse::<Provider>().unwrap(), Provider::FreeMoney);

        let err = "paypal".parse::<Provider>().unwrap_err();
        assert!(matches!(err, MonetizationError::UnsupportedProvider(p) if p == "paypal"));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderStatus::classify("SUCCESS").unwrap(), ProviderStatus::Success);
        assert_eq!(ProviderStatus::classify("completed").unwrap(), ProviderStatus::Success);
        assert_eq!(ProviderStatus::classify("succeeded").unwrap(), ProviderStatus::Success);
        assert_eq!(ProviderStatus::classify("FAILED").unwrap(), ProviderStatus::Failed);
        assert_eq!(ProviderStatus::classify("canceled").unwrap(), ProviderStatus::Cancelled);

        assert!(matches!(
            ProviderStatus::classify("processing"),
            Err(MonetizationError::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_wave_payload() {
        let body = json!({
            "type": "checkout.session.completed",
            "data": {
                "id": "cos-18qq25rgr100a",
                "client_reference": "TRG-ABC",
                "payment_status": "succeeded",
                "amount": "1000"
            }
        });
        let n = Provider::Wave.parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(n.transaction_id, "TRG-ABC");
        assert_eq!(n.status, "succeeded");
        assert_eq!(n.amount, Some(1000));
    }

    #[test]
    fn test_wave_payment_failed_event() {
        let body = json!({
            "type": "checkout.session.payment_failed",
            "data": {
                "client_reference": "TRG-ABC",
                "payment_status": "processing",
                "last_payment_error": {"code": "insufficient-funds", "message": "Insufficient funds"}
            }
        });
        let n = Provider::Wave.parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(n.status, "failed");
        assert_eq!(n.reason.as_deref(), Some("Insufficient funds"));
        assert_eq!(n.amount, None);
    }

    #[test]
    fn test_orange_money_payload() {
        let body = json!({
            "status": "SUCCESS",
            "order_id": "TRG-XYZ",
            "txnid": "MP250101.1234.A00001",
            "amount": 1000
        });
        let n = Provider::OrangeMoney
            .parse(body.to_string().as_bytes())
            .unwrap();
        assert_eq!(n.transaction_id, "TRG-XYZ");
        assert_eq!(n.status, "SUCCESS");
        assert_eq!(n.amount, Some(1000));
    }

    #[test]
    fn test_free_money_payload() {
        let body = json!({
            "transaction_id": "TRG-1",
            "status": "failed",
            "amount": 1000.0,
            "reason": "user_declined"
        });
        let n = Provider::FreeMoney.parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(n.amount, Some(1000));
        assert_eq!(n.reason.as_deref(), Some("user_declined"));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            Provider::Wave.parse(b"not json"),
            Err(MonetizationError::InvalidPayload(_))
        ));
        assert!(matches!(
            Provider::FreeMoney.parse(br#"{"status":"success"}"#),
            Err(MonetizationError::InvalidPayload(_))
        ));
        assert!(matches!(
            Provider::FreeMoney.parse(br#"{"transaction_id":" ","status":"success"}"#),
            Err(MonetizationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(&json!("1000.00")).unwrap(), 1000);
        assert_eq!(parse_amount(&json!(250)).unwrap(), 250);
        assert!(parse_amount(&json!("10.50")).is_err());
        assert!(parse_amount(&json!(10.5)).is_err());
        assert!(parse_amount(&json!(true)).is_err());
    }
}
