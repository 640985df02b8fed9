//! Inbound payment notifications, validated into a closed set of events before use.

use serde::Deserialize;

use crate::constants::{EVENT_PAYMENT_CANCELED, EVENT_PAYMENT_SUCCEEDED};
use crate::error::{CifraError, Result};

#[derive(Debug, Deserialize)]
struct RawNotification {
    event: String,
    #[serde(default)]
    object: Option<RawObject>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(default)]
    id: Option<String>,
}

/// A payment notification. The payload is a trigger only; the gateway is asked for the truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PaymentSucceeded { payment_id: String },
    PaymentCanceled { payment_id: String },
    /// Events this service does not act on; acknowledged and dropped.
    Ignored { event: String },
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw: RawNotification = serde_json::from_slice(body)?;
        let payment_id = || {
            raw.object
                .as_ref()
                .and_then(|o| o.id.as_deref())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    CifraError::Validation(format!("{} notification without payment id", raw.event))
                })
        };

        match raw.event.as_str() {
            EVENT_PAYMENT_SUCCEEDED => Ok(WebhookEvent::PaymentSucceeded {
                payment_id: payment_id()?,
            }),
            EVENT_PAYMENT_CANCELED => Ok(WebhookEvent::PaymentCanceled {
                payment_id: payment_id()?,
            }),
            _ => Ok(WebhookEvent::Ignored {
                event: raw.event.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WebhookEvent::PaymentSucceeded { .. } => EVENT_PAYMENT_SUCCEEDED,
            WebhookEvent::PaymentCanceled { .. } => EVENT_PAYMENT_CANCELED,
            WebhookEvent::Ignored { event } => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_succeeded() {
        let body = br#"{"type":"notification","event":"payment.succeeded","object":{"id":"2c8d-01","status":"succeeded","paid":true}}"#;
        assert_eq!(
            WebhookEvent::parse(body).unwrap(),
            WebhookEvent::PaymentSucceeded {
                payment_id: "2c8d-01".to_string()
            }
        );
    }

    #[test]
    fn test_parse_canceled_and_unknown() {
        let canceled = br#"{"event":"payment.canceled","object":{"id":"p-2"}}"#;
        assert!(matches!(
            WebhookEvent::parse(canceled).unwrap(),
            WebhookEvent::PaymentCanceled { .. }
        ));

        let refund = br#"{"event":"refund.succeeded","object":{"id":"r-1"}}"#;
        let event = WebhookEvent::parse(refund).unwrap();
        assert_eq!(event.name(), "refund.succeeded");
        assert!(matches!(event, WebhookEvent::Ignored { .. }));
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert!(WebhookEvent::parse(b"not json").is_err());
        assert!(WebhookEvent::parse(br#"{"object":{"id":"x"}}"#).is_err());
        assert!(matches!(
            WebhookEvent::parse(br#"{"event":"payment.succeeded","object":{}}"#),
            Err(CifraError::Validation(_))
        ));
        assert!(WebhookEvent::parse(br#"{"event":"payment.succeeded","object":{"id":"  "}}"#).is_err());
    }
}
