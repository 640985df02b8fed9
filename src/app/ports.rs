use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Payment status as reported by the gateway when asked directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    Pending,
    WaitingForCapture,
    Succeeded,
    Canceled,
    /// Anything the gateway reports that this service does not act on.
    #[serde(other)]
    Unknown,
}

/// Authoritative payment record fetched from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub id: String,
    pub status: GatewayPaymentStatus,
    pub amount: i64,
    pub currency: String,
    /// Full provider response, stored on the order when it transitions.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePaymentRequest {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    pub buyer_email: String,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub promo_code: Option<String>,
    /// Sent as the gateway idempotence key.
    pub idempotence_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedPayment {
    pub id: String,
    pub confirmation_url: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGatewayPort: Send + Sync {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatedPayment>;
    /// Fetch the current payment record. Network or auth failures are errors.
    async fn get_payment(&self, payment_id: &str) -> Result<VerifiedPayment>;
}

#[async_trait]
pub trait ObjectStorePort: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    /// Time-limited GET link for `key`.
    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String>;
}

#[async_trait]
pub trait MailerPort: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}
