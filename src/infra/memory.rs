//! Adapters that keep everything in process. Used by the `memory`/`log` providers and by tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::app::ports::{
    CreatePaymentRequest, CreatedPayment, GatewayPaymentStatus, MailerPort, ObjectStorePort,
    PaymentGatewayPort, VerifiedPayment,
};
use crate::error::{CifraError, Result};

fn poisoned() -> CifraError {
    CifraError::storage("in-memory adapter lock poisoned")
}

/// Payment gateway double: payments live in a map and their status is set by the caller.
#[derive(Default)]
pub struct InMemoryPaymentGateway {
    payments: Mutex<HashMap<String, VerifiedPayment>>,
    created: Mutex<Vec<CreatePaymentRequest>>,
    unavailable: Mutex<bool>,
    lookups: AtomicUsize,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a payment record.
    pub fn put_payment(&self, payment: VerifiedPayment) -> Result<()> {
        self.payments
            .lock()
            .map_err(|_| poisoned())?
            .insert(payment.id.clone(), payment);
        Ok(())
    }

    /// Register a payment the way the gateway would report it.
    pub fn put(&self, id: &str, status: GatewayPaymentStatus, amount: i64, currency: &str) -> Result<()> {
        self.put_payment(VerifiedPayment {
            id: id.to_string(),
            status,
            amount,
            currency: currency.to_string(),
            raw: serde_json::json!({
                "id": id,
                "status": status,
                "amount": { "value": format!("{amount}.00"), "currency": currency },
            }),
        })
    }

    pub fn set_status(&self, id: &str, status: GatewayPaymentStatus) -> Result<()> {
        let mut payments = self.payments.lock().map_err(|_| poisoned())?;
        let payment = payments
            .get_mut(id)
            .ok_or_else(|| CifraError::not_found("payment", id))?;
        payment.status = status;
        payment.raw["status"] = serde_json::json!(status);
        Ok(())
    }

    /// Simulate the gateway being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        *self.unavailable.lock().map_err(|_| poisoned())? = unavailable;
        Ok(())
    }

    pub fn created_requests(&self) -> Result<Vec<CreatePaymentRequest>> {
        Ok(self.created.lock().map_err(|_| poisoned())?.clone())
    }

    /// Number of `get_payment` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if *self.unavailable.lock().map_err(|_| poisoned())? {
            return Err(CifraError::Gateway {
                message: "payment gateway unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGatewayPort for InMemoryPaymentGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatedPayment> {
        self.check_available()?;
        let id = format!("pay_{}", Uuid::new_v4().simple());
        self.put(&id, GatewayPaymentStatus::Pending, request.amount, &request.currency)?;
        self.created.lock().map_err(|_| poisoned())?.push(request.clone());
        info!("In-memory payment {} created for {}", id, request.amount);
        Ok(CreatedPayment {
            confirmation_url: format!("{}?payment_id={}", request.return_url, id),
            raw: serde_json::json!({ "id": id, "status": "pending" }),
            id,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<VerifiedPayment> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.payments
            .lock()
            .map_err(|_| poisoned())?
            .get(payment_id)
            .cloned()
            .ok_or_else(|| CifraError::Gateway {
                message: format!("payment {payment_id} not found"),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object store double; signed links are `memory://` URLs carrying the TTL.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.lock().map_err(|_| poisoned())?.get(key).cloned())
    }
}

#[async_trait]
impl ObjectStorePort for InMemoryObjectStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects.lock().map_err(|_| poisoned())?.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String> {
        Ok(format!("memory://objects/{key}?expires_in={ttl_secs}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Mailer that records every message. Recipients marked as failing get an error instead.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailer that takes `delay` to accept each message, like a slow provider.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_for(&self, recipient: &str) -> Result<()> {
        self.failing
            .lock()
            .map_err(|_| poisoned())?
            .insert(recipient.to_string());
        Ok(())
    }

    pub fn recover(&self, recipient: &str) -> Result<()> {
        self.failing.lock().map_err(|_| poisoned())?.remove(recipient);
        Ok(())
    }

    pub fn sent(&self) -> Result<Vec<SentEmail>> {
        Ok(self.sent.lock().map_err(|_| poisoned())?.clone())
    }
}

#[async_trait]
impl MailerPort for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().map_err(|_| poisoned())?.contains(to) {
            return Err(CifraError::Email {
                message: format!("mailbox {to} rejected the message"),
            });
        }
        self.sent.lock().map_err(|_| poisoned())?.push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

/// Development mailer: writes the message to the log instead of sending it.
#[derive(Default)]
pub struct LogMailer;

#[async_trait]
impl MailerPort for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        info!(to = %to, subject = %subject, bytes = html.len(), "Email not sent (log provider)");
        Ok(())
    }
}
