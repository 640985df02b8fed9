use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::notification_use_case::{buyer_purchase_email, seller_sale_email, NotificationDispatcher};
use crate::app::ports::{GatewayPaymentStatus, PaymentGatewayPort, VerifiedPayment};
use crate::app::webhook::WebhookEvent;
use crate::constants::{DOWNLOAD_TOKEN_BYTES, DOWNLOAD_TOKEN_TTL_DAYS};
use crate::domain::*;
use crate::error::CifraError;
use crate::fees::FeeSchedule;
use crate::metrics::FulfillmentMetrics;
use crate::storage::{Fulfillment, FulfillmentCommit, Storage};

#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// The gateway could not confirm what the notification claims. Nothing was written.
    #[error("payment verification failed: {0}")]
    Verification(String),
    /// Reading or committing the ledger failed after verification succeeded.
    #[error("ledger update failed: {0}")]
    Ledger(#[from] CifraError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentOutcome {
    Fulfilled {
        order_id: Uuid,
        sale_id: Uuid,
        token: String,
        platform_fee: i64,
        net_amount: i64,
    },
    /// The order had already left `pending`; no side effects were repeated.
    AlreadyHandled { order_id: Uuid, status: OrderStatus },
    Canceled { order_id: Uuid },
    /// Verified payment did not match the order; the order is now `failed`.
    Failed { order_id: Uuid, reason: String },
    OrderNotFound { payment_id: String },
    Ignored { event: String },
}

#[derive(Debug, Clone)]
pub struct FulfillmentSettings {
    pub fees: FeeSchedule,
    pub token_ttl_days: i64,
    pub site_url: String,
}

impl Default for FulfillmentSettings {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            token_ttl_days: DOWNLOAD_TOKEN_TTL_DAYS,
            site_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Opaque download token: 32 random bytes from the OS generator, hex encoded.
pub fn generate_download_token() -> String {
    let mut bytes = [0u8; DOWNLOAD_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn download_url(site_url: &str, token: &str) -> String {
    format!("{}/download/{}", site_url.trim_end_matches('/'), token)
}

/// Turns verified payment events into ledger changes, exactly once per order.
pub struct FulfillmentEngine {
    storage: Arc<dyn Storage>,
    payments: Arc<dyn PaymentGatewayPort>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    settings: FulfillmentSettings,
}

impl FulfillmentEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        payments: Arc<dyn PaymentGatewayPort>,
        settings: FulfillmentSettings,
    ) -> Self {
        Self {
            storage,
            payments,
            dispatcher: None,
            settings,
        }
    }

    /// Wake the outbox worker right after each fulfillment.
    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn settings(&self) -> &FulfillmentSettings {
        &self.settings
    }

    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        FulfillmentMetrics::record_event_received(event.name());
        match event {
            WebhookEvent::PaymentSucceeded { payment_id } => {
                self.handle_payment_succeeded(payment_id).await
            }
            WebhookEvent::PaymentCanceled { payment_id } => {
                self.handle_payment_canceled(payment_id).await
            }
            WebhookEvent::Ignored { event } => {
                info!(event = %event, "Ignoring payment notification");
                Ok(FulfillmentOutcome::Ignored {
                    event: event.clone(),
                })
            }
        }
    }

    async fn verify(
        &self,
        payment_id: &str,
        expected: GatewayPaymentStatus,
    ) -> Result<VerifiedPayment, FulfillmentError> {
        let payment = self.payments.get_payment(payment_id).await.map_err(|e| {
            FulfillmentMetrics::record_verification_failure();
            error!(payment_id = %payment_id, "Could not verify payment with gateway: {}", e);
            FulfillmentError::Verification(e.to_string())
        })?;

        if payment.status != expected {
            FulfillmentMetrics::record_verification_failure();
            warn!(
                payment_id = %payment_id,
                "Gateway reports {:?}, notification claimed {:?}",
                payment.status,
                expected
            );
            return Err(FulfillmentError::Verification(format!(
                "payment {payment_id} is {:?}, expected {:?}",
                payment.status, expected
            )));
        }
        Ok(payment)
    }

    async fn find_order(&self, payment_id: &str) -> Result<Option<Order>, FulfillmentError> {
        let order = self.storage.find_order_by_payment_id(payment_id).await?;
        if order.is_none() {
            FulfillmentMetrics::record_unknown_order();
            warn!(payment_id = %payment_id, "No order for payment; acknowledging");
        }
        Ok(order)
    }

    fn already_handled(order: &Order) -> FulfillmentOutcome {
        FulfillmentMetrics::record_duplicate_delivery();
        info!(
            order_id = %order.id,
            status = %order.status,
            "Order already handled; skipping repeated notification"
        );
        FulfillmentOutcome::AlreadyHandled {
            order_id: order.id,
            status: order.status,
        }
    }

    pub async fn handle_payment_succeeded(
        &self,
        payment_id: &str,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let payment = self.verify(payment_id, GatewayPaymentStatus::Succeeded).await?;
        self.apply_succeeded(payment_id, payment).await
    }

    pub async fn handle_payment_canceled(
        &self,
        payment_id: &str,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let payment = self.verify(payment_id, GatewayPaymentStatus::Canceled).await?;
        self.apply_canceled(payment_id, payment).await
    }

    /// Settle an order from whatever the gateway currently reports, with a single lookup.
    /// Returns `None` while the payment is still in flight.
    pub async fn reconcile_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<FulfillmentOutcome>, FulfillmentError> {
        let payment = self.payments.get_payment(payment_id).await.map_err(|e| {
            FulfillmentMetrics::record_verification_failure();
            FulfillmentError::Verification(e.to_string())
        })?;
        match payment.status {
            GatewayPaymentStatus::Succeeded => self.apply_succeeded(payment_id, payment).await.map(Some),
            GatewayPaymentStatus::Canceled => self.apply_canceled(payment_id, payment).await.map(Some),
            _ => Ok(None),
        }
    }

    async fn apply_succeeded(
        &self,
        payment_id: &str,
        payment: VerifiedPayment,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let started = Instant::now();
        let Some(order) = self.find_order(payment_id).await? else {
            return Ok(FulfillmentOutcome::OrderNotFound {
                payment_id: payment_id.to_string(),
            });
        };
        if order.status.is_terminal() {
            return Ok(Self::already_handled(&order));
        }

        if payment.amount != order.amount || !payment.currency.eq_ignore_ascii_case(&order.currency) {
            let reason = format!(
                "gateway charged {} {}, order expects {} {}",
                payment.amount, payment.currency, order.amount, order.currency
            );
            let update = OrderUpdate {
                paid_at: None,
                provider_metadata: Some(payment.raw.clone()),
            };
            return match self
                .storage
                .transition_order(order.id, OrderStatus::Pending, OrderStatus::Failed, update)
                .await?
            {
                TransitionOutcome::Applied => {
                    FulfillmentMetrics::record_order_failed();
                    error!(order_id = %order.id, payment_id = %payment_id, "Order failed: {}", reason);
                    Ok(FulfillmentOutcome::Failed {
                        order_id: order.id,
                        reason,
                    })
                }
                TransitionOutcome::Conflict { current } => Ok(Self::already_handled(&Order {
                    status: current,
                    ..order
                })),
            };
        }

        let outcome = self.fulfill(&order, payment.raw, Utc::now()).await?;
        if matches!(outcome, FulfillmentOutcome::Fulfilled { .. }) {
            FulfillmentMetrics::record_order_fulfilled(order.amount, started.elapsed().as_secs_f64());
        }
        Ok(outcome)
    }

    async fn apply_canceled(
        &self,
        payment_id: &str,
        payment: VerifiedPayment,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let Some(order) = self.find_order(payment_id).await? else {
            return Ok(FulfillmentOutcome::OrderNotFound {
                payment_id: payment_id.to_string(),
            });
        };
        if order.status.is_terminal() {
            return Ok(Self::already_handled(&order));
        }

        let update = OrderUpdate {
            paid_at: None,
            provider_metadata: Some(payment.raw),
        };
        match self
            .storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Canceled, update)
            .await?
        {
            TransitionOutcome::Applied => {
                FulfillmentMetrics::record_order_canceled();
                info!(order_id = %order.id, payment_id = %payment_id, "Order canceled");
                Ok(FulfillmentOutcome::Canceled { order_id: order.id })
            }
            TransitionOutcome::Conflict { current } => Ok(Self::already_handled(&Order {
                status: current,
                ..order
            })),
        }
    }

    /// Fulfill a pending order without asking the gateway. Development tooling only.
    pub async fn fulfill_without_verification(
        &self,
        order_id: Uuid,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let order = self
            .storage
            .get_order(order_id)
            .await?
            .ok_or_else(|| CifraError::not_found("order", order_id))?;
        if order.status.is_terminal() {
            return Ok(Self::already_handled(&order));
        }
        let raw = serde_json::json!({
            "id": order.external_payment_id,
            "status": "succeeded",
            "amount": { "value": format!("{}.00", order.amount), "currency": order.currency },
            "test": true,
        });
        warn!(order_id = %order.id, "Fulfilling order without gateway verification");
        self.fulfill(&order, raw, Utc::now()).await
    }

    async fn fulfill(
        &self,
        order: &Order,
        provider_metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let product = self
            .storage
            .get_product(order.product_id)
            .await?
            .ok_or_else(|| CifraError::not_found("product", order.product_id))?;
        let seller = self.storage.get_seller(order.seller_id).await?;

        let fees = self.settings.fees.compute(order.amount);
        let sale = Sale {
            id: Uuid::new_v4(),
            order_id: order.id,
            product_id: order.product_id,
            seller_id: order.seller_id,
            buyer_email: order.buyer_email.clone(),
            amount: fees.amount,
            platform_fee: fees.platform_fee,
            net_amount: fees.net_amount,
            created_at: now,
        };
        let token = DownloadToken::issue(
            generate_download_token(),
            order,
            now,
            self.settings.token_ttl_days,
        );

        let mut notifications = Vec::with_capacity(2);
        let (subject, html) = buyer_purchase_email(
            order.id,
            &product.title,
            order.amount,
            &order.currency,
            &download_url(&self.settings.site_url, &token.token),
            token.expires_at,
        )?;
        notifications.push(Notification::new(
            Some(order.id),
            NotificationKind::BuyerPurchase,
            &order.buyer_email,
            subject,
            html,
        ));
        match &seller {
            Some(seller) if seller.email_notifications => {
                let (subject, html) = seller_sale_email(
                    order.id,
                    &product.title,
                    &order.buyer_email,
                    sale.amount,
                    sale.net_amount,
                    &order.currency,
                )?;
                notifications.push(Notification::new(
                    Some(order.id),
                    NotificationKind::SellerSale,
                    &seller.email,
                    subject,
                    html,
                ));
            }
            Some(_) => debug!(seller_id = %order.seller_id, "Seller disabled sale notifications"),
            None => warn!(seller_id = %order.seller_id, "Seller record missing; no sale notification"),
        }

        let fulfillment = Fulfillment {
            order_id: order.id,
            paid_at: now,
            provider_metadata,
            sale: sale.clone(),
            token: token.clone(),
            promo_id: order.promo_id,
            notifications,
        };

        let commit = self.storage.commit_fulfillment(&fulfillment).await.map_err(|e| {
            error!(order_id = %order.id, "Fulfillment commit failed, order left pending: {}", e);
            FulfillmentError::Ledger(e)
        })?;

        match commit {
            FulfillmentCommit::AlreadyHandled { current } => Ok(Self::already_handled(&Order {
                status: current,
                ..order.clone()
            })),
            FulfillmentCommit::Committed { promo_counted } => {
                if let (Some(promo_id), false) = (order.promo_id, promo_counted) {
                    warn!(order_id = %order.id, promo_id = %promo_id, "Promo use not counted");
                }
                info!(
                    order_id = %order.id,
                    payment_id = %order.external_payment_id,
                    token = %token.redacted(),
                    amount = sale.amount,
                    platform_fee = sale.platform_fee,
                    net_amount = sale.net_amount,
                    "Order fulfilled"
                );
                self.wake_outbox();
                Ok(FulfillmentOutcome::Fulfilled {
                    order_id: order.id,
                    sale_id: sale.id,
                    token: token.token,
                    platform_fee: sale.platform_fee,
                    net_amount: sale.net_amount,
                })
            }
        }
    }

    // Delivery runs on the outbox worker so the caller is not held up by the mailer.
    fn wake_outbox(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.wake();
        }
    }
}
