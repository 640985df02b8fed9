use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::app::ports::{CreatePaymentRequest, PaymentGatewayPort};
use crate::constants::MIN_PRICE;
use crate::domain::*;
use crate::error::{CifraError, Result};
use crate::metrics::CheckoutMetrics;
use crate::storage::Storage;
use crate::validation::validate_email;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub order_id: Uuid,
    pub payment_id: String,
    pub confirmation_url: String,
    pub amount: i64,
}

/// Creates pending orders backed by a gateway payment.
pub struct CheckoutService {
    storage: Arc<dyn Storage>,
    payments: Arc<dyn PaymentGatewayPort>,
    site_url: String,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        storage: Arc<dyn Storage>,
        payments: Arc<dyn PaymentGatewayPort>,
        site_url: &str,
        currency: &str,
    ) -> Self {
        Self {
            storage,
            payments,
            site_url: site_url.trim_end_matches('/').to_string(),
            currency: currency.to_string(),
        }
    }

    fn reject(reason: &'static str, err: CifraError) -> CifraError {
        CheckoutMetrics::record_rejected(reason);
        err
    }

    pub async fn create_order(
        &self,
        product_id: Uuid,
        buyer_email: &str,
        promo_code: Option<&str>,
    ) -> Result<CheckoutSession> {
        let buyer_email = buyer_email.trim();
        validate_email(buyer_email).map_err(|e| Self::reject("invalid_email", e))?;

        let product = self
            .storage
            .get_product(product_id)
            .await?
            .filter(Product::is_published)
            .ok_or_else(|| Self::reject("product_unavailable", CifraError::not_found("product", product_id)))?;

        let promo = match promo_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let promo = self
                    .storage
                    .find_active_promo_by_code(code)
                    .await?
                    .filter(|p| p.seller_id == product.seller_id)
                    .ok_or_else(|| {
                        Self::reject(
                            "invalid_promo",
                            CifraError::Validation(format!("promo code '{code}' is not valid")),
                        )
                    })?;
                Some(promo)
            }
            None => None,
        };

        let amount = promo.as_ref().map_or(product.price, |p| p.apply(product.price));
        if amount < MIN_PRICE {
            return Err(Self::reject(
                "below_minimum",
                CifraError::Validation(format!(
                    "amount after discount is {amount}, minimum is {MIN_PRICE}"
                )),
            ));
        }

        let order_id = Uuid::new_v4();
        let request = CreatePaymentRequest {
            amount,
            currency: self.currency.clone(),
            description: format!("Order {}: {}", order_id, product.title),
            return_url: format!("{}/payment/success", self.site_url),
            buyer_email: buyer_email.to_string(),
            product_id: product.id,
            seller_id: product.seller_id,
            promo_code: promo.as_ref().map(|p| p.code.clone()),
            idempotence_key: order_id.to_string(),
        };
        let payment = self.payments.create_payment(&request).await.map_err(|e| {
            CheckoutMetrics::record_gateway_error();
            error!(product_id = %product.id, "Payment creation failed: {}", e);
            e
        })?;

        let order = Order {
            id: order_id,
            product_id: product.id,
            seller_id: product.seller_id,
            buyer_email: buyer_email.to_string(),
            amount,
            currency: self.currency.clone(),
            status: OrderStatus::Pending,
            external_payment_id: payment.id.clone(),
            promo_id: promo.as_ref().map(|p| p.id),
            provider_metadata: payment.raw,
            created_at: Utc::now(),
            paid_at: None,
        };
        self.storage.create_order(&order).await?;

        CheckoutMetrics::record_payment_created(amount, promo.is_some());
        info!(
            order_id = %order.id,
            payment_id = %payment.id,
            product_id = %product.id,
            amount = amount,
            "Checkout created"
        );

        Ok(CheckoutSession {
            order_id: order.id,
            payment_id: payment.id,
            confirmation_url: payment.confirmation_url,
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::InMemoryPaymentGateway;
    use crate::storage::InMemoryStorage;

    async fn setup(price: i64) -> (Arc<InMemoryStorage>, Arc<InMemoryPaymentGateway>, CheckoutService, Product) {
        let storage = Arc::new(InMemoryStorage::new());
        let gateway = Arc::new(InMemoryPaymentGateway::new());
        let service = CheckoutService::new(storage.clone(), gateway.clone(), "https://cifra.example/", "RUB");

        let mut product = Product::new_draft(Uuid::new_v4(), "Lightroom presets", "Twenty film presets", price, "design");
        product.status = ProductStatus::Published;
        storage.create_product(&product).await.unwrap();
        (storage, gateway, service, product)
    }

    #[tokio::test]
    async fn test_creates_pending_order() {
        let (storage, gateway, service, product) = setup(1999).await;

        let session = service
            .create_order(product.id, " buyer@example.com ", None)
            .await
            .unwrap();
        assert_eq!(session.amount, 1999);

        let order = storage.get_order(session.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.external_payment_id, session.payment_id);
        assert_eq!(order.buyer_email, "buyer@example.com");

        let requests = gateway.created_requests().unwrap();
        assert_eq!(requests[0].return_url, "https://cifra.example/payment/success");
        assert_eq!(requests[0].idempotence_key, session.order_id.to_string());
    }

    #[tokio::test]
    async fn test_promo_applies_server_side() {
        let (storage, _, service, product) = setup(1000).await;
        let promo = PromoCode::new(product.seller_id, "LAUNCH", 25);
        storage.create_promo(&promo).await.unwrap();

        let session = service
            .create_order(product.id, "buyer@example.com", Some("launch"))
            .await
            .unwrap();
        assert_eq!(session.amount, 750);

        let order = storage.get_order(session.order_id).await.unwrap().unwrap();
        assert_eq!(order.promo_id, Some(promo.id));
        // Uses are counted at fulfillment, not here.
        assert_eq!(storage.get_promo(promo.id).await.unwrap().unwrap().uses, 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (storage, gateway, service, product) = setup(1000).await;

        let err = service.create_order(product.id, "not-an-email", None).await.unwrap_err();
        assert!(matches!(err, CifraError::Validation(_)));

        let err = service
            .create_order(product.id, "buyer@example.com", Some("NOPE"))
            .await
            .unwrap_err();
        assert!(matches!(err, CifraError::Validation(_)));

        let other_seller = PromoCode::new(Uuid::new_v4(), "ELSEWHERE", 10);
        storage.create_promo(&other_seller).await.unwrap();
        assert!(service
            .create_order(product.id, "buyer@example.com", Some("elsewhere"))
            .await
            .is_err());

        let free = PromoCode::new(product.seller_id, "FREE", 100);
        storage.create_promo(&free).await.unwrap();
        assert!(service
            .create_order(product.id, "buyer@example.com", Some("FREE"))
            .await
            .is_err());

        let mut draft = product.clone();
        draft.id = Uuid::new_v4();
        draft.status = ProductStatus::Draft;
        storage.create_product(&draft).await.unwrap();
        let err = service.create_order(draft.id, "buyer@example.com", None).await.unwrap_err();
        assert!(matches!(err, CifraError::NotFound { .. }));

        assert!(gateway.created_requests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_no_order() {
        let (storage, gateway, service, product) = setup(1000).await;
        gateway.set_unavailable(true).unwrap();

        assert!(service.create_order(product.id, "buyer@example.com", None).await.is_err());
        assert!(storage
            .list_pending_orders(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }
}
