use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::fulfillment_use_case::{FulfillmentEngine, FulfillmentOutcome};
use crate::error::Result;
use crate::storage::Storage;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub fulfilled: usize,
    pub canceled: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Re-checks stale pending orders with the gateway and settles them through the fulfillment engine.
pub struct ReconcileService {
    storage: Arc<dyn Storage>,
    engine: Arc<FulfillmentEngine>,
}

impl ReconcileService {
    pub fn new(storage: Arc<dyn Storage>, engine: Arc<FulfillmentEngine>) -> Self {
        Self { storage, engine }
    }

    pub async fn reconcile_pending(&self, min_age: Duration) -> Result<ReconcileReport> {
        let cutoff = Utc::now() - min_age;
        let orders = self.storage.list_pending_orders(cutoff).await?;
        let mut report = ReconcileReport::default();

        for order in orders {
            report.checked += 1;
            let payment_id = order.external_payment_id.as_str();
            match self.engine.reconcile_payment(payment_id).await {
                Ok(None) => report.still_pending += 1,
                Ok(Some(FulfillmentOutcome::Fulfilled { .. })) => report.fulfilled += 1,
                Ok(Some(FulfillmentOutcome::Canceled { .. })) => report.canceled += 1,
                Ok(Some(FulfillmentOutcome::Failed { .. })) => report.failed += 1,
                Ok(Some(other)) => info!(order_id = %order.id, "Reconcile outcome: {:?}", other),
                Err(e) => {
                    warn!(order_id = %order.id, "Reconcile could not settle order: {}", e);
                    report.errors += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            fulfilled = report.fulfilled,
            canceled = report.canceled,
            failed = report.failed,
            still_pending = report.still_pending,
            errors = report.errors,
            "Reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::GatewayPaymentStatus;
    use crate::app::fulfillment_use_case::FulfillmentSettings;
    use crate::domain::*;
    use crate::infra::memory::InMemoryPaymentGateway;
    use crate::storage::InMemoryStorage;
    use uuid::Uuid;

    async fn pending(storage: &InMemoryStorage, product: &Product, payment_id: &str, age_minutes: i64) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            product_id: product.id,
            seller_id: product.seller_id,
            buyer_email: "buyer@example.com".to_string(),
            amount: product.price,
            currency: "RUB".to_string(),
            status: OrderStatus::Pending,
            external_payment_id: payment_id.to_string(),
            promo_id: None,
            provider_metadata: serde_json::json!({}),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            paid_at: None,
        };
        storage.create_order(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_reconcile_settles_stale_orders() {
        let storage = Arc::new(InMemoryStorage::new());
        let gateway = Arc::new(InMemoryPaymentGateway::new());
        let engine = Arc::new(FulfillmentEngine::new(
            storage.clone(),
            gateway.clone(),
            FulfillmentSettings::default(),
        ));
        let service = ReconcileService::new(storage.clone(), engine);

        let seller = Seller::new("seller@example.com", "Anna");
        storage.create_seller(&seller).await.unwrap();
        let product = Product::new_draft(seller.id, "Icon set", "Two hundred line icons", 1999, "design");
        storage.create_product(&product).await.unwrap();

        let paid = pending(&storage, &product, "pay_paid", 60).await;
        let canceled = pending(&storage, &product, "pay_canceled", 60).await;
        let waiting = pending(&storage, &product, "pay_waiting", 60).await;
        let fresh = pending(&storage, &product, "pay_fresh", 1).await;
        pending(&storage, &product, "pay_missing", 60).await;
        gateway.put("pay_paid", GatewayPaymentStatus::Succeeded, 1999, "RUB").unwrap();
        gateway.put("pay_canceled", GatewayPaymentStatus::Canceled, 1999, "RUB").unwrap();
        gateway.put("pay_waiting", GatewayPaymentStatus::Pending, 1999, "RUB").unwrap();
        gateway.put("pay_fresh", GatewayPaymentStatus::Succeeded, 1999, "RUB").unwrap();

        let report = service.reconcile_pending(Duration::minutes(15)).await.unwrap();
        assert_eq!(report.checked, 4);
        assert_eq!(report.fulfilled, 1);
        assert_eq!(report.canceled, 1);
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.errors, 1);
        // One gateway lookup per stale order.
        assert_eq!(gateway.lookups(), 4);

        let status = |id: Uuid| {
            let storage = storage.clone();
            async move { storage.get_order(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(paid.id).await, OrderStatus::Paid);
        assert_eq!(status(canceled.id).await, OrderStatus::Canceled);
        assert_eq!(status(waiting.id).await, OrderStatus::Pending);
        assert_eq!(status(fresh.id).await, OrderStatus::Pending);
    }
}
