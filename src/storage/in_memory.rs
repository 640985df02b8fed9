use super::{check_transition, Fulfillment, FulfillmentCommit, Storage};
use crate::domain::*;
use crate::error::{CifraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sellers: HashMap<Uuid, Seller>,
    products: HashMap<Uuid, Product>,
    promos: HashMap<Uuid, PromoCode>,
    orders: HashMap<Uuid, Order>,
    sales: HashMap<Uuid, Sale>,
    tokens: HashMap<String, DownloadToken>,
    payouts: HashMap<Uuid, Payout>,
    notifications: HashMap<Uuid, Notification>,
}

/// In-memory storage implementation for development/testing.
///
/// All tables sit behind one lock so multi-record commits are atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| CifraError::storage("in-memory storage lock poisoned"))
    }
}

// Orders that still need their product: awaiting payment, or paid and downloadable.
fn holds_product(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Pending | OrderStatus::Paid)
}

fn balance_of(tables: &Tables, seller_id: Uuid) -> i64 {
    let earned: i64 = tables
        .sales
        .values()
        .filter(|s| s.seller_id == seller_id)
        .map(|s| s.net_amount)
        .sum();
    let withdrawn: i64 = tables
        .payouts
        .values()
        .filter(|p| p.seller_id == seller_id)
        .map(|p| p.amount)
        .sum();
    earned - withdrawn
}

fn newest_first<T, F: Fn(&T) -> DateTime<Utc>>(items: &mut [T], key: F) {
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_seller(&self, seller: &Seller) -> Result<()> {
        let mut tables = self.tables()?;
        tables.sellers.insert(seller.id, seller.clone());
        debug!("Created seller {} with id {}", seller.email, seller.id);
        Ok(())
    }

    async fn get_seller(&self, id: Uuid) -> Result<Option<Seller>> {
        Ok(self.tables()?.sellers.get(&id).cloned())
    }

    async fn update_seller(&self, seller: &Seller) -> Result<()> {
        let mut tables = self.tables()?;
        match tables.sellers.get_mut(&seller.id) {
            Some(existing) => {
                *existing = seller.clone();
                Ok(())
            }
            None => Err(CifraError::not_found("seller", seller.id)),
        }
    }

    async fn create_product(&self, product: &Product) -> Result<()> {
        let mut tables = self.tables()?;
        tables.products.insert(product.id, product.clone());
        debug!("Created product: {} with id {}", product.title, product.id);
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>> {
        Ok(self.tables()?.products.get(&id).cloned())
    }

    async fn update_product(&self, product: &Product) -> Result<()> {
        let mut tables = self.tables()?;
        let existing = tables
            .products
            .get_mut(&product.id)
            .ok_or_else(|| CifraError::not_found("product", product.id))?;
        let (sales, revenue) = (existing.sales, existing.revenue);
        *existing = product.clone();
        existing.sales = sales;
        existing.revenue = revenue;
        debug!("Updated product: {} with id {}", product.title, product.id);
        Ok(())
    }

    async fn delete_product(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables()?;
        if tables.orders.values().any(|o| o.product_id == id && holds_product(o.status)) {
            return Err(CifraError::Conflict(
                "product has orders; unpublish it instead".to_string(),
            ));
        }
        Ok(tables.products.remove(&id).is_some())
    }

    async fn list_products(&self, seller_id: Uuid, include_drafts: bool) -> Result<Vec<Product>> {
        let tables = self.tables()?;
        let mut products: Vec<Product> = tables
            .products
            .values()
            .filter(|p| p.seller_id == seller_id && (include_drafts || p.is_published()))
            .cloned()
            .collect();
        newest_first(&mut products, |p| p.created_at);
        Ok(products)
    }

    async fn create_promo(&self, promo: &PromoCode) -> Result<()> {
        let mut tables = self.tables()?;
        let code = normalize_promo_code(&promo.code);
        if tables.promos.values().any(|p| p.code == code) {
            return Err(CifraError::Conflict(format!("promo code {code} already exists")));
        }
        let mut promo = promo.clone();
        promo.code = code;
        tables.promos.insert(promo.id, promo);
        Ok(())
    }

    async fn get_promo(&self, id: Uuid) -> Result<Option<PromoCode>> {
        Ok(self.tables()?.promos.get(&id).cloned())
    }

    async fn find_active_promo_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        let code = normalize_promo_code(code);
        let tables = self.tables()?;
        Ok(tables
            .promos
            .values()
            .find(|p| p.is_active && p.code == code)
            .cloned())
    }

    async fn update_promo(&self, promo: &PromoCode) -> Result<()> {
        let mut tables = self.tables()?;
        let existing = tables
            .promos
            .get_mut(&promo.id)
            .ok_or_else(|| CifraError::not_found("promo code", promo.id))?;
        existing.discount_percent = promo.discount_percent;
        existing.is_active = promo.is_active;
        Ok(())
    }

    async fn delete_promo(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables()?.promos.remove(&id).is_some())
    }

    async fn list_promos(&self, seller_id: Uuid) -> Result<Vec<PromoCode>> {
        let tables = self.tables()?;
        let mut promos: Vec<PromoCode> = tables
            .promos
            .values()
            .filter(|p| p.seller_id == seller_id)
            .cloned()
            .collect();
        newest_first(&mut promos, |p| p.created_at);
        Ok(promos)
    }

    async fn create_order(&self, order: &Order) -> Result<()> {
        let mut tables = self.tables()?;
        if !tables.products.contains_key(&order.product_id) {
            return Err(CifraError::not_found("product", order.product_id));
        }
        if tables
            .orders
            .values()
            .any(|o| o.external_payment_id == order.external_payment_id)
        {
            return Err(CifraError::Conflict(format!(
                "payment {} already has an order",
                order.external_payment_id
            )));
        }
        tables.orders.insert(order.id, order.clone());
        debug!("Created order {} for payment {}", order.id, order.external_payment_id);
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.tables()?.orders.get(&id).cloned())
    }

    async fn find_order_by_payment_id(&self, payment_id: &str) -> Result<Option<Order>> {
        let tables = self.tables()?;
        Ok(tables
            .orders
            .values()
            .find(|o| o.external_payment_id == payment_id)
            .cloned())
    }

    async fn transition_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: OrderUpdate,
    ) -> Result<TransitionOutcome> {
        check_transition(from, to)?;
        let mut tables = self.tables()?;
        let order = tables
            .orders
            .get_mut(&id)
            .ok_or_else(|| CifraError::not_found("order", id))?;
        if order.status != from {
            return Ok(TransitionOutcome::Conflict {
                current: order.status,
            });
        }
        order.status = to;
        if let Some(paid_at) = update.paid_at {
            order.paid_at = Some(paid_at);
        }
        if let Some(metadata) = update.provider_metadata {
            order.provider_metadata = metadata;
        }
        debug!("Order {} moved {} -> {}", id, from, to);
        Ok(TransitionOutcome::Applied)
    }

    async fn list_pending_orders(&self, created_before: DateTime<Utc>) -> Result<Vec<Order>> {
        let tables = self.tables()?;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.created_at < created_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn commit_fulfillment(&self, fulfillment: &Fulfillment) -> Result<FulfillmentCommit> {
        let mut tables = self.tables()?;

        let order = tables
            .orders
            .get(&fulfillment.order_id)
            .ok_or_else(|| CifraError::not_found("order", fulfillment.order_id))?;
        if order.status != OrderStatus::Pending {
            return Ok(FulfillmentCommit::AlreadyHandled {
                current: order.status,
            });
        }
        let product_id = order.product_id;

        // Check every precondition before the first write so a failure leaves no trace.
        if !tables.products.contains_key(&product_id) {
            return Err(CifraError::not_found("product", product_id));
        }
        if tables
            .sales
            .values()
            .any(|s| s.order_id == fulfillment.order_id)
        {
            return Err(CifraError::Conflict(format!(
                "sale already recorded for order {}",
                fulfillment.order_id
            )));
        }
        if tables.tokens.contains_key(&fulfillment.token.token)
            || tables
                .tokens
                .values()
                .any(|t| t.order_id == fulfillment.order_id)
        {
            return Err(CifraError::Conflict(format!(
                "download token already issued for order {}",
                fulfillment.order_id
            )));
        }

        if let Some(order) = tables.orders.get_mut(&fulfillment.order_id) {
            order.status = OrderStatus::Paid;
            order.paid_at = Some(fulfillment.paid_at);
            order.provider_metadata = fulfillment.provider_metadata.clone();
        }

        tables
            .sales
            .insert(fulfillment.sale.id, fulfillment.sale.clone());

        if let Some(product) = tables.products.get_mut(&product_id) {
            product.sales += 1;
            product.revenue += fulfillment.sale.net_amount;
        }

        let promo_counted = match fulfillment.promo_id {
            Some(promo_id) => match tables.promos.get_mut(&promo_id) {
                Some(promo) => {
                    promo.uses += 1;
                    true
                }
                None => {
                    warn!("Promo {} referenced by order {} no longer exists", promo_id, fulfillment.order_id);
                    false
                }
            },
            None => false,
        };

        tables
            .tokens
            .insert(fulfillment.token.token.clone(), fulfillment.token.clone());

        for notification in &fulfillment.notifications {
            tables
                .notifications
                .insert(notification.id, notification.clone());
        }

        Ok(FulfillmentCommit::Committed { promo_counted })
    }

    async fn get_sale_by_order(&self, order_id: Uuid) -> Result<Option<Sale>> {
        let tables = self.tables()?;
        Ok(tables.sales.values().find(|s| s.order_id == order_id).cloned())
    }

    async fn list_sales(&self, seller_id: Uuid) -> Result<Vec<Sale>> {
        let tables = self.tables()?;
        let mut sales: Vec<Sale> = tables
            .sales
            .values()
            .filter(|s| s.seller_id == seller_id)
            .cloned()
            .collect();
        newest_first(&mut sales, |s| s.created_at);
        Ok(sales)
    }

    async fn get_download_token(&self, token: &str) -> Result<Option<DownloadToken>> {
        Ok(self.tables()?.tokens.get(token).cloned())
    }

    async fn get_download_token_by_order(&self, order_id: Uuid) -> Result<Option<DownloadToken>> {
        let tables = self.tables()?;
        Ok(tables
            .tokens
            .values()
            .find(|t| t.order_id == order_id)
            .cloned())
    }

    async fn record_download(&self, token: &str) -> Result<Option<DownloadToken>> {
        let mut tables = self.tables()?;
        Ok(tables.tokens.get_mut(token).map(|t| {
            t.download_count += 1;
            t.used = true;
            t.clone()
        }))
    }

    async fn available_balance(&self, seller_id: Uuid) -> Result<i64> {
        let tables = self.tables()?;
        Ok(balance_of(&tables, seller_id))
    }

    async fn create_payout(&self, payout: &Payout) -> Result<()> {
        let mut tables = self.tables()?;
        let balance = balance_of(&tables, payout.seller_id);
        if payout.amount > balance {
            return Err(CifraError::Validation(format!(
                "requested {} exceeds available balance {}",
                payout.amount,
                balance.max(0)
            )));
        }
        tables.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn list_payouts(&self, seller_id: Uuid) -> Result<Vec<Payout>> {
        let tables = self.tables()?;
        let mut payouts: Vec<Payout> = tables
            .payouts
            .values()
            .filter(|p| p.seller_id == seller_id)
            .cloned()
            .collect();
        newest_first(&mut payouts, |p| p.created_at);
        Ok(payouts)
    }

    async fn enqueue_notification(&self, notification: &Notification) -> Result<()> {
        self.tables()?
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let tables = self.tables()?;
        let mut pending: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|n| n.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables()?;
        let notification = tables
            .notifications
            .get_mut(&id)
            .ok_or_else(|| CifraError::not_found("notification", id))?;
        notification.status = NotificationStatus::Sent;
        notification.attempts += 1;
        notification.sent_at = Some(sent_at);
        notification.last_error = None;
        Ok(())
    }

    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<NotificationStatus> {
        let mut tables = self.tables()?;
        let notification = tables
            .notifications
            .get_mut(&id)
            .ok_or_else(|| CifraError::not_found("notification", id))?;
        notification.attempts += 1;
        notification.last_error = Some(error.to_string());
        if notification.attempts >= max_attempts {
            notification.status = NotificationStatus::Abandoned;
        }
        Ok(notification.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_order(product: &Product, payment_id: &str) -> Order {
        Order {
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
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_payment_id_is_conflict() {
        let storage = InMemoryStorage::new();
        let product = Product::new_draft(Uuid::new_v4(), "Preset pack", "Fifteen presets", 890, "design");
        storage.create_product(&product).await.unwrap();

        storage.create_order(&pending_order(&product, "pay_1")).await.unwrap();
        let err = storage
            .create_order(&pending_order(&product, "pay_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CifraError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let storage = InMemoryStorage::new();
        let product = Product::new_draft(Uuid::new_v4(), "Preset pack", "Fifteen presets", 890, "design");
        storage.create_product(&product).await.unwrap();
        let order = pending_order(&product, "pay_2");
        storage.create_order(&order).await.unwrap();

        let first = storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Canceled, OrderUpdate::default())
            .await
            .unwrap();
        assert_eq!(first, TransitionOutcome::Applied);

        let second = storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Failed, OrderUpdate::default())
            .await
            .unwrap();
        assert_eq!(
            second,
            TransitionOutcome::Conflict {
                current: OrderStatus::Canceled
            }
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_moves() {
        let storage = InMemoryStorage::new();
        let product = Product::new_draft(Uuid::new_v4(), "Preset pack", "Fifteen presets", 890, "design");
        storage.create_product(&product).await.unwrap();
        let order = pending_order(&product, "pay_3");
        storage.create_order(&order).await.unwrap();

        // Paid is only written together with the sale.
        let err = storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Paid, OrderUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CifraError::Validation(_)));

        storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Failed, OrderUpdate::default())
            .await
            .unwrap();
        let err = storage
            .transition_order(order.id, OrderStatus::Failed, OrderStatus::Pending, OrderUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CifraError::Validation(_)));
        let stored = storage.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_product_with_orders_cannot_be_deleted() {
        let storage = InMemoryStorage::new();
        let product = Product::new_draft(Uuid::new_v4(), "Preset pack", "Fifteen presets", 890, "design");
        storage.create_product(&product).await.unwrap();
        let order = pending_order(&product, "pay_4");
        storage.create_order(&order).await.unwrap();

        let err = storage.delete_product(product.id).await.unwrap_err();
        assert!(matches!(err, CifraError::Conflict(_)));
        assert!(storage.get_product(product.id).await.unwrap().is_some());

        // A canceled order no longer needs the product.
        storage
            .transition_order(order.id, OrderStatus::Pending, OrderStatus::Canceled, OrderUpdate::default())
            .await
            .unwrap();
        assert!(storage.delete_product(product.id).await.unwrap());

        let err = storage
            .create_order(&pending_order(&product, "pay_5"))
            .await
            .unwrap_err();
        assert!(matches!(err, CifraError::NotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_payouts_cannot_overdraw() {
        let storage = std::sync::Arc::new(InMemoryStorage::new());
        let seller_id = Uuid::new_v4();
        storage.tables().unwrap().sales.insert(
            Uuid::new_v4(),
            Sale {
                id: Uuid::new_v4(),
                order_id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                seller_id,
                buyer_email: "buyer@example.com".to_string(),
                amount: 1999,
                platform_fee: 130,
                net_amount: 1869,
                created_at: Utc::now(),
            },
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    let payout = Payout {
                        id: Uuid::new_v4(),
                        seller_id,
                        amount: 1869,
                        method: "card".to_string(),
                        status: PayoutStatus::Pending,
                        created_at: Utc::now(),
                    };
                    storage.create_payout(&payout).await
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(e) => assert!(matches!(e, CifraError::Validation(_))),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(storage.available_balance(seller_id).await.unwrap(), 0);
        assert_eq!(storage.list_payouts(seller_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_product_keeps_counters() {
        let storage = InMemoryStorage::new();
        let mut product = Product::new_draft(Uuid::new_v4(), "Preset pack", "Fifteen presets", 890, "design");
        product.sales = 3;
        product.revenue = 2000;
        storage.create_product(&product).await.unwrap();

        let mut edited = product.clone();
        edited.title = "Preset pack v2".to_string();
        edited.sales = 0;
        edited.revenue = 0;
        storage.update_product(&edited).await.unwrap();

        let stored = storage.get_product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Preset pack v2");
        assert_eq!(stored.sales, 3);
        assert_eq!(stored.revenue, 2000);
    }

    #[tokio::test]
    async fn test_promo_codes_are_case_insensitive() {
        let storage = InMemoryStorage::new();
        let seller = Uuid::new_v4();
        storage.create_promo(&PromoCode::new(seller, "friends", 10)).await.unwrap();

        let found = storage.find_active_promo_by_code("Friends").await.unwrap();
        assert!(found.is_some());
        let dup = storage.create_promo(&PromoCode::new(seller, "FRIENDS", 5)).await;
        assert!(matches!(dup, Err(CifraError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_notification_abandoned_after_max_attempts() {
        let storage = InMemoryStorage::new();
        let n = Notification::new(None, NotificationKind::Test, "a@example.com", "s".into(), "b".into());
        storage.enqueue_notification(&n).await.unwrap();

        assert_eq!(
            storage.record_notification_failure(n.id, "timeout", 2).await.unwrap(),
            NotificationStatus::Pending
        );
        assert_eq!(
            storage.record_notification_failure(n.id, "timeout", 2).await.unwrap(),
            NotificationStatus::Abandoned
        );
        assert!(storage.pending_notifications(10).await.unwrap().is_empty());
    }
}
