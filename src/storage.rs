use crate::domain::*;
use crate::error::{CifraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

/// Everything a confirmed payment changes, committed as one unit.
#[derive(Debug, Clone)]
pub struct Fulfillment {
    pub order_id: Uuid,
    pub paid_at: DateTime<Utc>,
    pub provider_metadata: serde_json::Value,
    pub sale: Sale,
    pub token: DownloadToken,
    pub promo_id: Option<Uuid>,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentCommit {
    Committed {
        /// False when the referenced promo code no longer exists.
        promo_counted: bool,
    },
    /// The order already left `pending`; nothing was written.
    AlreadyHandled { current: OrderStatus },
}

/// Order moves a backend accepts through `transition_order`.
/// `paid` is reachable only through `commit_fulfillment`, which writes the sale with it.
pub(crate) fn check_transition(from: OrderStatus, to: OrderStatus) -> Result<()> {
    if to == OrderStatus::Paid || !from.can_transition_to(to) {
        return Err(CifraError::Validation(format!(
            "order cannot move {from} -> {to} outside fulfillment"
        )));
    }
    Ok(())
}

/// Storage trait for the marketplace ledger (catalog, orders, sales, tokens, payouts, outbox)
#[async_trait]
pub trait Storage: Send + Sync {
    // Seller operations
    async fn create_seller(&self, seller: &Seller) -> Result<()>;
    async fn get_seller(&self, id: Uuid) -> Result<Option<Seller>>;
    async fn update_seller(&self, seller: &Seller) -> Result<()>;

    // Product catalog
    async fn create_product(&self, product: &Product) -> Result<()>;
    async fn get_product(&self, id: Uuid) -> Result<Option<Product>>;
    /// Overwrites catalog fields. `sales` and `revenue` are owned by fulfillment and left untouched.
    async fn update_product(&self, product: &Product) -> Result<()>;
    /// Fails with `Conflict` while pending or paid orders reference the product.
    async fn delete_product(&self, id: Uuid) -> Result<bool>;
    async fn list_products(&self, seller_id: Uuid, include_drafts: bool) -> Result<Vec<Product>>;

    // Promo registry
    /// Fails with `Conflict` when the code (case-insensitive) is taken.
    async fn create_promo(&self, promo: &PromoCode) -> Result<()>;
    async fn get_promo(&self, id: Uuid) -> Result<Option<PromoCode>>;
    async fn find_active_promo_by_code(&self, code: &str) -> Result<Option<PromoCode>>;
    /// Updates discount and active flag; `uses` is left untouched.
    async fn update_promo(&self, promo: &PromoCode) -> Result<()>;
    async fn delete_promo(&self, id: Uuid) -> Result<bool>;
    async fn list_promos(&self, seller_id: Uuid) -> Result<Vec<PromoCode>>;

    // Order ledger
    /// Fails with `Conflict` when the external payment id is already recorded
    /// and with `NotFound` when the product is gone.
    async fn create_order(&self, order: &Order) -> Result<()>;
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;
    async fn find_order_by_payment_id(&self, payment_id: &str) -> Result<Option<Order>>;
    /// Moves the order to `to` only if it is currently `from`.
    /// Only `pending -> canceled` and `pending -> failed` are accepted; anything else fails with `Validation`.
    async fn transition_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: OrderUpdate,
    ) -> Result<TransitionOutcome>;
    async fn list_pending_orders(&self, created_before: DateTime<Utc>) -> Result<Vec<Order>>;

    // Fulfillment
    /// Atomically flips the order `pending -> paid` and writes every fulfillment record.
    async fn commit_fulfillment(&self, fulfillment: &Fulfillment) -> Result<FulfillmentCommit>;
    async fn get_sale_by_order(&self, order_id: Uuid) -> Result<Option<Sale>>;
    async fn list_sales(&self, seller_id: Uuid) -> Result<Vec<Sale>>;

    // Download tokens
    async fn get_download_token(&self, token: &str) -> Result<Option<DownloadToken>>;
    async fn get_download_token_by_order(&self, order_id: Uuid) -> Result<Option<DownloadToken>>;
    /// Increments the download counter and marks the token used.
    async fn record_download(&self, token: &str) -> Result<Option<DownloadToken>>;

    // Payouts
    /// Net sales minus every payout requested so far.
    async fn available_balance(&self, seller_id: Uuid) -> Result<i64>;
    /// Fails with `Validation` when the amount exceeds the balance at insert time.
    async fn create_payout(&self, payout: &Payout) -> Result<()>;
    async fn list_payouts(&self, seller_id: Uuid) -> Result<Vec<Payout>>;

    // Notification outbox
    async fn enqueue_notification(&self, notification: &Notification) -> Result<()>;
    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Notification>>;
    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()>;
    /// Records a failed attempt; abandons the notification once `max_attempts` is reached.
    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<NotificationStatus>;
}
