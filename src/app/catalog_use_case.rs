//! Seller dashboard operations: catalog, promo codes, sales analytics and payouts.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::app::ports::ObjectStorePort;
use crate::constants::PRODUCT_FILES_FOLDER;
use crate::domain::*;
use crate::error::{CifraError, Result};
use crate::storage::Storage;
use crate::validation::{
    validate_discount_percent, validate_email, validate_price, validate_product_description,
    validate_product_title, validate_promo_code,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellerSettings {
    pub display_name: Option<String>,
    pub email_notifications: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub title: String,
    pub description: String,
    pub price: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub cover_image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub category: Option<String>,
    pub cover_image: Option<String>,
    pub status: Option<ProductStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoPatch {
    pub is_active: Option<bool>,
    pub discount_percent: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySales {
    pub date: NaiveDate,
    pub count: usize,
    pub gross: i64,
    pub net: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesSummary {
    pub count: usize,
    pub gross: i64,
    pub fees: i64,
    pub net: i64,
    pub daily: Vec<DailySales>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub email: String,
    pub purchases: usize,
    pub total_spent: i64,
    pub last_purchase: chrono::DateTime<Utc>,
}

/// Object key for an uploaded product file.
pub fn product_file_key(file_name: &str, uploaded_at_millis: i64) -> String {
    let sanitized: String = file_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{PRODUCT_FILES_FOLDER}/{uploaded_at_millis}-{sanitized}")
}

pub struct CatalogService {
    storage: Arc<dyn Storage>,
    objects: Arc<dyn ObjectStorePort>,
}

impl CatalogService {
    pub fn new(storage: Arc<dyn Storage>, objects: Arc<dyn ObjectStorePort>) -> Self {
        Self { storage, objects }
    }

    // Sellers

    pub async fn create_seller(&self, email: &str, display_name: &str) -> Result<Seller> {
        validate_email(email)?;
        if display_name.trim().is_empty() {
            return Err(CifraError::Validation("display name is required".to_string()));
        }
        let seller = Seller::new(email, display_name);
        self.storage.create_seller(&seller).await?;
        info!(seller_id = %seller.id, "Seller created");
        Ok(seller)
    }

    pub async fn get_seller(&self, seller_id: Uuid) -> Result<Seller> {
        self.storage
            .get_seller(seller_id)
            .await?
            .ok_or_else(|| CifraError::not_found("seller", seller_id))
    }

    pub async fn update_seller_settings(&self, seller_id: Uuid, settings: SellerSettings) -> Result<Seller> {
        let mut seller = self.get_seller(seller_id).await?;
        if let Some(name) = settings.display_name {
            if name.trim().is_empty() {
                return Err(CifraError::Validation("display name is required".to_string()));
            }
            seller.display_name = name.trim().to_string();
        }
        if let Some(enabled) = settings.email_notifications {
            seller.email_notifications = enabled;
        }
        self.storage.update_seller(&seller).await?;
        Ok(seller)
    }

    // Products

    pub async fn create_product(&self, seller_id: Uuid, input: NewProduct) -> Result<Product> {
        self.get_seller(seller_id).await?;
        validate_product_title(&input.title)?;
        validate_product_description(&input.description)?;
        validate_price(input.price)?;

        let mut product =
            Product::new_draft(seller_id, &input.title, &input.description, input.price, &input.category);
        product.cover_image = input.cover_image;
        self.storage.create_product(&product).await?;
        info!(seller_id = %seller_id, product_id = %product.id, "Draft product created");
        Ok(product)
    }

    pub async fn list_products(&self, seller_id: Uuid, include_drafts: bool) -> Result<Vec<Product>> {
        self.storage.list_products(seller_id, include_drafts).await
    }

    /// Product owned by `seller_id`; products of other sellers are reported as missing.
    pub async fn get_product(&self, seller_id: Uuid, product_id: Uuid) -> Result<Product> {
        self.storage
            .get_product(product_id)
            .await?
            .filter(|p| p.seller_id == seller_id)
            .ok_or_else(|| CifraError::not_found("product", product_id))
    }

    pub async fn update_product(&self, seller_id: Uuid, product_id: Uuid, patch: ProductPatch) -> Result<Product> {
        let mut product = self.get_product(seller_id, product_id).await?;
        if let Some(title) = patch.title {
            validate_product_title(&title)?;
            product.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            validate_product_description(&description)?;
            product.description = description.trim().to_string();
        }
        if let Some(price) = patch.price {
            validate_price(price)?;
            product.price = price;
        }
        if let Some(category) = patch.category {
            product.category = category;
        }
        if let Some(cover) = patch.cover_image {
            product.cover_image = Some(cover).filter(|c| !c.trim().is_empty());
        }
        if let Some(status) = patch.status {
            if status == ProductStatus::Published {
                Self::check_publishable(&product)?;
            }
            product.status = status;
        }
        product.updated_at = Utc::now();
        self.storage.update_product(&product).await?;
        self.get_product(seller_id, product_id).await
    }

    fn check_publishable(product: &Product) -> Result<()> {
        if product.file_count() == 0 {
            return Err(CifraError::Validation(
                "upload at least one file before publishing".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn publish_product(&self, seller_id: Uuid, product_id: Uuid) -> Result<Product> {
        self.update_product(
            seller_id,
            product_id,
            ProductPatch {
                status: Some(ProductStatus::Published),
                ..ProductPatch::default()
            },
        )
        .await
    }

    pub async fn delete_product(&self, seller_id: Uuid, product_id: Uuid) -> Result<()> {
        self.get_product(seller_id, product_id).await?;
        self.storage.delete_product(product_id).await?;
        info!(seller_id = %seller_id, product_id = %product_id, "Product deleted");
        Ok(())
    }

    /// Store a file in object storage and attach its key to the product.
    pub async fn upload_file(
        &self,
        seller_id: Uuid,
        product_id: Uuid,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Product> {
        if file_name.trim().is_empty() {
            return Err(CifraError::Validation("file name is required".to_string()));
        }
        if bytes.is_empty() {
            return Err(CifraError::Validation("file is empty".to_string()));
        }
        let mut product = self.get_product(seller_id, product_id).await?;
        let key = product_file_key(file_name, Utc::now().timestamp_millis());
        let size = bytes.len();
        self.objects.put_object(&key, bytes, content_type).await?;

        product.file_keys.push(key.clone());
        product.updated_at = Utc::now();
        self.storage.update_product(&product).await?;
        info!(product_id = %product_id, key = %key, bytes = size, "Product file uploaded");
        self.get_product(seller_id, product_id).await
    }

    // Promo codes

    pub async fn create_promo(&self, seller_id: Uuid, code: &str, discount_percent: i64) -> Result<PromoCode> {
        self.get_seller(seller_id).await?;
        validate_promo_code(code)?;
        validate_discount_percent(discount_percent)?;
        let promo = PromoCode::new(seller_id, code, discount_percent);
        self.storage.create_promo(&promo).await?;
        Ok(promo)
    }

    pub async fn list_promos(&self, seller_id: Uuid) -> Result<Vec<PromoCode>> {
        self.storage.list_promos(seller_id).await
    }

    async fn owned_promo(&self, seller_id: Uuid, promo_id: Uuid) -> Result<PromoCode> {
        self.storage
            .get_promo(promo_id)
            .await?
            .filter(|p| p.seller_id == seller_id)
            .ok_or_else(|| CifraError::not_found("promo code", promo_id))
    }

    pub async fn update_promo(&self, seller_id: Uuid, promo_id: Uuid, patch: PromoPatch) -> Result<PromoCode> {
        let mut promo = self.owned_promo(seller_id, promo_id).await?;
        if let Some(discount) = patch.discount_percent {
            validate_discount_percent(discount)?;
            promo.discount_percent = discount;
        }
        if let Some(active) = patch.is_active {
            promo.is_active = active;
        }
        self.storage.update_promo(&promo).await?;
        self.owned_promo(seller_id, promo_id).await
    }

    pub async fn delete_promo(&self, seller_id: Uuid, promo_id: Uuid) -> Result<()> {
        self.owned_promo(seller_id, promo_id).await?;
        self.storage.delete_promo(promo_id).await?;
        Ok(())
    }

    // Sales

    pub async fn list_sales(&self, seller_id: Uuid) -> Result<Vec<Sale>> {
        self.storage.list_sales(seller_id).await
    }

    pub async fn sales_summary(&self, seller_id: Uuid) -> Result<SalesSummary> {
        let sales = self.storage.list_sales(seller_id).await?;
        let mut daily: BTreeMap<NaiveDate, DailySales> = BTreeMap::new();
        for sale in &sales {
            let date = sale.created_at.date_naive();
            let day = daily.entry(date).or_insert(DailySales {
                date,
                count: 0,
                gross: 0,
                net: 0,
            });
            day.count += 1;
            day.gross += sale.amount;
            day.net += sale.net_amount;
        }
        Ok(SalesSummary {
            count: sales.len(),
            gross: sales.iter().map(|s| s.amount).sum(),
            fees: sales.iter().map(|s| s.platform_fee).sum(),
            net: sales.iter().map(|s| s.net_amount).sum(),
            daily: daily.into_values().collect(),
        })
    }

    /// One row per buyer email, biggest spenders first.
    pub async fn customers(&self, seller_id: Uuid) -> Result<Vec<CustomerSummary>> {
        let sales = self.storage.list_sales(seller_id).await?;
        let mut by_email: HashMap<String, CustomerSummary> = HashMap::new();
        for sale in sales {
            let email = sale.buyer_email.to_lowercase();
            let entry = by_email.entry(email.clone()).or_insert(CustomerSummary {
                email,
                purchases: 0,
                total_spent: 0,
                last_purchase: sale.created_at,
            });
            entry.purchases += 1;
            entry.total_spent += sale.amount;
            entry.last_purchase = entry.last_purchase.max(sale.created_at);
        }
        let mut customers: Vec<CustomerSummary> = by_email.into_values().collect();
        customers.sort_by(|a, b| {
            b.total_spent
                .cmp(&a.total_spent)
                .then_with(|| a.email.cmp(&b.email))
        });
        Ok(customers)
    }

    // Payouts

    pub async fn list_payouts(&self, seller_id: Uuid) -> Result<Vec<Payout>> {
        self.storage.list_payouts(seller_id).await
    }

    pub async fn available_balance(&self, seller_id: Uuid) -> Result<i64> {
        Ok(self.storage.available_balance(seller_id).await?.max(0))
    }

    pub async fn request_payout(&self, seller_id: Uuid, amount: i64, method: &str) -> Result<Payout> {
        self.get_seller(seller_id).await?;
        if amount <= 0 {
            return Err(CifraError::Validation("payout amount must be positive".to_string()));
        }
        let method = method.trim();
        if method.is_empty() {
            return Err(CifraError::Validation("payout method is required".to_string()));
        }
        // The balance check happens inside the insert.
        let payout = Payout {
            id: Uuid::new_v4(),
            seller_id,
            amount,
            method: method.to_string(),
            status: PayoutStatus::Pending,
            created_at: Utc::now(),
        };
        self.storage.create_payout(&payout).await?;
        info!(seller_id = %seller_id, payout_id = %payout.id, amount = amount, "Payout requested");
        Ok(payout)
    }
}
