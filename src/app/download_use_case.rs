use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::app::ports::ObjectStorePort;
use crate::domain::{redact_token, DownloadToken, Product};
use crate::error::CifraError;
use crate::metrics::DownloadMetrics;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download link not found")]
    TokenNotFound,
    #[error("download link expired")]
    TokenExpired,
    #[error("file not found")]
    FileNotFound,
    #[error("download failed: {0}")]
    Internal(#[from] CifraError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLocationKind {
    /// Time-limited object storage link.
    Signed,
    /// Permanent URL for files uploaded before object storage.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLocation {
    pub url: String,
    pub kind: FileLocationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub product_title: String,
    pub files: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub download_count: i64,
    pub expired: bool,
}

/// Display name of a stored file: the last path segment without the upload timestamp prefix.
pub fn display_file_name(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.split_once('-') {
        Some((prefix, rest)) if !rest.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) => {
            rest.to_string()
        }
        _ => name.to_string(),
    }
}

/// Resolves download tokens to file locations without exposing permanent object links.
pub struct DownloadGateway {
    storage: Arc<dyn Storage>,
    objects: Arc<dyn ObjectStorePort>,
    signed_url_ttl_secs: u64,
    legacy_files_base_url: String,
}

impl DownloadGateway {
    pub fn new(
        storage: Arc<dyn Storage>,
        objects: Arc<dyn ObjectStorePort>,
        signed_url_ttl_secs: u64,
        legacy_files_base_url: &str,
    ) -> Self {
        Self {
            storage,
            objects,
            signed_url_ttl_secs,
            legacy_files_base_url: legacy_files_base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn load(&self, token: &str) -> Result<(DownloadToken, Product), DownloadError> {
        let Some(record) = self.storage.get_download_token(token).await? else {
            DownloadMetrics::record_token_not_found();
            warn!(token = %redact_token(token), "Unknown download token");
            return Err(DownloadError::TokenNotFound);
        };
        let product = self
            .storage
            .get_product(record.product_id)
            .await?
            .ok_or_else(|| {
                DownloadMetrics::record_file_missing();
                warn!(token = %record.redacted(), product_id = %record.product_id, "Product behind token is gone");
                DownloadError::FileNotFound
            })?;
        Ok((record, product))
    }

    /// Resolve `token` to the location of file `file_index`, counting the download.
    pub async fn resolve(&self, token: &str, file_index: usize) -> Result<FileLocation, DownloadError> {
        self.resolve_at(token, file_index, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        token: &str,
        file_index: usize,
        now: DateTime<Utc>,
    ) -> Result<FileLocation, DownloadError> {
        let (record, product) = self.load(token).await?;

        if record.is_expired(now) {
            DownloadMetrics::record_token_expired();
            info!(token = %record.redacted(), expires_at = %record.expires_at, "Expired download token");
            return Err(DownloadError::TokenExpired);
        }

        let location = if let Some(key) = product.file_keys.get(file_index) {
            let url = self
                .objects
                .signed_url(key, self.signed_url_ttl_secs)
                .await
                .map_err(|e| {
                    DownloadMetrics::record_signing_error();
                    error!(token = %record.redacted(), "Could not sign download link: {}", e);
                    DownloadError::Internal(e)
                })?;
            FileLocation {
                url,
                kind: FileLocationKind::Signed,
            }
        } else if product.file_keys.is_empty() {
            match product.legacy_files.get(file_index) {
                Some(file) => FileLocation {
                    url: format!("{}/{}/{}", self.legacy_files_base_url, product.id, file),
                    kind: FileLocationKind::Legacy,
                },
                None => return Err(self.missing(&record, file_index)),
            }
        } else {
            return Err(self.missing(&record, file_index));
        };

        let counted = self.storage.record_download(token).await?;
        let count = counted.map(|t| t.download_count).unwrap_or(record.download_count + 1);
        DownloadMetrics::record_served(location.kind == FileLocationKind::Signed);
        info!(
            token = %record.redacted(),
            order_id = %record.order_id,
            file_index = file_index,
            download_count = count,
            "Download resolved"
        );
        Ok(location)
    }

    fn missing(&self, record: &DownloadToken, file_index: usize) -> DownloadError {
        DownloadMetrics::record_file_missing();
        warn!(token = %record.redacted(), file_index = file_index, "Requested file does not exist");
        DownloadError::FileNotFound
    }

    /// Token details for the download page. Does not count as a download.
    pub async fn describe(&self, token: &str) -> Result<DownloadInfo, DownloadError> {
        let (record, product) = self.load(token).await?;
        let files = if product.file_keys.is_empty() {
            product.legacy_files.clone()
        } else {
            product.file_keys.iter().map(|k| display_file_name(k)).collect()
        };
        Ok(DownloadInfo {
            product_title: product.title,
            files,
            expires_at: record.expires_at,
            download_count: record.download_count,
            expired: record.is_expired(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Order, OrderStatus, ProductStatus};
    use crate::infra::memory::InMemoryObjectStore;
    use crate::storage::{Fulfillment, InMemoryStorage};
    use chrono::Duration;
    use uuid::Uuid;

    async fn issue(storage: &InMemoryStorage, product: &Product, token: &str, issued_at: DateTime<Utc>) {
        storage.create_product(product).await.unwrap();
        let order = Order {
            id: Uuid::new_v4(),
            product_id: product.id,
            seller_id: product.seller_id,
            buyer_email: "buyer@example.com".to_string(),
            amount: product.price,
            currency: "RUB".to_string(),
            status: OrderStatus::Pending,
            external_payment_id: format!("pay_{token}"),
            promo_id: None,
            provider_metadata: serde_json::json!({}),
            created_at: issued_at,
            paid_at: None,
        };
        storage.create_order(&order).await.unwrap();
        let fees = crate::fees::FeeSchedule::default().compute(order.amount);
        storage
            .commit_fulfillment(&Fulfillment {
                order_id: order.id,
                paid_at: issued_at,
                provider_metadata: serde_json::json!({}),
                sale: crate::domain::Sale {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    product_id: product.id,
                    seller_id: product.seller_id,
                    buyer_email: order.buyer_email.clone(),
                    amount: fees.amount,
                    platform_fee: fees.platform_fee,
                    net_amount: fees.net_amount,
                    created_at: issued_at,
                },
                token: DownloadToken::issue(token.to_string(), &order, issued_at, 30),
                promo_id: None,
                notifications: vec![],
            })
            .await
            .unwrap();
    }

    fn product(file_keys: &[&str], legacy: &[&str]) -> Product {
        let mut p = Product::new_draft(Uuid::new_v4(), "Font bundle", "Six display typefaces", 990, "fonts");
        p.status = ProductStatus::Published;
        p.file_keys = file_keys.iter().map(|s| s.to_string()).collect();
        p.legacy_files = legacy.iter().map(|s| s.to_string()).collect();
        p
    }

    fn gateway(storage: Arc<InMemoryStorage>) -> DownloadGateway {
        DownloadGateway::new(
            storage,
            Arc::new(InMemoryObjectStore::new()),
            3600,
            "https://files.cifra.example/",
        )
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let storage = Arc::new(InMemoryStorage::new());
        let err = gateway(storage).resolve("nope", 0).await.unwrap_err();
        assert!(matches!(err, DownloadError::TokenNotFound));
    }

    #[tokio::test]
    async fn test_signed_link_and_counter() {
        let storage = Arc::new(InMemoryStorage::new());
        let p = product(&["products/1700000000000-fonts.zip", "products/1700000000001-extras.zip"], &[]);
        issue(&storage, &p, "tok_signed", Utc::now()).await;
        let downloads = gateway(storage.clone());

        let first = downloads.resolve("tok_signed", 0).await.unwrap();
        assert_eq!(first.kind, FileLocationKind::Signed);
        assert!(first.url.contains("products/1700000000000-fonts.zip"));
        assert!(first.url.contains("expires_in=3600"));

        let second = downloads.resolve("tok_signed", 1).await.unwrap();
        assert!(second.url.contains("extras.zip"));

        let token = storage.get_download_token("tok_signed").await.unwrap().unwrap();
        assert_eq!(token.download_count, 2);
        assert!(token.used);

        assert!(matches!(
            downloads.resolve("tok_signed", 2).await,
            Err(DownloadError::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_before_counting() {
        let storage = Arc::new(InMemoryStorage::new());
        let p = product(&["products/1-a.zip"], &[]);
        issue(&storage, &p, "tok_old", Utc::now() - Duration::days(31)).await;
        let downloads = gateway(storage.clone());

        assert!(matches!(
            downloads.resolve("tok_old", 0).await,
            Err(DownloadError::TokenExpired)
        ));
        let token = storage.get_download_token("tok_old").await.unwrap().unwrap();
        assert_eq!(token.download_count, 0);

        let info = downloads.describe("tok_old").await.unwrap();
        assert!(info.expired);
    }

    #[tokio::test]
    async fn test_legacy_files_and_empty_products() {
        let storage = Arc::new(InMemoryStorage::new());
        let legacy = product(&[], &["guide.pdf"]);
        issue(&storage, &legacy, "tok_legacy", Utc::now()).await;
        let empty = product(&[], &[]);
        issue(&storage, &empty, "tok_empty", Utc::now()).await;
        let downloads = gateway(storage.clone());

        let location = downloads.resolve("tok_legacy", 0).await.unwrap();
        assert_eq!(location.kind, FileLocationKind::Legacy);
        assert_eq!(
            location.url,
            format!("https://files.cifra.example/{}/guide.pdf", legacy.id)
        );

        assert!(matches!(
            downloads.resolve("tok_empty", 0).await,
            Err(DownloadError::FileNotFound)
        ));
        let token = storage.get_download_token("tok_empty").await.unwrap().unwrap();
        assert_eq!(token.download_count, 0);
    }

    #[tokio::test]
    async fn test_describe_lists_file_names() {
        let storage = Arc::new(InMemoryStorage::new());
        let p = product(&["products/1700000000000-fonts.zip"], &[]);
        issue(&storage, &p, "tok_info", Utc::now()).await;

        let info = gateway(storage).describe("tok_info").await.unwrap();
        assert_eq!(info.product_title, "Font bundle");
        assert_eq!(info.files, vec!["fonts.zip".to_string()]);
        assert_eq!(info.download_count, 0);
        assert!(!info.expired);
    }

    #[test]
    fn test_display_file_name() {
        assert_eq!(display_file_name("products/1700000000000-my-file.zip"), "my-file.zip");
        assert_eq!(display_file_name("products/cover-art.png"), "cover-art.png");
        assert_eq!(display_file_name("plain.txt"), "plain.txt");
    }
}
