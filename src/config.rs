use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::constants::{
    DEFAULT_CURRENCY, DOWNLOAD_TOKEN_TTL_DAYS, OUTBOX_BATCH_SIZE, OUTBOX_MAX_ATTEMPTS,
    SIGNED_URL_TTL_SECS,
};
use crate::error::{CifraError, Result};
use crate::fees::FeeSchedule;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub payments: PaymentsConfig,
    pub object_storage: ObjectStorageConfig,
    pub email: EmailConfig,
    pub fees: FeeSchedule,
    pub downloads: DownloadsConfig,
    pub outbox: OutboxConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Public base URL used in payment return links and download emails.
    pub site_url: String,
    /// Enables `/api/test-webhook` and `/api/test-email`.
    pub dev_routes: bool,
    /// Bearer token for the seller API. Seller routes are disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            site_url: "http://localhost:3000".to_string(),
            dev_routes: false,
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            path: "data/cifra.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Yookassa,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub provider: PaymentProvider,
    pub api_base: String,
    pub shop_id: Option<String>,
    pub secret_key: Option<String>,
    pub currency: String,
    pub timeout_seconds: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            provider: PaymentProvider::Memory,
            api_base: "https://api.yookassa.ru/v3".to_string(),
            shop_id: None,
            secret_key: None,
            currency: DEFAULT_CURRENCY.to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStorageProvider {
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub provider: ObjectStorageProvider,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// `https://endpoint/bucket/key` instead of `https://bucket.endpoint/key`.
    pub path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub signed_url_ttl_seconds: u64,
    pub legacy_files_base_url: String,
    pub timeout_seconds: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            provider: ObjectStorageProvider::Memory,
            endpoint: "https://storage.yandexcloud.net".to_string(),
            region: "ru-central1".to_string(),
            bucket: "cifra-test".to_string(),
            path_style: false,
            access_key_id: None,
            secret_access_key: None,
            signed_url_ttl_seconds: SIGNED_URL_TTL_SECS,
            legacy_files_base_url: "http://localhost:8090/api/files/products".to_string(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    Resend,
    Log,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub provider: EmailProvider,
    pub api_base: String,
    pub api_key: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
    pub timeout_seconds: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: EmailProvider::Log,
            api_base: "https://api.resend.com".to_string(),
            api_key: None,
            sender_email: "onboarding@resend.dev".to_string(),
            sender_name: "Cifra".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadsConfig {
    pub token_ttl_days: i64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            token_ttl_days: DOWNLOAD_TOKEN_TTL_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_attempts: u32,
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: OUTBOX_MAX_ATTEMPTS,
            poll_interval_seconds: 30,
            batch_size: OUTBOX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub min_pending_age_minutes: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            min_pending_age_minutes: 15,
        }
    }
}

fn env_override(target: &mut Option<String>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            *target = Some(value.trim().to_string());
        }
    }
}

impl Config {
    /// Load `path` (missing file means defaults), apply `.env` and environment overrides, validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if dotenv::dotenv().is_ok() {
            info!("Loaded environment from .env");
        }

        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                CifraError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
            })?;
            Self::from_toml(&content)?
        } else {
            warn!("Config file '{}' not found, using defaults", path.display());
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(&mut self) {
        env_override(&mut self.payments.shop_id, "YOOKASSA_SHOP_ID");
        env_override(&mut self.payments.secret_key, "YOOKASSA_SECRET_KEY");
        env_override(&mut self.object_storage.access_key_id, "OBJECT_STORAGE_ACCESS_KEY_ID");
        env_override(&mut self.object_storage.secret_access_key, "OBJECT_STORAGE_SECRET_ACCESS_KEY");
        env_override(&mut self.email.api_key, "RESEND_API_KEY");
        env_override(&mut self.server.admin_token, "CIFRA_ADMIN_TOKEN");

        let mut site_url = None;
        env_override(&mut site_url, "CIFRA_SITE_URL");
        if let Some(url) = site_url {
            self.server.site_url = url;
        }
        let mut db_path = None;
        env_override(&mut db_path, "CIFRA_DATABASE_PATH");
        if let Some(path) = db_path {
            self.database.path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CifraError::Config(msg.to_string()));

        if !self.server.site_url.starts_with("http://") && !self.server.site_url.starts_with("https://") {
            return fail("server.site_url must be an http(s) URL");
        }
        if self.database.backend == DatabaseBackend::Sqlite && self.database.path.trim().is_empty() {
            return fail("database.path is required for the sqlite backend");
        }
        if self.payments.provider == PaymentProvider::Yookassa
            && (self.payments.shop_id.is_none() || self.payments.secret_key.is_none())
        {
            return fail("payments.provider = yookassa requires YOOKASSA_SHOP_ID and YOOKASSA_SECRET_KEY");
        }
        if self.object_storage.provider == ObjectStorageProvider::S3
            && (self.object_storage.access_key_id.is_none()
                || self.object_storage.secret_access_key.is_none())
        {
            return fail("object_storage.provider = s3 requires access key id and secret access key");
        }
        if self.object_storage.provider == ObjectStorageProvider::S3 && self.object_storage.bucket.is_empty() {
            return fail("object_storage.bucket is required");
        }
        if self.email.provider == EmailProvider::Resend && self.email.api_key.is_none() {
            return fail("email.provider = resend requires RESEND_API_KEY");
        }
        if !(0..=100).contains(&self.fees.percent) || self.fees.flat < 0 {
            return fail("fees.percent must be within [0, 100] and fees.flat non-negative");
        }
        if self.downloads.token_ttl_days <= 0 {
            return fail("downloads.token_ttl_days must be positive");
        }
        if self.object_storage.signed_url_ttl_seconds == 0
            || self.object_storage.signed_url_ttl_seconds > 604_800
        {
            return fail("object_storage.signed_url_ttl_seconds must be within 1..=604800");
        }
        if self.outbox.max_attempts == 0 || self.outbox.batch_size == 0 {
            return fail("outbox.max_attempts and outbox.batch_size must be positive");
        }
        Ok(())
    }
}
