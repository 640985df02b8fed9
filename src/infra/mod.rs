pub mod memory;
pub mod resend;
pub mod s3;
pub mod yookassa;

use std::sync::Arc;
use tracing::info;

use crate::app::ports::{MailerPort, ObjectStorePort, PaymentGatewayPort};
use crate::config::{
    Config, DatabaseBackend, EmailProvider, ObjectStorageProvider, PaymentProvider,
};
use crate::error::Result;
use crate::storage::{InMemoryStorage, SqliteStorage, Storage};

pub fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite ledger at {}", config.database.path);
            Ok(Arc::new(SqliteStorage::open(&config.database.path)?))
        }
        DatabaseBackend::Memory => {
            info!("Using in-memory ledger; nothing survives a restart");
            Ok(Arc::new(InMemoryStorage::new()))
        }
    }
}

pub fn build_payment_gateway(config: &Config) -> Result<Arc<dyn PaymentGatewayPort>> {
    match config.payments.provider {
        PaymentProvider::Yookassa => Ok(Arc::new(yookassa::YooKassaGateway::new(&config.payments)?)),
        PaymentProvider::Memory => Ok(Arc::new(memory::InMemoryPaymentGateway::new())),
    }
}

pub fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStorePort>> {
    match config.object_storage.provider {
        ObjectStorageProvider::S3 => Ok(Arc::new(s3::S3ObjectStore::new(&config.object_storage)?)),
        ObjectStorageProvider::Memory => Ok(Arc::new(memory::InMemoryObjectStore::new())),
    }
}

pub fn build_mailer(config: &Config) -> Result<Arc<dyn MailerPort>> {
    match config.email.provider {
        EmailProvider::Resend => Ok(Arc::new(resend::ResendMailer::new(&config.email)?)),
        EmailProvider::Log => Ok(Arc::new(memory::LogMailer)),
    }
}
