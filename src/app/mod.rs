pub mod catalog_use_case;
pub mod checkout_use_case;
pub mod download_use_case;
pub mod fulfillment_use_case;
pub mod notification_use_case;
pub mod ports;
pub mod reconcile_use_case;
pub mod webhook;

pub use catalog_use_case::CatalogService;
pub use checkout_use_case::{CheckoutService, CheckoutSession};
pub use download_use_case::{DownloadError, DownloadGateway, FileLocation, FileLocationKind};
pub use fulfillment_use_case::{FulfillmentEngine, FulfillmentError, FulfillmentOutcome, FulfillmentSettings};
pub use notification_use_case::NotificationDispatcher;
pub use reconcile_use_case::ReconcileService;
pub use webhook::WebhookEvent;
