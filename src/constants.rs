/// Marketplace-wide constants shared by checkout, fulfillment and downloads.

/// Platform commission, percent of the gross amount.
pub const PLATFORM_FEE_PERCENT: i64 = 5;

/// Flat per-transaction fee in currency units.
pub const PLATFORM_FLAT_FEE: i64 = 30;

/// Lowest price a product may be listed or charged at; keeps the net amount positive.
pub const MIN_PRICE: i64 = 99;

/// Days a download token stays valid after the order is paid.
pub const DOWNLOAD_TOKEN_TTL_DAYS: i64 = 30;

/// Presigned object URL lifetime.
pub const SIGNED_URL_TTL_SECS: u64 = 3600;

/// Random bytes in a download token (hex encoded to twice as many characters).
pub const DOWNLOAD_TOKEN_BYTES: usize = 32;

pub const DEFAULT_CURRENCY: &str = "RUB";

// Payment gateway event names
pub const EVENT_PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const EVENT_PAYMENT_CANCELED: &str = "payment.canceled";

// Object storage folders
pub const PRODUCT_FILES_FOLDER: &str = "products";

/// How many outbox notifications a single dispatch pass picks up.
pub const OUTBOX_BATCH_SIZE: usize = 50;

/// Attempts before a notification is abandoned.
pub const OUTBOX_MAX_ATTEMPTS: u32 = 5;
