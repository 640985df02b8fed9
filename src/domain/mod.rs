//! Marketplace records shared by the storage layer, the use cases and the HTTP layer.
//!
//! Money is always an integer amount of currency units. Identifiers are UUIDs except for
//! download tokens, which are opaque random strings handed to buyers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CifraError;

/// Declares a lowercase string-backed status enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CifraError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CifraError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Publication state of a product. Only published products can be bought.
    ProductStatus {
        Draft => "draft",
        Published => "published",
    }
);

string_enum!(
    /// Lifecycle of a purchase intent.
    ///
    /// `pending` is the only non-terminal state; every transition leaves it and none return.
    OrderStatus {
        Pending => "pending",
        Paid => "paid",
        Canceled => "canceled",
        Failed => "failed",
    }
);

string_enum!(
    PayoutStatus {
        Pending => "pending",
        Completed => "completed",
    }
);

string_enum!(
    NotificationKind {
        BuyerPurchase => "buyer_purchase",
        SellerSale => "seller_sale",
        Test => "test",
    }
);

string_enum!(
    NotificationStatus {
        Pending => "pending",
        Sent => "sent",
        Abandoned => "abandoned",
    }
);

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        matches!(
            (self, to),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Canceled)
                | (OrderStatus::Pending, OrderStatus::Failed)
        )
    }
}

/// Account that owns products and receives sale notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seller {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub email_notifications: bool,
    pub created_at: DateTime<Utc>,
}

impl Seller {
    pub fn new(email: &str, display_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_string(),
            display_name: display_name.trim().to_string(),
            email_notifications: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub category: String,
    pub cover_image: Option<String>,
    pub status: ProductStatus,
    /// Object storage keys, in the order the seller uploaded them.
    pub file_keys: Vec<String>,
    /// File names from before the object storage migration.
    pub legacy_files: Vec<String>,
    pub sales: i64,
    /// Cumulative net revenue.
    pub revenue: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new_draft(
        seller_id: Uuid,
        title: &str,
        description: &str,
        price: i64,
        category: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seller_id,
            title: title.trim().to_string(),
            description: description.trim().to_string(),
            price,
            category: category.to_string(),
            cover_image: None,
            status: ProductStatus::Draft,
            file_keys: Vec::new(),
            legacy_files: Vec::new(),
            sales: 0,
            revenue: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_published(&self) -> bool {
        self.status == ProductStatus::Published
    }

    /// Number of downloadable files, object storage keys taking precedence over legacy files.
    pub fn file_count(&self) -> usize {
        if !self.file_keys.is_empty() {
            self.file_keys.len()
        } else {
            self.legacy_files.len()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_email: String,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    /// Payment id assigned by the gateway; unique across orders.
    pub external_payment_id: String,
    pub promo_id: Option<Uuid>,
    /// Raw provider payload, replaced by the verified payment on transition.
    pub provider_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Fields stamped onto an order together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub paid_at: Option<DateTime<Utc>>,
    pub provider_metadata: Option<serde_json::Value>,
}

/// Result of a conditional status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The order was not in the expected state; nothing changed.
    Conflict { current: OrderStatus },
}

/// Append-only ledger entry for a fulfilled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_email: String,
    pub amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: Uuid,
    pub seller_id: Uuid,
    /// Stored uppercased; matched case-insensitively.
    pub code: String,
    pub discount_percent: i64,
    pub is_active: bool,
    pub uses: i64,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    pub fn new(seller_id: Uuid, code: &str, discount_percent: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            seller_id,
            code: normalize_promo_code(code),
            discount_percent,
            is_active: true,
            uses: 0,
            created_at: Utc::now(),
        }
    }

    /// Price after the discount, rounding the discount half up.
    pub fn apply(&self, price: i64) -> i64 {
        let discount = (price * self.discount_percent + 50) / 100;
        price - discount
    }
}

pub fn normalize_promo_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Bearer credential granting the buyer of one order access to the product files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadToken {
    pub token: String,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub buyer_email: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
}

impl DownloadToken {
    pub fn issue(token: String, order: &Order, issued_at: DateTime<Utc>, ttl_days: i64) -> Self {
        Self {
            token,
            order_id: order.id,
            product_id: order.product_id,
            buyer_email: order.buyer_email.clone(),
            expires_at: issued_at + Duration::days(ttl_days),
            used: false,
            download_count: 0,
            created_at: issued_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Short prefix for logs; full tokens are never logged.
    pub fn redacted(&self) -> String {
        redact_token(&self.token)
    }
}

pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub amount: i64,
    pub method: String,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
}

/// Outbox entry for an email that must be delivered after a committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        order_id: Option<Uuid>,
        kind: NotificationKind,
        recipient: &str,
        subject: String,
        html_body: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            kind,
            recipient: recipient.to_string(),
            subject,
            html_body,
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }
}
