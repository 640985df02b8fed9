use super::{check_transition, Fulfillment, FulfillmentCommit, Storage};
use crate::domain::*;
use crate::error::{CifraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sellers (
    id                  TEXT PRIMARY KEY,
    email               TEXT NOT NULL,
    display_name        TEXT NOT NULL,
    email_notifications INTEGER NOT NULL DEFAULT 1,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
    id           TEXT PRIMARY KEY,
    seller_id    TEXT NOT NULL,
    title        TEXT NOT NULL,
    description  TEXT NOT NULL,
    price        INTEGER NOT NULL,
    category     TEXT NOT NULL,
    cover_image  TEXT,
    status       TEXT NOT NULL,
    file_keys    TEXT NOT NULL DEFAULT '[]',
    legacy_files TEXT NOT NULL DEFAULT '[]',
    sales        INTEGER NOT NULL DEFAULT 0,
    revenue      INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS promos (
    id               TEXT PRIMARY KEY,
    seller_id        TEXT NOT NULL,
    code             TEXT NOT NULL UNIQUE,
    discount_percent INTEGER NOT NULL,
    is_active        INTEGER NOT NULL DEFAULT 1,
    uses             INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id                  TEXT PRIMARY KEY,
    product_id          TEXT NOT NULL,
    seller_id           TEXT NOT NULL,
    buyer_email         TEXT NOT NULL,
    amount              INTEGER NOT NULL,
    currency            TEXT NOT NULL,
    status              TEXT NOT NULL,
    external_payment_id TEXT NOT NULL UNIQUE,
    promo_id            TEXT,
    provider_metadata   TEXT NOT NULL DEFAULT '{}',
    created_at          TEXT NOT NULL,
    paid_at             TEXT
);

CREATE TABLE IF NOT EXISTS sales (
    id           TEXT PRIMARY KEY,
    order_id     TEXT NOT NULL UNIQUE,
    product_id   TEXT NOT NULL,
    seller_id    TEXT NOT NULL,
    buyer_email  TEXT NOT NULL,
    amount       INTEGER NOT NULL,
    platform_fee INTEGER NOT NULL,
    net_amount   INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download_tokens (
    token          TEXT PRIMARY KEY,
    order_id       TEXT NOT NULL UNIQUE,
    product_id     TEXT NOT NULL,
    buyer_email    TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    used           INTEGER NOT NULL DEFAULT 0,
    download_count INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id         TEXT PRIMARY KEY,
    seller_id  TEXT NOT NULL,
    amount     INTEGER NOT NULL,
    method     TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id         TEXT PRIMARY KEY,
    order_id   TEXT,
    kind       TEXT NOT NULL,
    recipient  TEXT NOT NULL,
    subject    TEXT NOT NULL,
    html_body  TEXT NOT NULL,
    status     TEXT NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    sent_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_products_seller ON products(seller_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, created_at);
CREATE INDEX IF NOT EXISTS idx_sales_seller ON sales(seller_id);
CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status, created_at);
"#;

/// SQLite-backed ledger. One connection guarded by a mutex; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened SQLite ledger at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CifraError::storage("sqlite connection lock poisoned"))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| CifraError::storage(format!("blocking task failed: {e}")))?
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order.
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error<E>(row: &Row<'_>, col: &str, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let idx = row.as_ref().column_index(col).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(col)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(row, col, e))
}

fn opt_uuid_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(row, col, e)))
        .transpose()
}

fn time_col(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(row, col, e))
}

fn opt_time_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(row, col, e))
    })
    .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(row, col, e))
}

fn enum_col<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = CifraError>,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e| conversion_error(row, col, e))
}

const BALANCE_SQL: &str = "SELECT
        COALESCE((SELECT SUM(net_amount) FROM sales WHERE seller_id = ?1), 0)
      - COALESCE((SELECT SUM(amount) FROM payouts WHERE seller_id = ?1), 0)";

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn seller_from_row(row: &Row<'_>) -> rusqlite::Result<Seller> {
    Ok(Seller {
        id: uuid_col(row, "id")?,
        email: row.get("email")?,
        display_name: row.get("display_name")?,
        email_notifications: row.get("email_notifications")?,
        created_at: time_col(row, "created_at")?,
    })
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: uuid_col(row, "id")?,
        seller_id: uuid_col(row, "seller_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        price: row.get("price")?,
        category: row.get("category")?,
        cover_image: row.get("cover_image")?,
        status: enum_col(row, "status")?,
        file_keys: json_col(row, "file_keys")?,
        legacy_files: json_col(row, "legacy_files")?,
        sales: row.get("sales")?,
        revenue: row.get("revenue")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
    })
}

fn promo_from_row(row: &Row<'_>) -> rusqlite::Result<PromoCode> {
    Ok(PromoCode {
        id: uuid_col(row, "id")?,
        seller_id: uuid_col(row, "seller_id")?,
        code: row.get("code")?,
        discount_percent: row.get("discount_percent")?,
        is_active: row.get("is_active")?,
        uses: row.get("uses")?,
        created_at: time_col(row, "created_at")?,
    })
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: uuid_col(row, "id")?,
        product_id: uuid_col(row, "product_id")?,
        seller_id: uuid_col(row, "seller_id")?,
        buyer_email: row.get("buyer_email")?,
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        status: enum_col(row, "status")?,
        external_payment_id: row.get("external_payment_id")?,
        promo_id: opt_uuid_col(row, "promo_id")?,
        provider_metadata: json_col(row, "provider_metadata")?,
        created_at: time_col(row, "created_at")?,
        paid_at: opt_time_col(row, "paid_at")?,
    })
}

fn sale_from_row(row: &Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        id: uuid_col(row, "id")?,
        order_id: uuid_col(row, "order_id")?,
        product_id: uuid_col(row, "product_id")?,
        seller_id: uuid_col(row, "seller_id")?,
        buyer_email: row.get("buyer_email")?,
        amount: row.get("amount")?,
        platform_fee: row.get("platform_fee")?,
        net_amount: row.get("net_amount")?,
        created_at: time_col(row, "created_at")?,
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadToken> {
    Ok(DownloadToken {
        token: row.get("token")?,
        order_id: uuid_col(row, "order_id")?,
        product_id: uuid_col(row, "product_id")?,
        buyer_email: row.get("buyer_email")?,
        expires_at: time_col(row, "expires_at")?,
        used: row.get("used")?,
        download_count: row.get("download_count")?,
        created_at: time_col(row, "created_at")?,
    })
}

fn payout_from_row(row: &Row<'_>) -> rusqlite::Result<Payout> {
    Ok(Payout {
        id: uuid_col(row, "id")?,
        seller_id: uuid_col(row, "seller_id")?,
        amount: row.get("amount")?,
        method: row.get("method")?,
        status: enum_col(row, "status")?,
        created_at: time_col(row, "created_at")?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: uuid_col(row, "id")?,
        order_id: opt_uuid_col(row, "order_id")?,
        kind: enum_col(row, "kind")?,
        recipient: row.get("recipient")?,
        subject: row.get("subject")?,
        html_body: row.get("html_body")?,
        status: enum_col(row, "status")?,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        created_at: time_col(row, "created_at")?,
        sent_at: opt_time_col(row, "sent_at")?,
    })
}

fn insert_notification(conn: &Connection, n: &Notification) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO notifications
             (id, order_id, kind, recipient, subject, html_body, status, attempts, last_error, created_at, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            n.id.to_string(),
            n.order_id.map(|id| id.to_string()),
            n.kind.as_str(),
            n.recipient,
            n.subject,
            n.html_body,
            n.status.as_str(),
            n.attempts,
            n.last_error,
            ts(&n.created_at),
            n.sent_at.as_ref().map(ts),
        ],
    )
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_seller(&self, seller: &Seller) -> Result<()> {
        let seller = seller.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sellers (id, email, display_name, email_notifications, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    seller.id.to_string(),
                    seller.email,
                    seller.display_name,
                    seller.email_notifications,
                    ts(&seller.created_at),
                ],
            )?;
            debug!("Created seller {} with id {}", seller.email, seller.id);
            Ok(())
        })
        .await
    }

    async fn get_seller(&self, id: Uuid) -> Result<Option<Seller>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM sellers WHERE id = ?1",
                    params![id.to_string()],
                    seller_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_seller(&self, seller: &Seller) -> Result<()> {
        let seller = seller.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE sellers SET email = ?2, display_name = ?3, email_notifications = ?4 WHERE id = ?1",
                params![
                    seller.id.to_string(),
                    seller.email,
                    seller.display_name,
                    seller.email_notifications,
                ],
            )?;
            if changed == 0 {
                return Err(CifraError::not_found("seller", seller.id));
            }
            Ok(())
        })
        .await
    }

    async fn create_product(&self, product: &Product) -> Result<()> {
        let p = product.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO products
                     (id, seller_id, title, description, price, category, cover_image, status,
                      file_keys, legacy_files, sales, revenue, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    p.id.to_string(),
                    p.seller_id.to_string(),
                    p.title,
                    p.description,
                    p.price,
                    p.category,
                    p.cover_image,
                    p.status.as_str(),
                    serde_json::to_string(&p.file_keys)?,
                    serde_json::to_string(&p.legacy_files)?,
                    p.sales,
                    p.revenue,
                    ts(&p.created_at),
                    ts(&p.updated_at),
                ],
            )?;
            debug!("Created product: {} with id {}", p.title, p.id);
            Ok(())
        })
        .await
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM products WHERE id = ?1",
                    params![id.to_string()],
                    product_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_product(&self, product: &Product) -> Result<()> {
        let p = product.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE products SET title = ?2, description = ?3, price = ?4, category = ?5,
                     cover_image = ?6, status = ?7, file_keys = ?8, legacy_files = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    p.id.to_string(),
                    p.title,
                    p.description,
                    p.price,
                    p.category,
                    p.cover_image,
                    p.status.as_str(),
                    serde_json::to_string(&p.file_keys)?,
                    serde_json::to_string(&p.legacy_files)?,
                    ts(&p.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(CifraError::not_found("product", p.id));
            }
            debug!("Updated product: {} with id {}", p.title, p.id);
            Ok(())
        })
        .await
    }

    async fn delete_product(&self, id: Uuid) -> Result<bool> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let referenced: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM orders
                     WHERE product_id = ?1 AND status IN ('pending', 'paid'))",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            if referenced {
                return Err(CifraError::Conflict(
                    "product has orders; unpublish it instead".to_string(),
                ));
            }
            let changed = tx.execute("DELETE FROM products WHERE id = ?1", params![id.to_string()])?;
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_products(&self, seller_id: Uuid, include_drafts: bool) -> Result<Vec<Product>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM products
                 WHERE seller_id = ?1 AND (?2 OR status = 'published')
                 ORDER BY created_at DESC",
            )?;
            let products = stmt
                .query_map(params![seller_id.to_string(), include_drafts], product_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(products)
        })
        .await
    }

    async fn create_promo(&self, promo: &PromoCode) -> Result<()> {
        let promo = promo.clone();
        self.run(move |conn| {
            let code = normalize_promo_code(&promo.code);
            let inserted = conn.execute(
                "INSERT INTO promos (id, seller_id, code, discount_percent, is_active, uses, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    promo.id.to_string(),
                    promo.seller_id.to_string(),
                    code,
                    promo.discount_percent,
                    promo.is_active,
                    promo.uses,
                    ts(&promo.created_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(CifraError::Conflict(format!(
                    "promo code {code} already exists"
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_promo(&self, id: Uuid) -> Result<Option<PromoCode>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM promos WHERE id = ?1",
                    params![id.to_string()],
                    promo_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn find_active_promo_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        let code = normalize_promo_code(code);
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM promos WHERE code = ?1 AND is_active = 1",
                    params![code],
                    promo_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_promo(&self, promo: &PromoCode) -> Result<()> {
        let promo = promo.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE promos SET discount_percent = ?2, is_active = ?3 WHERE id = ?1",
                params![promo.id.to_string(), promo.discount_percent, promo.is_active],
            )?;
            if changed == 0 {
                return Err(CifraError::not_found("promo code", promo.id));
            }
            Ok(())
        })
        .await
    }

    async fn delete_promo(&self, id: Uuid) -> Result<bool> {
        self.run(move |conn| {
            let changed = conn.execute("DELETE FROM promos WHERE id = ?1", params![id.to_string()])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_promos(&self, seller_id: Uuid) -> Result<Vec<PromoCode>> {
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM promos WHERE seller_id = ?1 ORDER BY created_at DESC")?;
            let promos = stmt
                .query_map(params![seller_id.to_string()], promo_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(promos)
        })
        .await
    }

    async fn create_order(&self, order: &Order) -> Result<()> {
        let o = order.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let product_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM products WHERE id = ?1)",
                params![o.product_id.to_string()],
                |row| row.get(0),
            )?;
            if !product_exists {
                return Err(CifraError::not_found("product", o.product_id));
            }
            let inserted = tx.execute(
                "INSERT INTO orders
                     (id, product_id, seller_id, buyer_email, amount, currency, status,
                      external_payment_id, promo_id, provider_metadata, created_at, paid_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    o.id.to_string(),
                    o.product_id.to_string(),
                    o.seller_id.to_string(),
                    o.buyer_email,
                    o.amount,
                    o.currency,
                    o.status.as_str(),
                    o.external_payment_id,
                    o.promo_id.map(|id| id.to_string()),
                    o.provider_metadata.to_string(),
                    ts(&o.created_at),
                    o.paid_at.as_ref().map(ts),
                ],
            );
            match inserted {
                Ok(_) => {
                    tx.commit()?;
                    debug!("Created order {} for payment {}", o.id, o.external_payment_id);
                    Ok(())
                }
                Err(e) if is_unique_violation(&e) => Err(CifraError::Conflict(format!(
                    "payment {} already has an order",
                    o.external_payment_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM orders WHERE id = ?1",
                    params![id.to_string()],
                    order_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn find_order_by_payment_id(&self, payment_id: &str) -> Result<Option<Order>> {
        let payment_id = payment_id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM orders WHERE external_payment_id = ?1",
                    params![payment_id],
                    order_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn transition_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        update: OrderUpdate,
    ) -> Result<TransitionOutcome> {
        check_transition(from, to)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE orders SET status = ?3,
                     paid_at = COALESCE(?4, paid_at),
                     provider_metadata = COALESCE(?5, provider_metadata)
                 WHERE id = ?1 AND status = ?2",
                params![
                    id.to_string(),
                    from.as_str(),
                    to.as_str(),
                    update.paid_at.as_ref().map(ts),
                    update.provider_metadata.as_ref().map(|v| v.to_string()),
                ],
            )?;
            if changed == 1 {
                debug!("Order {} moved {} -> {}", id, from, to);
                return Ok(TransitionOutcome::Applied);
            }
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM orders WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(status) => Ok(TransitionOutcome::Conflict {
                    current: status.parse()?,
                }),
                None => Err(CifraError::not_found("order", id)),
            }
        })
        .await
    }

    async fn list_pending_orders(&self, created_before: DateTime<Utc>) -> Result<Vec<Order>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM orders WHERE status = 'pending' AND created_at < ?1
                 ORDER BY created_at ASC",
            )?;
            let orders = stmt
                .query_map(params![ts(&created_before)], order_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(orders)
        })
        .await
    }

    async fn commit_fulfillment(&self, fulfillment: &Fulfillment) -> Result<FulfillmentCommit> {
        let f = fulfillment.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;

            let claimed = tx.execute(
                "UPDATE orders SET status = 'paid', paid_at = ?2, provider_metadata = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    f.order_id.to_string(),
                    ts(&f.paid_at),
                    f.provider_metadata.to_string(),
                ],
            )?;
            if claimed == 0 {
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM orders WHERE id = ?1",
                        params![f.order_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match current {
                    Some(status) => Ok(FulfillmentCommit::AlreadyHandled {
                        current: status.parse()?,
                    }),
                    None => Err(CifraError::not_found("order", f.order_id)),
                };
            }

            let s = &f.sale;
            tx.execute(
                "INSERT INTO sales
                     (id, order_id, product_id, seller_id, buyer_email, amount, platform_fee, net_amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    s.id.to_string(),
                    s.order_id.to_string(),
                    s.product_id.to_string(),
                    s.seller_id.to_string(),
                    s.buyer_email,
                    s.amount,
                    s.platform_fee,
                    s.net_amount,
                    ts(&s.created_at),
                ],
            )?;

            let bumped = tx.execute(
                "UPDATE products SET sales = sales + 1, revenue = revenue + ?2 WHERE id = ?1",
                params![s.product_id.to_string(), s.net_amount],
            )?;
            if bumped == 0 {
                // Dropping the transaction rolls back the order claim.
                return Err(CifraError::not_found("product", s.product_id));
            }

            let promo_counted = match f.promo_id {
                Some(promo_id) => {
                    let counted = tx.execute(
                        "UPDATE promos SET uses = uses + 1 WHERE id = ?1",
                        params![promo_id.to_string()],
                    )? > 0;
                    if !counted {
                        warn!("Promo {} referenced by order {} no longer exists", promo_id, f.order_id);
                    }
                    counted
                }
                None => false,
            };

            let t = &f.token;
            tx.execute(
                "INSERT INTO download_tokens
                     (token, order_id, product_id, buyer_email, expires_at, used, download_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    t.token,
                    t.order_id.to_string(),
                    t.product_id.to_string(),
                    t.buyer_email,
                    ts(&t.expires_at),
                    t.used,
                    t.download_count,
                    ts(&t.created_at),
                ],
            )?;

            for notification in &f.notifications {
                insert_notification(&tx, notification)?;
            }

            tx.commit()?;
            Ok(FulfillmentCommit::Committed { promo_counted })
        })
        .await
    }

    async fn get_sale_by_order(&self, order_id: Uuid) -> Result<Option<Sale>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM sales WHERE order_id = ?1",
                    params![order_id.to_string()],
                    sale_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_sales(&self, seller_id: Uuid) -> Result<Vec<Sale>> {
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM sales WHERE seller_id = ?1 ORDER BY created_at DESC")?;
            let sales = stmt
                .query_map(params![seller_id.to_string()], sale_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sales)
        })
        .await
    }

    async fn get_download_token(&self, token: &str) -> Result<Option<DownloadToken>> {
        let token = token.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM download_tokens WHERE token = ?1",
                    params![token],
                    token_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn get_download_token_by_order(&self, order_id: Uuid) -> Result<Option<DownloadToken>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM download_tokens WHERE order_id = ?1",
                    params![order_id.to_string()],
                    token_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn record_download(&self, token: &str) -> Result<Option<DownloadToken>> {
        let token = token.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE download_tokens SET download_count = download_count + 1, used = 1 WHERE token = ?1",
                params![token],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let updated = tx.query_row(
                "SELECT * FROM download_tokens WHERE token = ?1",
                params![token],
                token_from_row,
            )?;
            tx.commit()?;
            Ok(Some(updated))
        })
        .await
    }

    async fn available_balance(&self, seller_id: Uuid) -> Result<i64> {
        self.run(move |conn| {
            let balance = conn.query_row(BALANCE_SQL, params![seller_id.to_string()], |row| row.get(0))?;
            Ok(balance)
        })
        .await
    }

    async fn create_payout(&self, payout: &Payout) -> Result<()> {
        let p = payout.clone();
        self.run(move |conn| {
            // Immediate: the balance read and the insert hold the write lock together.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let balance: i64 = tx.query_row(BALANCE_SQL, params![p.seller_id.to_string()], |row| row.get(0))?;
            if p.amount > balance {
                return Err(CifraError::Validation(format!(
                    "requested {} exceeds available balance {}",
                    p.amount,
                    balance.max(0)
                )));
            }
            tx.execute(
                "INSERT INTO payouts (id, seller_id, amount, method, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.id.to_string(),
                    p.seller_id.to_string(),
                    p.amount,
                    p.method,
                    p.status.as_str(),
                    ts(&p.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_payouts(&self, seller_id: Uuid) -> Result<Vec<Payout>> {
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM payouts WHERE seller_id = ?1 ORDER BY created_at DESC")?;
            let payouts = stmt
                .query_map(params![seller_id.to_string()], payout_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(payouts)
        })
        .await
    }

    async fn enqueue_notification(&self, notification: &Notification) -> Result<()> {
        let n = notification.clone();
        self.run(move |conn| {
            insert_notification(conn, &n)?;
            Ok(())
        })
        .await
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM notifications WHERE status = 'pending'
                 ORDER BY created_at ASC LIMIT ?1",
            )?;
            let pending = stmt
                .query_map(params![limit], notification_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pending)
        })
        .await
    }

    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE notifications SET status = 'sent', attempts = attempts + 1,
                     sent_at = ?2, last_error = NULL
                 WHERE id = ?1",
                params![id.to_string(), ts(&sent_at)],
            )?;
            if changed == 0 {
                return Err(CifraError::not_found("notification", id));
            }
            Ok(())
        })
        .await
    }

    async fn record_notification_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<NotificationStatus> {
        let error = error.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE notifications SET attempts = attempts + 1, last_error = ?2,
                     status = CASE WHEN attempts + 1 >= ?3 THEN 'abandoned' ELSE status END
                 WHERE id = ?1",
                params![id.to_string(), error, max_attempts],
            )?;
            if changed == 0 {
                return Err(CifraError::not_found("notification", id));
            }
            let status: String = conn.query_row(
                "SELECT status FROM notifications WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            status.parse()
        })
        .await
    }
}
