use askama::Template;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::ports::MailerPort;
use crate::domain::{Notification, NotificationKind, NotificationStatus};
use crate::error::Result;
use crate::metrics::NotificationMetrics;
use crate::storage::Storage;

#[derive(Template)]
#[template(path = "emails/buyer_purchase.html")]
struct BuyerPurchaseEmail<'a> {
    order_id: Uuid,
    product_title: &'a str,
    amount: i64,
    currency: &'a str,
    download_url: &'a str,
    expires: String,
}

#[derive(Template)]
#[template(path = "emails/seller_sale.html")]
struct SellerSaleEmail<'a> {
    order_id: Uuid,
    product_title: &'a str,
    buyer_email: &'a str,
    amount: i64,
    net_amount: i64,
    currency: &'a str,
}

#[derive(Template)]
#[template(path = "emails/test.html")]
struct TestEmail<'a> {
    site_url: &'a str,
}

/// Purchase confirmation with the download link.
pub fn buyer_purchase_email(
    order_id: Uuid,
    product_title: &str,
    amount: i64,
    currency: &str,
    download_url: &str,
    expires_at: DateTime<Utc>,
) -> Result<(String, String)> {
    let subject = format!("Your purchase on Cifra: {product_title}");
    let html = BuyerPurchaseEmail {
        order_id,
        product_title,
        amount,
        currency,
        download_url,
        expires: expires_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
    .render()?;
    Ok((subject, html))
}

/// Sale notification for the seller.
pub fn seller_sale_email(
    order_id: Uuid,
    product_title: &str,
    buyer_email: &str,
    amount: i64,
    net_amount: i64,
    currency: &str,
) -> Result<(String, String)> {
    let subject = format!("New sale on Cifra: {product_title}");
    let html = SellerSaleEmail {
        order_id,
        product_title,
        buyer_email,
        amount,
        net_amount,
        currency,
    }
    .render()?;
    Ok((subject, html))
}

/// Sample message for checking delivery settings.
pub fn test_email(kind: NotificationKind, site_url: &str) -> Result<(String, String)> {
    match kind {
        NotificationKind::BuyerPurchase => buyer_purchase_email(
            Uuid::nil(),
            "Test product",
            990,
            "RUB",
            &format!("{}/download/test-token", site_url.trim_end_matches('/')),
            Utc::now() + chrono::Duration::days(30),
        ),
        NotificationKind::SellerSale => {
            seller_sale_email(Uuid::nil(), "Test product", "buyer@example.com", 990, 910, "RUB")
        }
        NotificationKind::Test => {
            let html = TestEmail { site_url }.render()?;
            Ok(("Cifra test email".to_string(), html))
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
}

/// Delivers pending outbox notifications through the mailer.
pub struct NotificationDispatcher {
    storage: Arc<dyn Storage>,
    mailer: Arc<dyn MailerPort>,
    max_attempts: u32,
    // One pass at a time per process, so a notification is not picked up twice.
    pass: Mutex<()>,
    wake: Notify,
}

impl NotificationDispatcher {
    pub fn new(storage: Arc<dyn Storage>, mailer: Arc<dyn MailerPort>, max_attempts: u32) -> Self {
        Self {
            storage,
            mailer,
            max_attempts: max_attempts.max(1),
            pass: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Ask the running worker for an immediate pass. Never blocks.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn enqueue(&self, notification: &Notification) -> Result<()> {
        self.storage.enqueue_notification(notification).await
    }

    /// Send up to `limit` pending notifications, oldest first.
    pub async fn dispatch_pending(&self, limit: usize) -> Result<DispatchReport> {
        let _pass = self.pass.lock().await;
        let pending = self.storage.pending_notifications(limit).await?;
        NotificationMetrics::set_backlog(pending.len());
        let mut report = DispatchReport::default();

        for notification in pending {
            match self
                .mailer
                .send(&notification.recipient, &notification.subject, &notification.html_body)
                .await
            {
                Ok(()) => {
                    self.storage
                        .mark_notification_sent(notification.id, Utc::now())
                        .await?;
                    NotificationMetrics::record_sent(notification.kind.as_str());
                    debug!(
                        notification_id = %notification.id,
                        kind = %notification.kind,
                        "Notification sent"
                    );
                    report.sent += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    NotificationMetrics::record_failed(notification.kind.as_str());
                    let status = self
                        .storage
                        .record_notification_failure(notification.id, &message, self.max_attempts)
                        .await?;
                    if status == NotificationStatus::Abandoned {
                        NotificationMetrics::record_abandoned();
                        error!(
                            notification_id = %notification.id,
                            order_id = ?notification.order_id,
                            kind = %notification.kind,
                            "Notification abandoned after {} attempts: {}",
                            self.max_attempts,
                            message
                        );
                        report.abandoned += 1;
                    } else {
                        warn!(
                            notification_id = %notification.id,
                            kind = %notification.kind,
                            "Notification delivery failed, will retry: {}",
                            message
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        if report.sent + report.failed + report.abandoned > 0 {
            info!(
                "Outbox pass: {} sent, {} failed, {} abandoned",
                report.sent, report.failed, report.abandoned
            );
        }
        Ok(report)
    }

    /// Drain the outbox on a fixed interval, or sooner when woken, until the task is dropped.
    pub async fn run(self: Arc<Self>, interval: Duration, batch_size: usize) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => debug!("Outbox worker woken"),
            }
            if let Err(e) = self.dispatch_pending(batch_size).await {
                error!("Outbox dispatch failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::RecordingMailer;
    use crate::storage::InMemoryStorage;

    fn notification(to: &str) -> Notification {
        Notification::new(
            None,
            NotificationKind::Test,
            to,
            "Subject".to_string(),
            "<p>Body</p>".to_string(),
        )
    }

    #[test]
    fn test_templates_escape_interpolations() {
        let (subject, html) = buyer_purchase_email(
            Uuid::new_v4(),
            "<script>alert(1)</script>",
            1999,
            "RUB",
            "https://cifra.example/download/abc?file=0&x=1",
            Utc::now(),
        )
        .unwrap();
        assert!(subject.contains("<script>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("file=0&amp;x=1"));
        assert!(html.contains("class=\"container buyer\""));

        let (_, html) =
            seller_sale_email(Uuid::new_v4(), "Pack", "o'neil@example.com", 1999, 1869, "RUB").unwrap();
        assert!(!html.contains("o'neil"));
        assert!(html.contains("neil@example.com"));
        assert!(html.contains("1869 RUB"));
        assert!(html.contains("class=\"container seller\""));
    }

    #[test]
    fn test_every_kind_renders() {
        for kind in [NotificationKind::BuyerPurchase, NotificationKind::SellerSale, NotificationKind::Test] {
            let (subject, html) = test_email(kind, "https://cifra.test/").unwrap();
            assert!(!subject.is_empty());
            assert!(html.starts_with("<!DOCTYPE html>"));
            assert!(html.contains("The Cifra team"));
        }
        let (_, html) = test_email(NotificationKind::BuyerPurchase, "https://cifra.test/").unwrap();
        assert!(html.contains("test-token"));
    }

    #[tokio::test]
    async fn test_dispatch_marks_sent() {
        let storage = Arc::new(InMemoryStorage::new());
        let mailer = Arc::new(RecordingMailer::new());
        let dispatcher = NotificationDispatcher::new(storage.clone(), mailer.clone(), 3);

        dispatcher.enqueue(&notification("a@example.com")).await.unwrap();
        dispatcher.enqueue(&notification("b@example.com")).await.unwrap();

        let report = dispatcher.dispatch_pending(10).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(mailer.sent().unwrap().len(), 2);
        assert!(storage.pending_notifications(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_retry_then_abandon() {
        let storage = Arc::new(InMemoryStorage::new());
        let mailer = Arc::new(RecordingMailer::new());
        mailer.fail_for("down@example.com").unwrap();
        let dispatcher = NotificationDispatcher::new(storage.clone(), mailer.clone(), 2);
        dispatcher.enqueue(&notification("down@example.com")).await.unwrap();

        let first = dispatcher.dispatch_pending(10).await.unwrap();
        assert_eq!(first.failed, 1);
        let pending = storage.pending_notifications(10).await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        let second = dispatcher.dispatch_pending(10).await.unwrap();
        assert_eq!(second.abandoned, 1);
        assert!(storage.pending_notifications(10).await.unwrap().is_empty());
        assert!(mailer.sent().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovered_mailbox_gets_retry() {
        let storage = Arc::new(InMemoryStorage::new());
        let mailer = Arc::new(RecordingMailer::new());
        mailer.fail_for("flaky@example.com").unwrap();
        let dispatcher = NotificationDispatcher::new(storage.clone(), mailer.clone(), 5);
        dispatcher.enqueue(&notification("flaky@example.com")).await.unwrap();

        dispatcher.dispatch_pending(10).await.unwrap();
        mailer.recover("flaky@example.com").unwrap();
        let report = dispatcher.dispatch_pending(10).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(mailer.sent().unwrap()[0].to, "flaky@example.com");
    }
}
