use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::tempdir;
use tower::ServiceExt;
use uuid::Uuid;

use cifra::app::ports::GatewayPaymentStatus;
use cifra::app::NotificationDispatcher;
use cifra::config::Config;
use cifra::domain::*;
use cifra::infra::memory::{InMemoryObjectStore, InMemoryPaymentGateway, RecordingMailer};
use cifra::server::{create_server, AppState};
use cifra::storage::{Fulfillment, InMemoryStorage, SqliteStorage, Storage};

const ADMIN_TOKEN: &str = "test-admin-token";

struct Harness {
    router: Router,
    storage: Arc<dyn Storage>,
    gateway: Arc<InMemoryPaymentGateway>,
    mailer: Arc<RecordingMailer>,
    objects: Arc<InMemoryObjectStore>,
    notifications: Arc<NotificationDispatcher>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.admin_token = Some(ADMIN_TOKEN.to_string());
    config.server.dev_routes = true;
    config.server.site_url = "https://cifra.test".to_string();
    config
}

fn harness_with(config: Config, storage: Arc<dyn Storage>) -> Harness {
    let gateway = Arc::new(InMemoryPaymentGateway::new());
    let mailer = Arc::new(RecordingMailer::new());
    let objects = Arc::new(InMemoryObjectStore::new());
    let state = AppState::new(
        &config,
        storage.clone(),
        gateway.clone(),
        objects.clone(),
        mailer.clone(),
    );
    let notifications = state.notifications.clone();
    Harness {
        router: create_server(state),
        storage,
        gateway,
        mailer,
        objects,
        notifications,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), Arc::new(InMemoryStorage::new()))
}

impl Harness {
    /// Stand-in for the outbox worker, which these tests do not spawn.
    async fn drain(&self) {
        self.notifications.dispatch_pending(50).await.unwrap();
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, bytes.to_vec())
    }

    async fn json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, bytes) = self.send(request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.json(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"));
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.json(request).await
    }

    /// Seller with one published single-file product priced at 1999.
    async fn published_product(&self) -> (Uuid, Uuid) {
        let (status, seller) = self
            .admin(
                "POST",
                "/api/sellers",
                Some(json!({ "email": "seller@example.com", "displayName": "Anna" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let seller_id: Uuid = seller["id"].as_str().unwrap().parse().unwrap();

        let (status, product) = self
            .admin(
                "POST",
                &format!("/api/sellers/{seller_id}/products"),
                Some(json!({
                    "title": "Notion planner",
                    "description": "A yearly planner template with habit tracking",
                    "price": 1999,
                    "category": "templates"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let product_id: Uuid = product["id"].as_str().unwrap().parse().unwrap();

        let (status, _, _) = self
            .send(
                Request::post(format!("/api/sellers/{seller_id}/products/{product_id}/files"))
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .header(header::CONTENT_TYPE, "application/pdf")
                    .header("x-file-name", "planner.pdf")
                    .body(Body::from(vec![1u8, 2, 3, 4]))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, product) = self
            .admin(
                "POST",
                &format!("/api/sellers/{seller_id}/products/{product_id}/publish"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(product["status"], "published");
        (seller_id, product_id)
    }

    async fn checkout(&self, product_id: Uuid) -> (Uuid, String) {
        let (status, session) = self
            .post(
                "/api/payment/create",
                json!({ "productId": product_id, "customerEmail": "buyer@example.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{session}");
        assert_eq!(session["amount"], 1999);
        let order_id = session["orderId"].as_str().unwrap().parse().unwrap();
        let payment_id = session["paymentId"].as_str().unwrap().to_string();
        (order_id, payment_id)
    }
}

fn succeeded(payment_id: &str) -> Value {
    json!({ "type": "notification", "event": "payment.succeeded", "object": { "id": payment_id } })
}

#[tokio::test]
async fn test_health_and_metrics() {
    let h = harness();
    let (status, body) = h.json(Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, headers, _) = h.send(Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_checkout_webhook_and_download() {
    let h = harness();
    let (seller_id, product_id) = h.published_product().await;
    let (order_id, payment_id) = h.checkout(product_id).await;

    h.gateway.set_status(&payment_id, GatewayPaymentStatus::Succeeded).unwrap();
    let (status, body) = h.post("/webhook", succeeded(&payment_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    let order = h.storage.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    let sale = h.storage.get_sale_by_order(order_id).await.unwrap().unwrap();
    assert_eq!((sale.amount, sale.platform_fee, sale.net_amount), (1999, 130, 1869));
    let product = h.storage.get_product(product_id).await.unwrap().unwrap();
    assert_eq!((product.sales, product.revenue), (1, 1869));

    let token = h.storage.get_download_token_by_order(order_id).await.unwrap().unwrap();
    h.drain().await;
    let emails = h.mailer.sent().unwrap();
    assert_eq!(emails.len(), 2);
    let buyer_email = emails.iter().find(|e| e.to == "buyer@example.com").unwrap();
    assert!(buyer_email.html.contains("cifra.test"));
    assert!(buyer_email.html.contains(&token.token));

    // Redelivery: acknowledged, nothing repeated.
    let (status, body) = h.post("/api/yookassa/webhook", succeeded(&payment_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(h.storage.list_sales(seller_id).await.unwrap().len(), 1);
    let product = h.storage.get_product(product_id).await.unwrap().unwrap();
    assert_eq!(product.revenue, 1869);
    h.drain().await;
    assert_eq!(h.mailer.sent().unwrap().len(), 2);

    let (status, info) = h
        .json(
            Request::get(format!("/api/download/{}", token.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["productTitle"], "Notion planner");
    assert_eq!(info["files"], json!(["planner.pdf"]));

    let (status, headers, _) = h
        .send(
            Request::get(format!("/download/{}", token.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    let location = headers[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("memory://objects/products/"));
    assert!(location.contains("expires_in=3600"));

    let token = h.storage.get_download_token(&token.token).await.unwrap().unwrap();
    assert_eq!(token.download_count, 1);
    assert!(token.used);

    let key = location
        .trim_start_matches("memory://objects/")
        .split('?')
        .next()
        .unwrap();
    assert_eq!(h.objects.get(key).unwrap().unwrap().bytes, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_webhook_edge_cases() {
    let h = harness();

    let (status, body) = h
        .json(
            Request::post("/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    // Acknowledged so the gateway does not keep redelivering it.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    let (status, body) = h.post("/webhook", json!({ "event": "payment.succeeded" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(h.gateway.lookups(), 0);

    // Known to the gateway, unknown to the ledger.
    h.gateway
        .put("pay_elsewhere", GatewayPaymentStatus::Succeeded, 500, "RUB")
        .unwrap();
    let (status, body) = h.post("/webhook", succeeded("pay_elsewhere")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);

    // The gateway cannot confirm the claim.
    let (status, body) = h.post("/webhook", succeeded("pay_forged")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["received"], false);

    let (status, body) = h
        .post("/webhook", json!({ "event": "refund.succeeded", "object": { "id": "r1" } }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
}

#[tokio::test]
async fn test_product_with_checkout_cannot_be_deleted() {
    let h = harness();
    let (seller_id, product_id) = h.published_product().await;
    let (order_id, payment_id) = h.checkout(product_id).await;

    let uri = format!("/api/sellers/{seller_id}/products/{product_id}");
    let (status, body) = h.admin("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("unpublish"));

    // The buyer's payment still settles against the product.
    h.gateway.set_status(&payment_id, GatewayPaymentStatus::Succeeded).unwrap();
    let (status, _) = h.post("/webhook", succeeded(&payment_id)).await;
    assert_eq!(status, StatusCode::OK);
    let order = h.storage.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_pending_payment_claimed_as_succeeded_is_rejected() {
    let h = harness();
    let (_, product_id) = h.published_product().await;
    let (order_id, payment_id) = h.checkout(product_id).await;

    let (status, _) = h.post("/webhook", succeeded(&payment_id)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let order = h.storage.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(h.storage.get_sale_by_order(order_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_download_errors() {
    let h = harness();
    let (status, body) = h
        .json(Request::get("/download/does-not-exist").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (seller_id, product_id) = h.published_product().await;
    let now = Utc::now();
    let issued = now - Duration::days(31);
    let order = Order {
        id: Uuid::new_v4(),
        product_id,
        seller_id,
        buyer_email: "old@example.com".to_string(),
        amount: 1999,
        currency: "RUB".to_string(),
        status: OrderStatus::Pending,
        external_payment_id: "pay_old".to_string(),
        promo_id: None,
        provider_metadata: json!({}),
        created_at: issued,
        paid_at: None,
    };
    h.storage.create_order(&order).await.unwrap();
    let expired = DownloadToken::issue("a".repeat(64), &order, issued, 30);
    h.storage
        .commit_fulfillment(&Fulfillment {
            order_id: order.id,
            paid_at: issued,
            provider_metadata: json!({}),
            sale: Sale {
                id: Uuid::new_v4(),
                order_id: order.id,
                product_id,
                seller_id,
                buyer_email: order.buyer_email.clone(),
                amount: 1999,
                platform_fee: 130,
                net_amount: 1869,
                created_at: issued,
            },
            token: expired.clone(),
            promo_id: None,
            notifications: Vec::new(),
        })
        .await
        .unwrap();

    let (status, body) = h
        .json(
            Request::get(format!("/download/{}", expired.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert!(body["error"].is_string());
    let stored = h.storage.get_download_token(&expired.token).await.unwrap().unwrap();
    assert_eq!(stored.download_count, 0);

    let (status, _) = h
        .json(
            Request::get(format!("/api/download/{}/file?file=3", expired.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_seller_api_requires_admin_token() {
    let h = harness();
    let (status, _) = h
        .json(Request::get(format!("/api/sellers/{}", Uuid::new_v4())).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h
        .json(
            Request::get(format!("/api/sellers/{}", Uuid::new_v4()))
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Same length as the real token, one character off.
    let near_miss = format!("{}X", &ADMIN_TOKEN[..ADMIN_TOKEN.len() - 1]);
    let (status, _) = h
        .json(
            Request::get(format!("/api/sellers/{}", Uuid::new_v4()))
                .header(header::AUTHORIZATION, format!("Bearer {near_miss}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = h
        .admin("GET", &format!("/api/sellers/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let mut config = test_config();
    config.server.admin_token = None;
    let closed = harness_with(config, Arc::new(InMemoryStorage::new()));
    let (status, _) = closed
        .admin("POST", "/api/sellers", Some(json!({ "email": "a@b.co", "displayName": "A" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_promo_checkout_and_dashboard() {
    let h = harness();
    let (seller_id, product_id) = h.published_product().await;

    let (status, promo) = h
        .admin(
            "POST",
            &format!("/api/sellers/{seller_id}/promos"),
            Some(json!({ "code": "spring20", "discountPercent": 20 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(promo["code"], "SPRING20");

    let (status, body) = h
        .post(
            "/api/payment/create",
            json!({ "productId": product_id, "customerEmail": "buyer@example.com", "promoCode": "nope" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, session) = h
        .post(
            "/api/payment/create",
            json!({ "productId": product_id, "customerEmail": "buyer@example.com", "promoCode": "Spring20" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    // 1999 - round(399.8) = 1599
    assert_eq!(session["amount"], 1599);
    let payment_id = session["paymentId"].as_str().unwrap();
    h.gateway.set_status(payment_id, GatewayPaymentStatus::Succeeded).unwrap();
    let (status, _) = h.post("/webhook", succeeded(payment_id)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, promos) = h.admin("GET", &format!("/api/sellers/{seller_id}/promos"), None).await;
    assert_eq!(promos[0]["uses"], 1);

    let (status, summary) = h
        .admin("GET", &format!("/api/sellers/{seller_id}/sales/summary"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["gross"], 1599);
    // 80 + 30
    assert_eq!(summary["fees"], 110);
    assert_eq!(summary["net"], 1489);

    let (_, customers) = h
        .admin("GET", &format!("/api/sellers/{seller_id}/customers"), None)
        .await;
    assert_eq!(customers[0]["email"], "buyer@example.com");

    let (_, balance) = h
        .admin("GET", &format!("/api/sellers/{seller_id}/payouts/balance"), None)
        .await;
    assert_eq!(balance["balance"], 1489);

    let (status, _) = h
        .admin(
            "POST",
            &format!("/api/sellers/{seller_id}/payouts"),
            Some(json!({ "amount": 5000, "method": "card" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, payout) = h
        .admin(
            "POST",
            &format!("/api/sellers/{seller_id}/payouts"),
            Some(json!({ "amount": 1000, "method": "card" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(payout["status"], "pending");
    let (_, balance) = h
        .admin("GET", &format!("/api/sellers/{seller_id}/payouts/balance"), None)
        .await;
    assert_eq!(balance["balance"], 489);
}

#[tokio::test]
async fn test_dev_fulfillment_on_sqlite() {
    let dir = tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(dir.path().join("ledger/cifra.db")).unwrap());
    let h = harness_with(test_config(), storage);
    let (_, product_id) = h.published_product().await;
    let (order_id, _) = h.checkout(product_id).await;

    let (status, body) = h.post("/api/test-webhook", json!({ "orderId": order_id })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["platformFee"], 130);
    let token = body["token"].as_str().unwrap();
    assert_eq!(
        body["downloadUrl"],
        format!("https://cifra.test/download/{token}")
    );

    let (status, _) = h.post("/api/test-webhook", json!({ "orderId": order_id })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = h
        .send(Request::get(format!("/download/{token}")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    let order = h.storage.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_dev_routes_are_off_by_default() {
    let mut config = test_config();
    config.server.dev_routes = false;
    let h = harness_with(config, Arc::new(InMemoryStorage::new()));
    let (status, _, _) = h
        .send(
            Request::post("/api/test-webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "orderId": Uuid::new_v4() }).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_test_email_route() {
    let h = harness();
    let (status, body) = h
        .post("/api/test-email", json!({ "email": "me@example.com", "kind": "buyer_purchase" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let sent = h.mailer.sent().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "me@example.com");
    assert!(sent[0].subject.contains("Test product"));
}
