use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::catalog_use_case::{NewProduct, ProductPatch, PromoPatch, SellerSettings};
use crate::app::fulfillment_use_case::download_url;
use crate::app::notification_use_case::test_email;
use crate::app::ports::{MailerPort, ObjectStorePort, PaymentGatewayPort};
use crate::app::{
    CatalogService, CheckoutService, DownloadError, DownloadGateway, FulfillmentEngine, FulfillmentError,
    FulfillmentOutcome, FulfillmentSettings, NotificationDispatcher, WebhookEvent,
};
use crate::config::Config;
use crate::domain::{Notification, NotificationKind};
use crate::error::{CifraError, Result};
use crate::storage::Storage;

/// Largest product file accepted by the upload route.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const FILE_NAME_HEADER: &str = "x-file-name";

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub fulfillment: Arc<FulfillmentEngine>,
    pub checkout: Arc<CheckoutService>,
    pub downloads: Arc<DownloadGateway>,
    pub catalog: Arc<CatalogService>,
    pub notifications: Arc<NotificationDispatcher>,
    pub site_url: String,
    pub admin_token: Option<String>,
    pub dev_routes: bool,
    pub outbox_batch_size: usize,
}

impl AppState {
    /// Wire the use cases around the given adapters.
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        payments: Arc<dyn PaymentGatewayPort>,
        objects: Arc<dyn ObjectStorePort>,
        mailer: Arc<dyn MailerPort>,
    ) -> Self {
        let site_url = config.server.site_url.trim_end_matches('/').to_string();
        let notifications = Arc::new(NotificationDispatcher::new(
            storage.clone(),
            mailer,
            config.outbox.max_attempts,
        ));
        let settings = FulfillmentSettings {
            fees: config.fees,
            token_ttl_days: config.downloads.token_ttl_days,
            site_url: site_url.clone(),
        };
        let fulfillment = Arc::new(
            FulfillmentEngine::new(storage.clone(), payments.clone(), settings)
                .with_dispatcher(notifications.clone()),
        );
        let checkout = Arc::new(CheckoutService::new(
            storage.clone(),
            payments,
            &site_url,
            &config.payments.currency,
        ));
        let downloads = Arc::new(DownloadGateway::new(
            storage.clone(),
            objects.clone(),
            config.object_storage.signed_url_ttl_seconds,
            &config.object_storage.legacy_files_base_url,
        ));
        let catalog = Arc::new(CatalogService::new(storage.clone(), objects));

        Self {
            storage,
            fulfillment,
            checkout,
            downloads,
            catalog,
            notifications,
            site_url,
            admin_token: config.server.admin_token.clone(),
            dev_routes: config.server.dev_routes,
            outbox_batch_size: config.outbox.batch_size,
        }
    }
}

/// JSON error body `{ "error": ... }` with a status derived from the crate error.
pub struct ApiError(CifraError);

impl From<CifraError> for ApiError {
    fn from(err: CifraError) -> Self {
        ApiError(err)
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            CifraError::Validation(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            err @ CifraError::NotFound { .. } => error_body(StatusCode::NOT_FOUND, err.to_string()),
            CifraError::Conflict(msg) => error_body(StatusCode::CONFLICT, msg),
            err @ (CifraError::Gateway { .. } | CifraError::ObjectStore { .. }) => {
                error!("Upstream failure: {}", err);
                error_body(StatusCode::BAD_GATEWAY, "upstream service unavailable")
            }
            err => {
                error!("Request failed: {}", err);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        match self {
            DownloadError::TokenNotFound => error_body(StatusCode::NOT_FOUND, "Download link not found"),
            DownloadError::TokenExpired => error_body(StatusCode::GONE, "Download link has expired"),
            DownloadError::FileNotFound => error_body(StatusCode::NOT_FOUND, "File not found"),
            DownloadError::Internal(e) => {
                error!("Download failed: {}", e);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Download failed")
            }
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// Operational

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "cifra",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}

// Payment notifications

async fn webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let event = match WebhookEvent::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            // Acknowledged so the gateway stops redelivering a body that will never parse.
            warn!("Ignoring malformed payment notification: {}", e);
            return Json(json!({ "received": true })).into_response();
        }
    };

    match state.fulfillment.handle_event(&event).await {
        Ok(outcome) => {
            info!(event = event.name(), "Payment notification handled: {}", outcome_label(&outcome));
            Json(json!({ "received": true })).into_response()
        }
        Err(FulfillmentError::Verification(msg)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "received": false, "error": msg })),
        )
            .into_response(),
        Err(FulfillmentError::Ledger(e)) => {
            // Acknowledged anyway; `cifra reconcile` settles the order later.
            error!(event = event.name(), "Ledger update failed after verification: {}", e);
            Json(json!({ "received": true })).into_response()
        }
    }
}

fn outcome_label(outcome: &FulfillmentOutcome) -> &'static str {
    match outcome {
        FulfillmentOutcome::Fulfilled { .. } => "fulfilled",
        FulfillmentOutcome::AlreadyHandled { .. } => "already_handled",
        FulfillmentOutcome::Canceled { .. } => "canceled",
        FulfillmentOutcome::Failed { .. } => "failed",
        FulfillmentOutcome::OrderNotFound { .. } => "order_not_found",
        FulfillmentOutcome::Ignored { .. } => "ignored",
    }
}

// Downloads

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    file: Option<usize>,
}

async fn download_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> std::result::Result<Redirect, DownloadError> {
    let location = state.downloads.resolve(&token, query.file.unwrap_or(0)).await?;
    Ok(Redirect::temporary(&location.url))
}

async fn download_info(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> std::result::Result<Response, DownloadError> {
    let info = state.downloads.describe(&token).await?;
    Ok(Json(info).into_response())
}

// Checkout

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentBody {
    product_id: Uuid,
    customer_email: String,
    promo_code: Option<String>,
}

async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentBody>,
) -> ApiResult<Response> {
    let session = state
        .checkout
        .create_order(body.product_id, &body.customer_email, body.promo_code.as_deref())
        .await?;
    Ok(Json(session).into_response())
}

// Seller API

/// Compare digests in constant time so neither content nor length leaks through timing.
fn token_matches(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return error_body(StatusCode::FORBIDDEN, "seller API is disabled");
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token_matches(token, expected));
    if !authorized {
        return error_body(StatusCode::UNAUTHORIZED, "missing or invalid admin token");
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSellerBody {
    email: String,
    display_name: String,
}

async fn create_seller(State(state): State<AppState>, Json(body): Json<NewSellerBody>) -> ApiResult<Response> {
    let seller = state.catalog.create_seller(&body.email, &body.display_name).await?;
    Ok((StatusCode::CREATED, Json(seller)).into_response())
}

async fn get_seller(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.get_seller(seller_id).await?).into_response())
}

async fn update_seller_settings(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(settings): Json<SellerSettings>,
) -> ApiResult<Response> {
    Ok(Json(state.catalog.update_seller_settings(seller_id, settings).await?).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProductsQuery {
    include_drafts: Option<bool>,
}

async fn list_products(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Query(query): Query<ListProductsQuery>,
) -> ApiResult<Response> {
    let products = state
        .catalog
        .list_products(seller_id, query.include_drafts.unwrap_or(true))
        .await?;
    Ok(Json(products).into_response())
}

async fn create_product(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(input): Json<NewProduct>,
) -> ApiResult<Response> {
    let product = state.catalog.create_product(seller_id, input).await?;
    Ok((StatusCode::CREATED, Json(product)).into_response())
}

async fn get_product(
    State(state): State<AppState>,
    Path((seller_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    Ok(Json(state.catalog.get_product(seller_id, product_id).await?).into_response())
}

async fn update_product(
    State(state): State<AppState>,
    Path((seller_id, product_id)): Path<(Uuid, Uuid)>,
    Json(patch): Json<ProductPatch>,
) -> ApiResult<Response> {
    Ok(Json(state.catalog.update_product(seller_id, product_id, patch).await?).into_response())
}

async fn delete_product(
    State(state): State<AppState>,
    Path((seller_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_product(seller_id, product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn publish_product(
    State(state): State<AppState>,
    Path((seller_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Response> {
    Ok(Json(state.catalog.publish_product(seller_id, product_id).await?).into_response())
}

async fn upload_product_file(
    State(state): State<AppState>,
    Path((seller_id, product_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let file_name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CifraError::Validation(format!("{FILE_NAME_HEADER} header is required")))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let product = state
        .catalog
        .upload_file(seller_id, product_id, file_name, content_type, body.to_vec())
        .await?;
    Ok((StatusCode::CREATED, Json(product)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewPromoBody {
    code: String,
    discount_percent: i64,
}

async fn list_promos(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.list_promos(seller_id).await?).into_response())
}

async fn create_promo(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(body): Json<NewPromoBody>,
) -> ApiResult<Response> {
    let promo = state
        .catalog
        .create_promo(seller_id, &body.code, body.discount_percent)
        .await?;
    Ok((StatusCode::CREATED, Json(promo)).into_response())
}

async fn update_promo(
    State(state): State<AppState>,
    Path((seller_id, promo_id)): Path<(Uuid, Uuid)>,
    Json(patch): Json<PromoPatch>,
) -> ApiResult<Response> {
    Ok(Json(state.catalog.update_promo(seller_id, promo_id, patch).await?).into_response())
}

async fn delete_promo(
    State(state): State<AppState>,
    Path((seller_id, promo_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.catalog.delete_promo(seller_id, promo_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sales(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.list_sales(seller_id).await?).into_response())
}

async fn sales_summary(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.sales_summary(seller_id).await?).into_response())
}

async fn customers(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.customers(seller_id).await?).into_response())
}

async fn list_payouts(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    Ok(Json(state.catalog.list_payouts(seller_id).await?).into_response())
}

async fn payout_balance(State(state): State<AppState>, Path(seller_id): Path<Uuid>) -> ApiResult<Response> {
    let balance = state.catalog.available_balance(seller_id).await?;
    Ok(Json(json!({ "balance": balance })).into_response())
}

#[derive(Debug, Deserialize)]
struct PayoutBody {
    amount: i64,
    method: String,
}

async fn request_payout(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
    Json(body): Json<PayoutBody>,
) -> ApiResult<Response> {
    let payout = state
        .catalog
        .request_payout(seller_id, body.amount, &body.method)
        .await?;
    Ok((StatusCode::CREATED, Json(payout)).into_response())
}

// Development routes

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestWebhookBody {
    order_id: Uuid,
}

async fn test_webhook(State(state): State<AppState>, Json(body): Json<TestWebhookBody>) -> ApiResult<Response> {
    match state.fulfillment.fulfill_without_verification(body.order_id).await {
        Ok(FulfillmentOutcome::Fulfilled {
            order_id,
            sale_id,
            token,
            platform_fee,
            net_amount,
        }) => Ok(Json(json!({
            "success": true,
            "orderId": order_id,
            "saleId": sale_id,
            "downloadUrl": download_url(&state.site_url, &token),
            "token": token,
            "platformFee": platform_fee,
            "netAmount": net_amount,
        }))
        .into_response()),
        Ok(FulfillmentOutcome::AlreadyHandled { order_id, status }) => Err(CifraError::Conflict(format!(
            "order {order_id} is already {status}"
        ))
        .into()),
        Ok(other) => Ok(Json(json!({ "success": false, "outcome": outcome_label(&other) })).into_response()),
        Err(FulfillmentError::Ledger(e)) => Err(e.into()),
        Err(FulfillmentError::Verification(msg)) => {
            Ok(error_body(StatusCode::INTERNAL_SERVER_ERROR, msg))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestEmailBody {
    email: String,
    kind: Option<NotificationKind>,
}

async fn send_test_email(State(state): State<AppState>, Json(body): Json<TestEmailBody>) -> ApiResult<Response> {
    crate::validation::validate_email(body.email.trim())?;
    let kind = body.kind.unwrap_or(NotificationKind::Test);
    let (subject, html) = test_email(kind, &state.site_url)?;
    let notification = Notification::new(None, kind, body.email.trim(), subject, html);
    state.notifications.enqueue(&notification).await?;
    let report = state.notifications.dispatch_pending(state.outbox_batch_size).await?;
    Ok(Json(json!({
        "success": report.sent > 0,
        "notificationId": notification.id,
        "sent": report.sent,
        "failed": report.failed,
        "abandoned": report.abandoned,
    }))
    .into_response())
}

fn seller_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/", post(create_seller))
        .route("/:seller_id", get(get_seller))
        .route("/:seller_id/settings", patch(update_seller_settings))
        .route("/:seller_id/products", get(list_products).post(create_product))
        .route(
            "/:seller_id/products/:product_id",
            get(get_product).patch(update_product).delete(delete_product),
        )
        .route("/:seller_id/products/:product_id/publish", post(publish_product))
        .route(
            "/:seller_id/products/:product_id/files",
            post(upload_product_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/:seller_id/promos", get(list_promos).post(create_promo))
        .route(
            "/:seller_id/promos/:promo_id",
            patch(update_promo).delete(delete_promo),
        )
        .route("/:seller_id/sales", get(list_sales))
        .route("/:seller_id/sales/summary", get(sales_summary))
        .route("/:seller_id/customers", get(customers))
        .route("/:seller_id/payouts", get(list_payouts).post(request_payout))
        .route("/:seller_id/payouts/balance", get(payout_balance))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
}

/// Build the router with all routes.
pub fn create_server(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook))
        .route("/api/yookassa/webhook", post(webhook))
        .route("/download/:token", get(download_file))
        .route("/api/download/:token", get(download_info))
        .route("/api/download/:token/file", get(download_file))
        .route("/api/payment/create", post(create_payment))
        .nest("/api/sellers", seller_routes(&state));

    if state.dev_routes {
        warn!("Development routes enabled: /api/test-webhook fulfills orders without payment");
        router = router
            .route("/api/test-webhook", post(test_webhook))
            .route("/api/test-email", post(send_test_email));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Serve the API on `port` until the process is stopped.
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    println!("🚀 Cifra API running on http://localhost:{port}");
    println!("💚 Health check: http://localhost:{port}/health");
    println!("📈 Metrics:      http://localhost:{port}/metrics");
    println!("💳 Webhook:      POST http://localhost:{port}/webhook");

    axum::serve(listener, app).await?;
    Ok(())
}
