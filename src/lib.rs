pub mod accounts;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod ingestion;
pub mod phone;
pub mod query;
pub mod servers;
pub mod session_layer;
pub mod types;
pub mod worker;
pub mod ws;

pub use config::Config;

use self::config::{load_config, resolve_database_url};
use self::db::{AccountRecord, DbKind};
use self::devices::{CheckNumberRequest, QrResponse, StatusUpdate};
use self::error::{ok, ApiError, ApiJson, ApiQuery, ApiResult};
use self::ingestion::{BulkRequest, SendRequest};
use self::query::MessageQuery;
use self::session_layer::{SessionLayer, SidecarClient, TOKEN_HEADER};
use self::types::{QrFormat, ServerStatus};
use self::worker::{DeliveryContext, DeliveryPool};

use axum::{
    extract::{Path, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Literal paths mounted by `router`; the session webhook must not reuse one.
pub const API_ROUTES: &[&str] = &[
    "/v1/messages/send",
    "/v1/messages/bulk",
    "/v1/messages/history",
    "/v1/messages/queue",
    "/v1/subscription",
    "/v1/devices",
    "/v1/devices/add",
    "/v1/servers",
    "/v1/admin/accounts",
    "/v1/admin/servers",
    "/v1/health",
    "/v1/status",
    "/v1/ws",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub sessions: Arc<dyn SessionLayer>,
    pub ws_tx: broadcast::Sender<ws::WsEvent>,
    pub delivery: DeliveryPool,
}

impl AppState {
    pub fn new(config: Config, pool: AnyPool, db_kind: DbKind, sessions: Arc<dyn SessionLayer>) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        let delivery = DeliveryPool::new(DeliveryContext {
            pool: pool.clone(),
            db_kind,
            sessions: Arc::clone(&sessions),
            ws_tx: ws_tx.clone(),
            queue: config.queue.clone(),
        });
        Self {
            config,
            pool,
            db_kind,
            sessions,
            ws_tx,
            delivery,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub devices: i64,
    pub messages: i64,
    pub queued_messages: i64,
    pub delivery_workers: usize,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct QrQuery {
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsAuth {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerStatusRequest {
    pub status: ServerStatus,
}

/// Connects storage, creates the schema and applies configured seeds.
pub async fn init_state(config: Config, sessions: Arc<dyn SessionLayer>) -> anyhow::Result<AppState> {
    config::check_webhook_path(&config.sidecar.webhook_path, API_ROUTES)?;
    sqlx::any::install_default_drivers();

    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let state = AppState::new(config, pool, db_kind, sessions);
    servers::seed_servers(&state).await?;
    accounts::seed_accounts(&state).await?;
    Ok(state)
}

pub fn spawn_background(state: &AppState) {
    tokio::spawn(worker::start_dispatcher(state.delivery.clone()));
    tokio::spawn(servers::start_server_monitor(state.clone()));
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config();
    let sessions = SidecarClient::new(
        config.sidecar.api_token.clone(),
        Duration::from_secs(config.sidecar.request_timeout_seconds),
    )?;
    let state = init_state(config, Arc::new(sessions)).await?;
    spawn_background(&state);
    info!(db = ?state.db_kind, "gateway state ready");
    let app = router(state.clone());
    Ok((state, app))
}

pub fn router(state: AppState) -> Router {
    let customer_routes = Router::new()
        .route("/v1/messages/send", post(send_message))
        .route("/v1/messages/bulk", post(send_bulk))
        .route("/v1/messages/history", get(message_history))
        .route("/v1/messages/queue", get(message_queue))
        .route("/v1/messages/:id", get(get_message))
        .route("/v1/messages/:id/cancel", post(cancel_message))
        .route("/v1/batches/:id", get(get_batch))
        .route("/v1/subscription", get(subscription))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/add", post(add_device))
        .route("/v1/devices/:id", get(get_device).delete(delete_device))
        .route("/v1/devices/:id/qr", get(device_qr))
        .route("/v1/devices/:id/relink", post(relink_device))
        .route("/v1/accounts/:id/check-whatsapp", post(check_whatsapp))
        .route("/v1/servers", get(list_servers))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let admin_routes = Router::new()
        .route("/v1/admin/accounts", get(admin_list_accounts).post(admin_create_account))
        .route("/v1/admin/accounts/:id", get(admin_get_account).patch(admin_update_account))
        .route("/v1/admin/servers", get(list_servers).post(admin_register_server))
        .route("/v1/admin/servers/:id", axum::routing::patch(admin_server_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/ws", get(ws_handler))
        .route(&state.config.sidecar.webhook_path, post(session_events));

    Router::new()
        .merge(customer_routes)
        .merge(admin_routes)
        .merge(public_routes)
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn account_for_key(state: &AppState, key: Option<&str>) -> ApiResult<AccountRecord> {
    let key = key.ok_or(ApiError::Unauthorized)?;
    db::get_account_by_key(&state.pool, state.db_kind, key)
        .await?
        .ok_or(ApiError::Unauthorized)
}

async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let account = account_for_key(&state, bearer_token(req.headers())).await?;
    req.extensions_mut().insert(account);
    Ok(next.run(req).await)
}

async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.auth.admin_token.as_deref() else {
        return Err(ApiError::Forbidden("admin access is not configured".to_string()));
    };
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}

async fn health() -> impl IntoResponse {
    ok(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let devices = db::count_all(&state.pool, state.db_kind, db::Table::Devices).await?;
    let messages = db::count_all(&state.pool, state.db_kind, db::Table::Messages).await?;
    let queued_messages = db::count_all(&state.pool, state.db_kind, db::Table::QueuedMessages).await?;
    Ok(ok(StatusResponse {
        devices,
        messages,
        queued_messages,
        delivery_workers: state.delivery.active_workers(),
    }))
}

async fn ws_handler(
    State(state): State<AppState>,
    ApiQuery(auth): ApiQuery<WsAuth>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let key = auth.token.as_deref().or_else(|| bearer_token(&headers));
    let account = account_for_key(&state, key).await?;
    let rx = state.ws_tx.subscribe();
    Ok(ws.on_upgrade(move |socket| ws::handle_ws(socket, rx, account.id)))
}

async fn session_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(update): ApiJson<StatusUpdate>,
) -> ApiResult<impl IntoResponse> {
    if let Some(expected) = state.config.sidecar.webhook_token.as_deref() {
        let provided = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return Err(ApiError::Unauthorized);
        }
    }
    let device = devices::apply_status(&state, update).await?;
    Ok(ok(device))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    ApiJson(req): ApiJson<SendRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(ingestion::send(&state, &account, req).await?))
}

async fn send_bulk(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    ApiJson(req): ApiJson<BulkRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(ingestion::send_bulk(&state, &account, req).await?))
}

async fn message_history(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    ApiQuery(q): ApiQuery<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(query::history(&state, &account, &q).await?))
}

async fn message_queue(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    ApiQuery(q): ApiQuery<MessageQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(query::queue(&state, &account, &q).await?))
}

async fn get_message(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(query::message(&state, &account, &id).await?))
}

async fn cancel_message(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(ingestion::cancel(&state, &account, &id).await?))
}

async fn get_batch(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(query::batch(&state, &account, &id).await?))
}

async fn subscription(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(accounts::subscription(&state, &account).await?))
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(devices::list(&state, &account).await?))
}

async fn add_device(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    ApiJson(req): ApiJson<devices::AddDeviceRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = devices::add(&state, &account, req).await?;
    Ok((StatusCode::CREATED, ok(created)))
}

async fn get_device(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(devices::owned_device(&state, &account, &id).await?))
}

async fn delete_device(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(devices::delete(&state, &account, &id).await?))
}

async fn device_qr(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
    ApiQuery(q): ApiQuery<QrQuery>,
) -> ApiResult<Response> {
    let format = match q.format.as_deref() {
        None => QrFormat::default(),
        Some(raw) => raw
            .parse::<QrFormat>()
            .map_err(|err| ApiError::validation(err.to_string()))?,
    };
    let response = match devices::qr(&state, &account, &id, format).await? {
        QrResponse::Json(view) => ok(view).into_response(),
        QrResponse::Base64(image) => ok(json!({ "base64Image": image })).into_response(),
        QrResponse::Image { mime, bytes } => ([(header::CONTENT_TYPE, mime)], bytes).into_response(),
    };
    Ok(response)
}

async fn relink_device(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(devices::relink(&state, &account, &id).await?))
}

async fn check_whatsapp(
    State(state): State<AppState>,
    Extension(account): Extension<AccountRecord>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CheckNumberRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(devices::check_number(&state, &account, &id, &req.phone_number).await?))
}

async fn list_servers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(ok(servers::list(&state).await?))
}

async fn admin_list_accounts(
    State(state): State<AppState>,
    ApiQuery(page): ApiQuery<Pagination>,
) -> ApiResult<impl IntoResponse> {
    let limit = page.limit.unwrap_or(100).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    Ok(ok(accounts::list(&state, limit, offset).await?))
}

async fn admin_create_account(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<accounts::CreateAccountRequest>,
) -> ApiResult<impl IntoResponse> {
    let account = accounts::create(&state, req).await?;
    Ok((StatusCode::CREATED, ok(account)))
}

async fn admin_get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(accounts::get(&state, &id).await?))
}

async fn admin_update_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<accounts::UpdateAccountRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(accounts::update(&state, &id, req).await?))
}

async fn admin_register_server(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<servers::RegisterServerRequest>,
) -> ApiResult<impl IntoResponse> {
    let server = servers::register(&state, req).await?;
    Ok((StatusCode::CREATED, ok(server)))
}

async fn admin_server_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ServerStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(ok(servers::set_status(&state, &id, req.status).await?))
}
