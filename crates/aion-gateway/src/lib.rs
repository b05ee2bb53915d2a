//! aion-gateway: WebSocket gateway in front of the cron service.
//!
//! Provides:
//! - WebSocket server speaking JSON-RPC 2.0
//! - RPC methods: health, cron.*, conversation.*, system.resume
//! - Push notifications for every job and conversation event
//! - Bearer token authentication
//! - HTTP health check endpoint

pub mod connector;
pub mod handlers;
pub mod jsonrpc;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use tracing::{info, warn};

use aion_config::AionConfig;
use aion_cron::bridge::CronBridge;
use aion_cron::busy::BusyGuard;
use aion_cron::service::CronService;
use aion_cron::store::{JobStore, SqliteJobStore};
use aion_cron::store_memory::MemoryJobStore;
use aion_events::EventBus;
use aion_storage::ConversationStorage;
use connector::StorageConnector;

/// Idle conversations are forgotten by the busy guard after this long.
const BUSY_IDLE_MS: i64 = 60 * 60 * 1000;
const BUSY_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Shared gateway state.
pub struct GatewayState {
    pub bridge: Arc<CronBridge>,
    pub service: Arc<CronService>,
    pub storage: Arc<ConversationStorage>,
    pub busy: Arc<BusyGuard>,
    pub events: Arc<EventBus>,
    pub auth_token: Option<String>,
}

/// Wire the cron service, its bridge and the conversation connector together.
///
/// The scheduler is not started; call [`CronService::init`] on `state.service`.
pub fn build_state(
    storage: Arc<ConversationStorage>,
    job_store: Arc<dyn JobStore>,
    config: &AionConfig,
) -> Arc<GatewayState> {
    let events = Arc::new(EventBus::default());
    let busy = Arc::new(BusyGuard::new());
    let connector = Arc::new(StorageConnector::new(storage.clone(), events.clone()));
    let service = CronService::new(
        job_store,
        connector,
        busy.clone(),
        events.clone(),
        config.cron.clone(),
    );
    let bridge = Arc::new(CronBridge::new(service.clone()));

    Arc::new(GatewayState {
        bridge,
        service,
        storage,
        busy,
        events,
        auth_token: config.gateway.auth_token.clone(),
    })
}

/// Open both stores on the configured database, or in memory when that fails.
fn open_stores(
    config: &AionConfig,
) -> Result<(Arc<ConversationStorage>, Arc<dyn JobStore>), Box<dyn std::error::Error>> {
    let opened = config.database_path().map_err(|e| e.to_string()).and_then(|db_path| {
        if let Some(dir) = db_path.parent() {
            aion_config::ensure_dir(dir).map_err(|e| e.to_string())?;
        }
        let storage = ConversationStorage::open(&db_path).map_err(|e| e.to_string())?;
        let jobs = SqliteJobStore::open(&db_path).map_err(|e| e.to_string())?;
        info!("Storage initialized: {}", db_path.display());
        Ok((storage, jobs))
    });

    match opened {
        Ok((storage, jobs)) => {
            let jobs: Arc<dyn JobStore> = Arc::new(jobs);
            Ok((Arc::new(storage), jobs))
        }
        Err(e) => {
            warn!("Failed to open database, running without persistence: {e}");
            let storage = ConversationStorage::open_in_memory()?;
            let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
            Ok((Arc::new(storage), jobs))
        }
    }
}

/// Start the Gateway server.
///
/// Opens storage, starts the scheduler, and serves until Ctrl-C.
pub async fn start_gateway(
    config: AionConfig,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = port_override.unwrap_or(config.gateway.port);
    let host = config.gateway.host.clone();

    let (storage, job_store) = open_stores(&config)?;
    let state = build_state(storage, job_store, &config);

    state.service.init().await?;

    let busy = state.busy.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BUSY_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = busy.cleanup(BUSY_IDLE_MS).await;
            if removed > 0 {
                tracing::debug!(removed, "Dropped idle conversation activity");
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(state.clone());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Gateway listening on {addr}");
    info!("  WebSocket: ws://{addr}/ws");
    info!("  Health:    http://{addr}/health");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    state.service.shutdown().await;
    Ok(())
}

/// GET /health: simple HTTP health check.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let timers = state.service.pending_timers().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler": state.service.is_initialized(),
        "timers": timers,
    }))
}

/// Query parameters for WebSocket connection (alternative auth).
#[derive(Deserialize, Default)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws: WebSocket upgrade with optional bearer token authentication.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if !is_authorized(&state, &headers, query.token.as_deref()) {
        warn!("WebSocket authentication failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(ws.on_upgrade(move |socket| ws::handle_ws_connection(socket, state)))
}

fn is_authorized(state: &GatewayState, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    match &state.auth_token {
        None => true,
        Some(expected) => extract_bearer_token(headers)
            .or(query_token)
            .is_some_and(|token| token == expected),
    }
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<GatewayState> {
    let storage = Arc::new(ConversationStorage::open_in_memory().unwrap());
    build_state(storage, Arc::new(MemoryJobStore::new()), &AionConfig::default())
}
