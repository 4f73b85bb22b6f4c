use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use chaos_engine::{start_call_timeout_sweep, Services, StoreDirectory};
use chaos_realtime::{start_liveness_sweep, start_presence_bridge, Dispatcher, Registry, Session, SessionSettings};
use chaos_store::users::UserRow;
use chaos_store::Database;

use crate::auth::{AuthUser, JwtAuth};
use crate::config::ServerConfig;
use crate::routes;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no JWT secret configured (set jwt_secret, CHAOS_JWT_SECRET or --jwt-secret)")]
    MissingSecret,

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub dispatcher: Dispatcher,
    pub auth: Arc<JwtAuth>,
    pub session_settings: SessionSettings,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", routes::api_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Wire the registry, dispatcher, services and background tasks, then
/// start serving. Returns a handle that keeps everything alive.
pub async fn start(config: &ServerConfig, db: Database) -> Result<ServerHandle, ServerError> {
    let secret = config.jwt_secret.as_ref().ok_or(ServerError::MissingSecret)?;
    let auth = Arc::new(JwtAuth::new(secret, config.jwt_audience.clone()));

    let (registry, registry_task) = Registry::spawn(config.session.registry_settings());
    let dispatcher = Dispatcher::new(registry.clone(), Arc::new(StoreDirectory::new(db.clone())));
    let services = Services::new(db, dispatcher.clone(), config.calls.settings());

    let tasks = vec![
        registry_task,
        start_presence_bridge(dispatcher.clone()),
        start_liveness_sweep(
            registry,
            Duration::from_secs(config.session.liveness_sweep_secs.max(1)),
            Duration::from_secs(config.session.max_idle_secs),
        ),
        start_call_timeout_sweep(services.calls.clone()),
    ];

    let state = AppState {
        services,
        dispatcher,
        auth,
        session_settings: config.session.session_settings(),
    };

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Bind { addr, source })?;

    info!(addr = %local_addr, "chaos server started");

    let router = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        tasks,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections and cancel every background task.
    pub fn shutdown(self) {
        self.server.abort();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Authenticate, then upgrade. Auth runs first so a bad token is a plain
/// 401 and no session is ever created.
async fn ws_handler(AuthUser(user): AuthUser, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: UserRow, state: AppState) {
    let settings = state.session_settings.clone();
    let session = Session::new(user.id, user.username, settings.queue_capacity);
    let (sink, stream) = socket.split();
    session.run(sink, stream, state.dispatcher, settings).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.dispatcher.registry().list_online().await {
        Ok(online) => (StatusCode::OK, Json(json!({ "status": "healthy", "online": online.len() }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "online": 0 })),
        ),
    }
}
