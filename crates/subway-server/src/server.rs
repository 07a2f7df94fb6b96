//! `GatewayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use subway_auth::Credentials;
use subway_settings::GatewaySettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::connections::ConnectionTracker;
use crate::controller::ConnectionServices;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

/// WebSocket subprotocol negotiated with clients.
pub const PROTOCOL: &str = "graphql-ws";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Gateway settings.
    pub settings: Arc<GatewaySettings>,
    /// Collaborators handed to every connection.
    pub services: ConnectionServices,
    /// Open connections.
    pub connections: Arc<ConnectionTracker>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started (monotonic).
    pub start_time: Instant,
    /// When the server started (wall clock).
    pub started_at: DateTime<Utc>,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a server. `settings` should already be validated.
    pub fn new(settings: GatewaySettings, services: ConnectionServices) -> Self {
        let grace = Duration::from_millis(settings.server.shutdown_timeout_ms);
        Self {
            state: AppState {
                settings: Arc::new(settings),
                services,
                connections: Arc::new(ConnectionTracker::new()),
                shutdown: Arc::new(ShutdownCoordinator::new(grace)),
                start_time: Instant::now(),
                started_at: Utc::now(),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.settings.server.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the listener task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let server = &self.state.settings.server;
        let listener = TcpListener::bind((server.host.as_str(), server.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, path = %server.path, "listening");
        Ok((addr, handle))
    }

    /// Signal shutdown and wait for connections and `listener` to finish.
    pub async fn shutdown_gracefully(&self, listener: Option<JoinHandle<()>>) {
        self.state
            .shutdown
            .graceful_shutdown(&self.state.connections, listener)
            .await;
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Open connections.
    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.state.connections
    }

    /// Server settings.
    pub fn settings(&self) -> &GatewaySettings {
        &self.state.settings
    }
}

/// GET {path}: upgrade to a protocol session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let credentials = Credentials::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_owned()))),
    );
    let connection_id = Uuid::now_v7().to_string();
    let max_message_size = state.settings.server.max_message_size;

    ws.protocols([PROTOCOL])
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, connection_id, credentials, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.started_at,
        state.start_time,
        state.connections.count(),
        state.connections.active_operations(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
