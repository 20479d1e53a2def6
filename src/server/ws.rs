// src/server/ws.rs

//! The gateway's HTTP surface: websocket upgrade endpoints per role, the
//! `/stats` snapshot, and the dynamic log level control.

use crate::connection;
use crate::core::registry::{PeerRole, SubscriberScope};
use crate::core::state::GatewayState;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::WebSocket,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

/// Everything a request handler needs.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Builds the gateway's axum router.
pub fn router(gateway: Arc<GatewayState>, shutdown_tx: broadcast::Sender<()>) -> Router {
    let app_state = AppState {
        gateway,
        shutdown_tx,
    };
    Router::new()
        .route("/ws/bots", get(upgrade_bot))
        .route("/ws/workers", get(upgrade_worker))
        .route("/ws/subscribers", get(upgrade_subscriber))
        .route("/ws", get(upgrade_generic))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/loglevel", put(loglevel_handler))
        .with_state(app_state)
}

#[derive(Debug, Deserialize, Default)]
struct UpgradeParams {
    /// Only meaningful on `/ws`; the path-based endpoints fix the role.
    role: Option<String>,
    /// Subscriber scope: full visibility.
    admin: Option<bool>,
    /// Subscriber scope: comma-separated bot ids this subscriber may see.
    bots: Option<String>,
}

impl UpgradeParams {
    fn scope(&self) -> SubscriberScope {
        SubscriberScope {
            admin: self.admin.unwrap_or(false),
            owned_bots: self
                .bots
                .as_deref()
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect::<HashSet<_>>()
                })
                .unwrap_or_default(),
        }
    }
}

async fn upgrade_bot(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(app, ws, headers, addr, PeerRole::Bot, SubscriberScope::default())
}

async fn upgrade_worker(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(app, ws, headers, addr, PeerRole::Worker, SubscriberScope::default())
}

async fn upgrade_subscriber(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<UpgradeParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(app, ws, headers, addr, PeerRole::Subscriber, params.scope())
}

/// The single-endpoint variant for clients that cannot set the path; the
/// role comes from a query parameter instead.
async fn upgrade_generic(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<UpgradeParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let role = match params.role.as_deref() {
        Some("bot") => PeerRole::Bot,
        Some("worker") => PeerRole::Worker,
        Some("subscriber") => PeerRole::Subscriber,
        other => {
            warn!(role = ?other, %addr, "Upgrade rejected: unknown role.");
            return (StatusCode::BAD_REQUEST, "unknown role").into_response();
        }
    };
    let scope = params.scope();
    upgrade(app, ws, headers, addr, role, scope)
}

fn upgrade(
    app: AppState,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    addr: SocketAddr,
    role: PeerRole,
    scope: SubscriberScope,
) -> Response {
    if app.gateway.registry.total() >= app.gateway.config.max_clients {
        warn!(%addr, "Upgrade rejected: connection limit reached.");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    // Bots usually carry their account id in X-Self-ID; a missing header
    // leaves a provisional address-based key that the first identified frame
    // renames.
    let header_id = headers
        .get("x-self-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let id = header_id.unwrap_or_else(|| format!("{role}-{addr}"));
    let platform = headers
        .get("x-platform")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    info!(%role, %id, %platform, %addr, "Upgrading connection.");

    let shutdown_rx = app.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket: WebSocket| {
        connection::serve_peer(app.gateway, socket, role, id, scope, shutdown_rx)
    })
}

async fn stats_handler(State(app): State<AppState>) -> Response {
    let g = &app.gateway;
    let snapshot = g.stats.snapshot();
    Json(json!({
        "bots": g.registry.len(PeerRole::Bot),
        "workers": g.registry.len(PeerRole::Worker),
        "subscribers": g.registry.len(PeerRole::Subscriber),
        "pending_requests": g.correlator.outstanding(),
        "routing_rules": g.router.rules(),
        "stats": snapshot,
    }))
    .into_response()
}

async fn metrics_handler(State(app): State<AppState>) -> Response {
    crate::core::metrics::refresh_connection_gauges(&app.gateway.registry);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        crate::core::metrics::gather_metrics(),
    )
        .into_response()
}

/// Changes the active log filter at runtime. The body is an `EnvFilter`
/// directive string such as `debug` or `nexus::core::router=trace`.
async fn loglevel_handler(State(app): State<AppState>, body: String) -> Response {
    let directive = body.trim();
    let filter = match directive.parse::<EnvFilter>() {
        Ok(f) => f,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid filter: {e}")).into_response();
        }
    };
    match app.gateway.log_reload_handle.reload(filter) {
        Ok(()) => {
            info!("Log filter changed to '{directive}'.");
            (StatusCode::OK, format!("log filter set to '{directive}'\n")).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to reload filter: {e}"),
        )
            .into_response(),
    }
}
