//! HTTP surface
//!
//! An axum router exposing `POST /mcp/{server}` and `POST /mcpo/{server}`
//! (the same JSON-RPC envelope; only the routing tag differs) plus
//! `GET /health`. File downloads under `/files/{uuid}/{name}` are served by
//! an external static file server from the workspace root and are not
//! routed here.
//!
//! The handlers only extract identity and bytes; everything else lives in
//! the [`Dispatcher`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::dispatch::{DispatchOutcome, Dispatcher, Identity};

/// Identity header carrying the upstream user id (case-insensitive).
pub const HEADER_USER_ID: &str = "x-openwebui-user-id";
/// Identity header carrying the upstream chat id (case-insensitive).
pub const HEADER_CHAT_ID: &str = "x-openwebui-chat-id";

/// Top-level application state owned by the HTTP surface.
pub struct AppContext {
    /// The dispatcher and its collaborators.
    pub dispatcher: Dispatcher,
    /// Server start time, reported as `uptime_seconds` by `/health`.
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            started_at: Instant::now(),
        })
    }
}

/// Create the axum router for the bridge.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/mcp/:server", post(handle_mcp))
        .route("/mcpo/:server", post(handle_mcpo))
        .route("/health", get(handle_health))
        .with_state(ctx)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    ctx: Arc<AppContext>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let app = router(ctx);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn handle_mcp(
    State(ctx): State<Arc<AppContext>>,
    Path(server): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(ctx, "mcp", server, headers, connect, body).await
}

async fn handle_mcpo(
    State(ctx): State<Arc<AppContext>>,
    Path(server): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(ctx, "mcpo", server, headers, connect, body).await
}

async fn dispatch(
    ctx: Arc<AppContext>,
    proto: &'static str,
    server: String,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let identity = identity_from(&headers, connect.map(|c| c.0));
    let outcome = ctx
        .dispatcher
        .dispatch(proto, &server, &body, &identity)
        .await;
    into_response(outcome)
}

/// Extract the caller identity from the recognised headers, falling back to
/// the connection address.
fn identity_from(headers: &HeaderMap, peer: Option<SocketAddr>) -> Identity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Identity {
        user_id: header(HEADER_USER_ID),
        chat_id: header(HEADER_CHAT_ID),
        remote_addr: peer
            .map(|p| p.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn into_response(outcome: DispatchOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match outcome.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    }
}

async fn handle_health(State(ctx): State<Arc<AppContext>>) -> Response {
    let payload = serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "stateful_processes": ctx.dispatcher.registry().live_count().await,
    });
    (StatusCode::OK, Json(payload)).into_response()
}
