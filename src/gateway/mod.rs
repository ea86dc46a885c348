//! Client-facing HTTP surface: the `/ws` upgrade endpoint plus `/health`
//! and `/metrics`.
//!
//! The handshake pipeline is: per-IP rate limit → authenticate →
//! 101 upgrade → construct Connection → register (terminating any
//! replaced connection) → connect callbacks → run until termination.

pub mod ratelimit;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Session};
use crate::conn::{Connection, ConnectionHandler};
use crate::GatewayContext;

pub fn build_router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve until `shutdown` fires; cancellation closes the listener so no
/// new upgrades are accepted.
pub async fn serve(ctx: Arc<GatewayContext>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = ctx
        .config
        .ws_addr
        .parse()
        .with_context(|| format!("invalid ws_addr {:?}", ctx.config.ws_addr))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening");

    let router = build_router(ctx);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    device_id: String,
}

/// Error body for failed handshakes: `{code, message, trace_id, timestamp}`.
#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
    trace_id: String,
    timestamp: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        code: status.as_u16(),
        message: message.to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (status, Json(body)).into_response()
}

async fn ws_handler(
    State(ctx): State<Arc<GatewayContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ctx.metrics.handshakes_total.inc();

    if !ctx.limiter.allow(peer.ip()) {
        ctx.metrics
            .handshake_rejected
            .with_label_values(&["rate_limited"])
            .inc();
        warn!(peer = %peer, "handshake rate limit exceeded");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
    }

    let client_ip = peer.ip().to_string();
    let session = match ctx
        .authenticator
        .authenticate(&params.token, &params.device_id, &client_ip)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            let (status, reason) = match e {
                AuthError::MissingToken => (StatusCode::BAD_REQUEST, "missing_token"),
                AuthError::MissingDeviceId => (StatusCode::BAD_REQUEST, "missing_device_id"),
                AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token"),
            };
            ctx.metrics
                .handshake_rejected
                .with_label_values(&[reason])
                .inc();
            return error_response(status, &e.to_string());
        }
    };

    let max_frame = ctx.config.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| attach(ctx, session, socket))
}

/// Take an upgraded socket through registration and run it to completion.
pub async fn attach(ctx: Arc<GatewayContext>, session: Session, socket: WebSocket) {
    let conn = Connection::new(session, &ctx.config);

    match ctx.registry.register(&conn) {
        Ok(Some(prior)) => {
            // Single-device-session rule: the newcomer wins.
            debug!(
                user = %conn.user_uuid(),
                device = %conn.device_id(),
                prior_instance = prior.instance_id(),
                "replacing existing device connection"
            );
            prior.close_gracefully();
        }
        Ok(None) => {}
        Err(_) => {
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: Utf8Bytes::from_static("server shutting down"),
                })))
                .await;
            return;
        }
    }

    ctx.sessions.on_connect(conn.session());
    info!(
        user = %conn.user_uuid(),
        device = %conn.device_id(),
        ip = %conn.session().client_ip,
        instance = conn.instance_id(),
        "device connected"
    );

    let handler: Arc<dyn ConnectionHandler> = ctx.sessions.clone();
    conn.run(socket, ctx.conn_shutdown.clone(), handler).await;

    debug!(
        user = %conn.user_uuid(),
        device = %conn.device_id(),
        instance = conn.instance_id(),
        "device disconnected"
    );
}

async fn health(State(ctx): State<Arc<GatewayContext>>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "connections": ctx.registry.count(),
    }))
    .into_response()
}

async fn metrics_text(State(ctx): State<Arc<GatewayContext>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.encode(),
    )
        .into_response()
}
