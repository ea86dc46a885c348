// SPDX-License-Identifier: MIT
//! Internal push-RPC server: JSON-RPC 2.0 over WebSocket on a dedicated
//! listener, called by the push-job upstream.
//!
//! The caller is trusted infrastructure, but the plane still requires a
//! bearer token on connect (constant-time compared) so a stray local
//! process cannot inject pushes or kicks.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::GatewayContext;

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const UNAUTHORIZED: i32 = -32004;

// ─── Method params ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DevicePushParams {
    user_uuid: String,
    device_id: String,
    message: Value,
}

#[derive(Deserialize)]
struct UserPushParams {
    user_uuid: String,
    message: Value,
}

#[derive(Deserialize)]
struct BroadcastParams {
    user_uuids: Vec<String>,
    message: Value,
}

#[derive(Deserialize)]
struct KickParams {
    user_uuid: String,
    device_id: String,
    #[serde(default)]
    reason: String,
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<GatewayContext>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&ctx.config.push_addr).await?;
    info!(addr = %ctx.config.push_addr, "push RPC server listening");
    serve(listener, ctx, shutdown).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "push accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "push client connected");
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, shutdown).await {
                        warn!(peer = %peer, err = %e, "push connection error");
                    }
                });
            }
        }
    }

    info!("push RPC server stopped");
    Ok(())
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    ctx: Arc<GatewayContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(4 * 1024 * 1024),
        max_frame_size: Some(4 * 1024 * 1024),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Auth challenge ───────────────────────────────────────────────────────
    // The first frame must be a `push.auth` call carrying the shared
    // token; everything else on an unauthenticated connection is refused.
    if !ctx.config.push_token.is_empty() {
        let first =
            tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;

        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            // Timeout, connection closed, or non-text frame — reject silently.
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                let _ = sink
                    .send(Message::Text(error_response(
                        Value::Null,
                        PARSE_ERROR,
                        "Parse error",
                    )))
                    .await;
                return Ok(());
            }
        };

        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "push.auth" {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    UNAUTHORIZED,
                    "Unauthorized — send push.auth first",
                )))
                .await;
            return Ok(());
        }

        let provided = req
            .params
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !tokens_equal(provided, &ctx.config.push_token) {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    UNAUTHORIZED,
                    "Unauthorized — invalid token",
                )))
                .await;
            return Ok(());
        }

        let resp = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "authenticated": true }
        });
        let _ = sink.send(Message::Text(resp.to_string())).await;
        debug!("push client authenticated");
    }

    loop {
        tokio::select! {
            biased;

            // Stop taking new unary calls when shutdown begins; in-flight
            // dispatches have already produced their response by now.
            _ = shutdown.cancelled() => break,

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = dispatch_text(&text, &ctx).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "push send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "push ws error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Dispatch a raw JSON-RPC text frame and produce the response frame.
pub(crate) async fn dispatch_text(text: &str, ctx: &GatewayContext) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error");
        }
    };

    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    trace!(method = %req.method, "push dispatch");

    match dispatch(&req.method, params, ctx).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

async fn dispatch(method: &str, params: Value, ctx: &GatewayContext) -> anyhow::Result<Value> {
    match method {
        "push.ping" => Ok(json!({
            "pong": true,
            "uptime": ctx.started_at.elapsed().as_secs(),
            "connections": ctx.registry.count(),
        })),
        "push.toDevice" => {
            let p: DevicePushParams = serde_json::from_value(params)?;
            let delivered = ctx.push.push_to_device(&p.user_uuid, &p.device_id, &p.message);
            ctx.metrics
                .push_requests
                .with_label_values(&[
                    "push.toDevice",
                    if delivered { "delivered" } else { "missed" },
                ])
                .inc();
            Ok(json!({ "delivered": delivered }))
        }
        "push.toUser" => {
            let p: UserPushParams = serde_json::from_value(params)?;
            let count = ctx.push.push_to_user(&p.user_uuid, &p.message);
            ctx.metrics
                .push_requests
                .with_label_values(&[
                    "push.toUser",
                    if count > 0 { "delivered" } else { "missed" },
                ])
                .inc();
            Ok(json!({ "delivered_count": count }))
        }
        "push.broadcast" => {
            let p: BroadcastParams = serde_json::from_value(params)?;
            let (success_count, total_delivered) =
                ctx.push.broadcast_to_users(&p.user_uuids, &p.message);
            ctx.metrics
                .push_requests
                .with_label_values(&["push.broadcast", "ok"])
                .inc();
            Ok(json!({
                "success_count": success_count,
                "total_delivered": total_delivered,
            }))
        }
        "push.kick" => {
            let p: KickParams = serde_json::from_value(params)?;
            let success = ctx
                .push
                .kick_connection(&p.user_uuid, &p.device_id, &p.reason);
            ctx.metrics
                .push_requests
                .with_label_values(&["push.kick", if success { "ok" } else { "missed" }])
                .inc();
            Ok(json!({ "success": success }))
        }
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn classify_error(e: &anyhow::Error) -> (i32, String) {
    let msg = e.to_string();

    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg));
    }

    error!(err = %e, "push internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

/// Constant-time token comparison to prevent timing-based token oracle
/// attacks. Returns `true` if `a == b` without short-circuiting on
/// mismatch.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
