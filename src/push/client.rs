//! Lightweight JSON-RPC WebSocket client for the push plane.
//!
//! Push-job (and the integration tests) use this to connect to a gateway
//! node, authenticate, and issue unary push calls.

use anyhow::{bail, Context as _, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// A long-lived client connection to one gateway node's push plane.
///
/// Connects once, authenticates, then allows any number of `call`
/// invocations. Drop to close the connection.
pub struct PushClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl PushClient {
    /// Connect and authenticate. `token` may be empty when the target
    /// gateway runs with push auth disabled.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .context("timed out connecting to push plane")?
            .context("failed to connect to push plane")?;
        let mut client = Self { ws, next_id: 1 };

        if !token.is_empty() {
            let result = client.call("push.auth", json!({ "token": token })).await?;
            if result.get("authenticated") != Some(&Value::Bool(true)) {
                bail!("push plane rejected authentication");
            }
        }
        Ok(client)
    }

    /// Issue one unary call and return its `result` member.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .context("push call send failed")?;

        let deadline = tokio::time::Instant::now() + CALL_TIMEOUT;
        loop {
            let remaining = deadline.duration_since(tokio::time::Instant::now());
            let msg = tokio::time::timeout(remaining, self.ws.next())
                .await
                .context("timed out waiting for push response")?;
            let msg = match msg {
                Some(m) => m.context("push connection error")?,
                None => bail!("push connection closed"),
            };
            let text = match msg {
                Message::Text(t) => t,
                Message::Ping(data) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                    continue;
                }
                Message::Close(_) => bail!("push connection closed"),
                _ => continue,
            };

            let response: Value =
                serde_json::from_str(&text).context("push response is not JSON")?;
            if response.get("id") != Some(&json!(id)) {
                // A response for a different call on this connection;
                // callers are sequential, so skip and keep waiting.
                continue;
            }
            if let Some(error) = response.get("error") {
                bail!(
                    "push call {method} failed: {} (code {})",
                    error.get("message").and_then(Value::as_str).unwrap_or("?"),
                    error.get("code").and_then(Value::as_i64).unwrap_or(0),
                );
            }
            return Ok(response.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn ping(&mut self) -> Result<Value> {
        self.call("push.ping", Value::Null).await
    }

    pub async fn push_to_device(
        &mut self,
        user_uuid: &str,
        device_id: &str,
        message: Value,
    ) -> Result<bool> {
        let result = self
            .call(
                "push.toDevice",
                json!({
                    "user_uuid": user_uuid,
                    "device_id": device_id,
                    "message": message,
                }),
            )
            .await?;
        Ok(result.get("delivered") == Some(&Value::Bool(true)))
    }

    pub async fn push_to_user(&mut self, user_uuid: &str, message: Value) -> Result<i64> {
        let result = self
            .call(
                "push.toUser",
                json!({ "user_uuid": user_uuid, "message": message }),
            )
            .await?;
        Ok(result
            .get("delivered_count")
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    pub async fn broadcast_to_users(
        &mut self,
        user_uuids: &[String],
        message: Value,
    ) -> Result<(i64, i64)> {
        let result = self
            .call(
                "push.broadcast",
                json!({ "user_uuids": user_uuids, "message": message }),
            )
            .await?;
        Ok((
            result
                .get("success_count")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            result
                .get("total_delivered")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        ))
    }

    pub async fn kick_connection(
        &mut self,
        user_uuid: &str,
        device_id: &str,
        reason: &str,
    ) -> Result<bool> {
        let result = self
            .call(
                "push.kick",
                json!({
                    "user_uuid": user_uuid,
                    "device_id": device_id,
                    "reason": reason,
                }),
            )
            .await?;
        Ok(result.get("success") == Some(&Value::Bool(true)))
    }
}
