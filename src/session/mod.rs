//! Session layer: the envelope codec and the per-connection lifecycle
//! orchestration (connect, heartbeat, disconnect, cleanup).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::trace;

use crate::auth::Session;
use crate::conn::{Connection, ConnectionHandler};
use crate::directory::DeviceStatus;
use crate::lifecycle::{LifecycleDispatcher, LifecycleTask};
use crate::metrics::Metrics;
use crate::presence::ActiveTimeSyncer;
use crate::registry::Registry;

pub const HEARTBEAT_TYPE: &str = "heartbeat";
pub const ERROR_TYPE: &str = "error";

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// The application-level frame carried over WebSocket: a tagged record
/// whose `data` member is relayed opaque — the gateway never re-encodes
/// what upstream produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope type is empty")]
    EmptyType,
}

pub fn parse_envelope(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
    let mut envelope: Envelope = serde_json::from_slice(raw)?;
    envelope.kind = envelope.kind.trim().to_string();
    if envelope.kind.is_empty() {
        return Err(EnvelopeError::EmptyType);
    }
    Ok(envelope)
}

pub fn marshal_envelope(kind: &str, data: Option<Value>) -> Bytes {
    let envelope = Envelope {
        kind: kind.to_string(),
        data,
    };
    Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default())
}

// ─── Session service ──────────────────────────────────────────────────────────

/// Orchestrates what happens around a connection's lifetime: presence
/// touches, lifecycle tasks, inbound routing, and registry cleanup.
pub struct SessionService {
    registry: Arc<Registry>,
    syncer: Arc<ActiveTimeSyncer>,
    lifecycle: Arc<LifecycleDispatcher>,
    metrics: Arc<Metrics>,
}

impl SessionService {
    pub fn new(
        registry: Arc<Registry>,
        syncer: Arc<ActiveTimeSyncer>,
        lifecycle: Arc<LifecycleDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            syncer,
            lifecycle,
            metrics,
        }
    }

    /// The device just came online: force an active-time touch (bypassing
    /// the throttle) and queue an Online status update.
    pub fn on_connect(&self, session: &Session) {
        self.syncer
            .reset_throttle(&session.user_uuid, &session.device_id);
        self.syncer
            .touch(&session.user_uuid, &session.device_id, now_unix());
        self.lifecycle.enqueue(LifecycleTask {
            context: "connect",
            user_uuid: session.user_uuid.clone(),
            device_id: session.device_id.clone(),
            status: DeviceStatus::Online,
        });
        self.metrics
            .online_connections
            .set(self.registry.count() as i64);
    }

    /// A heartbeat envelope arrived: a normal, throttled touch.
    pub fn on_heartbeat(&self, session: &Session) {
        self.syncer
            .touch(&session.user_uuid, &session.device_id, now_unix());
    }

    /// The device went offline: clear presence state and queue an Offline
    /// status update.
    pub fn on_disconnect(&self, session: &Session) {
        self.syncer.delete(&session.user_uuid, &session.device_id);
        self.lifecycle.enqueue(LifecycleTask {
            context: "disconnect",
            user_uuid: session.user_uuid.clone(),
            device_id: session.device_id.clone(),
            status: DeviceStatus::Offline,
        });
        self.metrics
            .online_connections
            .set(self.registry.count() as i64);
    }
}

#[async_trait]
impl ConnectionHandler for SessionService {
    /// Route one inbound frame: malformed JSON earns an error envelope,
    /// heartbeats feed the syncer, anything else is ignored here (message
    /// routing is the push-job's business, not the gateway's).
    async fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        match parse_envelope(raw) {
            Err(e) => {
                let body = marshal_envelope(
                    ERROR_TYPE,
                    Some(json!({ "code": 400, "message": e.to_string() })),
                );
                if !conn.enqueue(body) {
                    self.metrics.enqueue_rejected.inc();
                }
            }
            Ok(envelope) if envelope.kind == HEARTBEAT_TYPE => {
                self.on_heartbeat(conn.session());
            }
            Ok(envelope) => {
                trace!(
                    user = %conn.user_uuid(),
                    kind = %envelope.kind,
                    "unhandled envelope type"
                );
            }
        }
    }

    async fn on_close(&self, conn: &Arc<Connection>) {
        self.registry.unregister(conn);
        self.on_disconnect(conn.session());
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
