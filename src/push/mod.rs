//! Push plane: unary delivery operations over the registry, exposed to
//! push-job through the internal RPC server in [`server`].
//!
//! Every operation is enqueue-and-return — no RPC ever blocks on socket
//! I/O to a client, and a success response only means the payload entered
//! the per-connection write queue.

pub mod client;
pub mod server;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::registry::Registry;

pub struct PushService {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl PushService {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Deliver to one device. False when the device is offline, its queue
    /// rejected the payload, or the payload is malformed — push-job treats
    /// a malformed payload as a permanent failure and must not retry.
    pub fn push_to_device(&self, user_uuid: &str, device_id: &str, message: &Value) -> bool {
        let Some(payload) = self.encode(message) else {
            return false;
        };
        self.registry.send_to_device(user_uuid, device_id, payload)
    }

    /// Deliver to every online device of one user. Returns the count of
    /// accepted enqueues.
    pub fn push_to_user(&self, user_uuid: &str, message: &Value) -> usize {
        let Some(payload) = self.encode(message) else {
            return 0;
        };
        self.registry.send_to_user(user_uuid, payload)
    }

    /// Deliver to many users; the payload is serialized once. Returns
    /// `(success_count, total_delivered)` where a user counts as a success
    /// when at least one of their devices accepted the payload.
    pub fn broadcast_to_users(&self, user_uuids: &[String], message: &Value) -> (usize, usize) {
        let Some(payload) = self.encode(message) else {
            return (0, 0);
        };
        let mut success_count = 0;
        let mut total_delivered = 0;
        for user_uuid in user_uuids {
            let delivered = self.registry.send_to_user(user_uuid, payload.clone());
            if delivered > 0 {
                success_count += 1;
                total_delivered += delivered;
            }
        }
        (success_count, total_delivered)
    }

    /// Evict a device's connection. The reason is logged, never sent to
    /// the client — the device only sees the WebSocket Close frame.
    pub fn kick_connection(&self, user_uuid: &str, device_id: &str, reason: &str) -> bool {
        let success = self.registry.kick_device(user_uuid, device_id);
        if success {
            info!(user = %user_uuid, device = %device_id, reason, "connection kicked");
        }
        success
    }

    /// Serialize the upstream envelope once per operation. The `data`
    /// member is relayed verbatim; only the envelope tag is validated.
    fn encode(&self, message: &Value) -> Option<Bytes> {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if kind.is_empty() {
            self.metrics.enqueue_rejected.inc();
            warn!("push payload is not an envelope — missing type tag");
            return None;
        }
        match serde_json::to_vec(message) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!(err = %e, "push payload serialization failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::config::GatewayConfig;
    use crate::conn::Connection;
    use serde_json::json;

    fn service() -> (PushService, Arc<Registry>) {
        let registry = Arc::new(Registry::new(8));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        (PushService::new(registry.clone(), metrics), registry)
    }

    fn conn(user: &str, device: &str) -> Arc<Connection> {
        Connection::new(
            Session {
                user_uuid: user.into(),
                device_id: device.into(),
                client_ip: "127.0.0.1".into(),
            },
            &GatewayConfig::default(),
        )
    }

    #[test]
    fn test_push_to_offline_device() {
        let (push, _registry) = service();
        assert!(!push.push_to_device("u2", "d2", &json!({"type": "chat", "data": {}})));
    }

    #[test]
    fn test_push_to_device_delivers() {
        let (push, registry) = service();
        let c = conn("u1", "d1");
        registry.register(&c).expect("register");
        assert!(push.push_to_device("u1", "d1", &json!({"type": "chat", "data": {"m": 1}})));
    }

    #[test]
    fn test_push_rejects_non_envelope_payload() {
        let (push, registry) = service();
        let c = conn("u1", "d1");
        registry.register(&c).expect("register");
        assert!(!push.push_to_device("u1", "d1", &json!({"data": {}})));
        assert!(!push.push_to_device("u1", "d1", &json!({"type": "  "})));
    }

    #[test]
    fn test_push_to_user_counts_devices() {
        let (push, registry) = service();
        registry.register(&conn("u3", "dA")).expect("register");
        registry.register(&conn("u3", "dB")).expect("register");
        assert_eq!(push.push_to_user("u3", &json!({"type": "chat"})), 2);
        assert_eq!(push.push_to_user("u4", &json!({"type": "chat"})), 0);
    }

    #[test]
    fn test_broadcast_counts() {
        let (push, registry) = service();
        registry.register(&conn("u1", "d1")).expect("register");
        registry.register(&conn("u2", "d1")).expect("register");
        registry.register(&conn("u2", "d2")).expect("register");
        let users = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        let (success, delivered) = push.broadcast_to_users(&users, &json!({"type": "announce"}));
        assert_eq!(success, 2);
        assert_eq!(delivered, 3);
    }

    #[test]
    fn test_kick_connection() {
        let (push, registry) = service();
        let c = conn("u1", "d1");
        registry.register(&c).expect("register");
        assert!(push.kick_connection("u1", "d1", "abuse"));
        assert!(c.is_closed());
        assert!(!push.kick_connection("u5", "dX", "abuse"));
    }
}
