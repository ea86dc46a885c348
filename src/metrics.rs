//! Prometheus metric handles for the gateway.
//!
//! One `Metrics` value is built at startup and shared by reference; the
//! `/metrics` endpoint encodes the registry in text exposition format.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    /// Live registered connections.
    pub online_connections: IntGauge,
    /// WebSocket upgrade attempts that reached the handshake handler.
    pub handshakes_total: IntCounter,
    /// Handshake rejections by kind (rate_limited, missing_token,
    /// missing_device_id, invalid_token).
    pub handshake_rejected: IntCounterVec,
    /// Credential-store failures where the gateway proceeded fail-open.
    pub auth_fail_open: IntCounter,
    /// Frames dropped because a per-connection write queue was full or closed.
    pub enqueue_rejected: IntCounter,
    /// Lifecycle tasks dropped on a full dispatcher queue.
    pub lifecycle_dropped: IntCounter,
    /// Lifecycle device-status RPCs that failed (not retried).
    pub lifecycle_rpc_errors: IntCounter,
    /// Active-time batches merged back after a handler error or full channel.
    pub presence_merge_backs: IntCounter,
    /// Push-plane operations by method and outcome.
    pub push_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let online_connections = IntGauge::new(
            "connect_online_connections",
            "Currently registered device connections",
        )?;
        let handshakes_total = IntCounter::new(
            "connect_handshakes_total",
            "WebSocket handshake attempts reaching the gateway",
        )?;
        let handshake_rejected = IntCounterVec::new(
            Opts::new(
                "connect_handshake_rejected_total",
                "Rejected handshakes by reason",
            ),
            &["reason"],
        )?;
        let auth_fail_open = IntCounter::new(
            "connect_auth_fail_open_total",
            "Authentications that proceeded despite a credential store failure",
        )?;
        let enqueue_rejected = IntCounter::new(
            "connect_enqueue_rejected_total",
            "Payloads rejected by a full or closed per-connection write queue",
        )?;
        let lifecycle_dropped = IntCounter::new(
            "connect_lifecycle_dropped_total",
            "Lifecycle tasks dropped on a full dispatcher queue",
        )?;
        let lifecycle_rpc_errors = IntCounter::new(
            "connect_lifecycle_rpc_errors_total",
            "Failed device-status RPC calls",
        )?;
        let presence_merge_backs = IntCounter::new(
            "connect_presence_merge_backs_total",
            "Active-time batches merged back into the pending buffer",
        )?;
        let push_requests = IntCounterVec::new(
            Opts::new("connect_push_requests_total", "Push RPC calls by method"),
            &["method", "outcome"],
        )?;

        registry.register(Box::new(online_connections.clone()))?;
        registry.register(Box::new(handshakes_total.clone()))?;
        registry.register(Box::new(handshake_rejected.clone()))?;
        registry.register(Box::new(auth_fail_open.clone()))?;
        registry.register(Box::new(enqueue_rejected.clone()))?;
        registry.register(Box::new(lifecycle_dropped.clone()))?;
        registry.register(Box::new(lifecycle_rpc_errors.clone()))?;
        registry.register(Box::new(presence_merge_backs.clone()))?;
        registry.register(Box::new(push_requests.clone()))?;

        Ok(Self {
            registry,
            online_connections,
            handshakes_total,
            handshake_rejected,
            auth_fail_open,
            enqueue_rejected,
            lifecycle_dropped,
            lifecycle_rpc_errors,
            presence_merge_backs,
            push_requests,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(err = %e, "metrics encode failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let m = Metrics::new().expect("metrics");
        m.online_connections.set(3);
        m.handshakes_total.inc();
        m.push_requests
            .with_label_values(&["push.toDevice", "delivered"])
            .inc();
        let text = m.encode();
        assert!(text.contains("connect_online_connections 3"));
        assert!(text.contains("connect_handshakes_total 1"));
        assert!(text.contains("connect_push_requests_total"));
    }
}
