//! Component-level scenarios: registry semantics, push delivery, session
//! lifecycle propagation, and graceful shutdown.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use common::{build_context, test_config};
use connectd::auth::Session;
use connectd::conn::Connection;
use connectd::directory::DeviceStatus;
use connectd::registry::RegistryError;

fn connection(ctx: &connectd::GatewayContext, user: &str, device: &str) -> Arc<Connection> {
    Connection::new(
        Session {
            user_uuid: user.into(),
            device_id: device.into(),
            client_ip: "127.0.0.1".into(),
        },
        &ctx.config,
    )
}

#[tokio::test]
async fn test_single_device_session_replace() {
    let (ctx, _dir) = build_context(test_config());

    let a = connection(&ctx, "u1", "d1");
    assert!(ctx.registry.register(&a).expect("register a").is_none());

    // A second connection for the same (user, device) replaces the first.
    let b = connection(&ctx, "u1", "d1");
    let replaced = ctx.registry.register(&b).expect("register b").expect("replaced");
    assert!(Arc::ptr_eq(&replaced, &a));
    replaced.close_gracefully();

    assert!(a.is_closed());
    assert!(!b.is_closed());
    assert_eq!(ctx.registry.online_devices("u1"), vec!["d1".to_string()]);
    assert_eq!(ctx.registry.count(), 1);

    // The replaced connection's late cleanup must not evict B.
    ctx.registry.unregister(&a);
    assert_eq!(ctx.registry.count(), 1);
    assert!(ctx.registry.send_to_device("u1", "d1", Bytes::from_static(b"m")));
}

#[tokio::test]
async fn test_push_to_offline_device() {
    let (ctx, _dir) = build_context(test_config());
    let delivered = ctx
        .push
        .push_to_device("u2", "d2", &json!({"type": "chat", "data": {}}));
    assert!(!delivered);
    assert_eq!(ctx.registry.count(), 0);
}

#[tokio::test]
async fn test_broadcast_to_multi_device_user() {
    let (ctx, _dir) = build_context(test_config());
    let a = connection(&ctx, "u3", "dA");
    let b = connection(&ctx, "u3", "dB");
    ctx.registry.register(&a).expect("register");
    ctx.registry.register(&b).expect("register");

    let count = ctx.push.push_to_user("u3", &json!({"type": "chat", "data": "X"}));
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_heartbeat_throttle_sequence() {
    let (ctx, _dir) = build_context(test_config());
    // 8-minute window: accepted, throttled, throttled, accepted.
    assert!(ctx.syncer.touch("u4", "d4", 0));
    assert!(!ctx.syncer.touch("u4", "d4", 60));
    assert!(!ctx.syncer.touch("u4", "d4", 7 * 60));
    assert!(ctx.syncer.touch("u4", "d4", 9 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_closes_everything() {
    let (ctx, _dir) = build_context(test_config());

    let mut conns = Vec::new();
    for u in 0..5 {
        for d in 0..2 {
            let c = connection(&ctx, &format!("u{u}"), &format!("d{d}"));
            ctx.registry.register(&c).expect("register");
            conns.push(c);
        }
    }
    assert_eq!(ctx.registry.count(), 10);

    ctx.registry.shutdown().await;

    for c in &conns {
        assert!(c.is_closed());
    }
    assert_eq!(ctx.registry.count(), 0);
    let late = connection(&ctx, "u9", "d0");
    assert!(matches!(
        ctx.registry.register(&late),
        Err(RegistryError::ShutdownInProgress)
    ));
}

#[tokio::test]
async fn test_kick_absent_device_is_clean_failure() {
    let (ctx, _dir) = build_context(test_config());
    let c = connection(&ctx, "u1", "d1");
    ctx.registry.register(&c).expect("register");

    assert!(!ctx.push.kick_connection("u5", "dX", "abuse"));
    // The unrelated connection is untouched.
    assert!(!c.is_closed());
    assert_eq!(ctx.registry.count(), 1);
}

#[tokio::test]
async fn test_connect_disconnect_reaches_directory() {
    let (ctx, dir) = build_context(test_config());
    let c = connection(&ctx, "u1", "d1");
    ctx.registry.register(&c).expect("register");

    ctx.sessions.on_connect(c.session());
    ctx.sessions.on_disconnect(c.session());

    // Drain the dispatcher so both tasks hit the recording client.
    ctx.lifecycle.shutdown().await;

    // Worker scheduling does not order the two tasks; check membership.
    let statuses = dir.statuses.lock().expect("statuses");
    assert_eq!(statuses.len(), 2);
    assert!(statuses.contains(&("u1".to_string(), "d1".to_string(), DeviceStatus::Online)));
    assert!(statuses.contains(&("u1".to_string(), "d1".to_string(), DeviceStatus::Offline)));
}

#[tokio::test]
async fn test_connect_touch_reaches_directory_via_flush() {
    let (ctx, dir) = build_context(test_config());
    let c = connection(&ctx, "u1", "d1");
    ctx.registry.register(&c).expect("register");
    ctx.sessions.on_connect(c.session());

    // The forced connect touch sits in the pending buffer until a flush;
    // shutdown performs the final one.
    ctx.syncer.shutdown().await;

    let batches = dir.batches.lock().expect("batches");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].user_uuid, "u1");
    assert_eq!(batches[0].device_id, "d1");
}
