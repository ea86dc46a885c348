//! Connection loop behavior over real sockets: server pings, idle-peer
//! eviction, and FIFO delivery through the write queue.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{build_context, mint_token, test_config, TEST_SECRET};
use connectd::config::GatewayConfig;
use connectd::gateway;
use connectd::GatewayContext;

async fn start_gateway(
    cfg: GatewayConfig,
) -> (Arc<GatewayContext>, SocketAddr, CancellationToken) {
    let (ctx, _dir) = build_context(cfg);
    let router = gateway::build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    });
    (ctx, addr, token)
}

async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..300 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_server_pings_on_schedule() {
    // pong_wait 2s → ping period 1.8s.
    let cfg = GatewayConfig {
        pong_wait_secs: 2,
        ..test_config()
    };
    let (_ctx, addr, stop) = start_gateway(cfg).await;

    let token = mint_token(TEST_SECRET, "u1", "d1");
    let url = format!("ws://{addr}/ws?token={token}&device_id=d1");
    let (mut client, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("connect");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    let mut saw_ping = false;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, client.next()).await {
            Ok(Some(Ok(tokio_tungstenite::tungstenite::Message::Ping(_)))) => {
                saw_ping = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    assert!(saw_ping, "server should ping within the pong window");
    stop.cancel();
}

#[tokio::test]
async fn test_idle_peer_is_dropped() {
    // A peer that sends nothing (not even Pong — it never reads, so the
    // client library cannot auto-reply) is evicted at the read deadline.
    let cfg = GatewayConfig {
        pong_wait_secs: 1,
        ..test_config()
    };
    let (ctx, addr, stop) = start_gateway(cfg).await;

    let token = mint_token(TEST_SECRET, "u1", "d1");
    let url = format!("ws://{addr}/ws?token={token}&device_id=d1");
    let (client, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("connect");
    {
        let ctx = ctx.clone();
        wait_for(move || ctx.registry.count() == 1).await;
    }

    // Hold the connection open but completely silent.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(ctx.registry.count(), 0, "idle peer should be evicted");
    drop(client);
    stop.cancel();
}

#[tokio::test]
async fn test_fifo_delivery_through_write_queue() {
    let (ctx, addr, stop) = start_gateway(test_config()).await;

    let token = mint_token(TEST_SECRET, "u1", "d1");
    let url = format!("ws://{addr}/ws?token={token}&device_id=d1");
    let (mut client, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("connect");
    {
        let ctx = ctx.clone();
        wait_for(move || ctx.registry.count() == 1).await;
    }

    // Enqueue a burst larger than one batch drain (16); every payload must
    // arrive as its own frame, in enqueue order.
    for seq in 0..40 {
        assert!(ctx
            .push
            .push_to_device("u1", "d1", &json!({"type": "chat", "data": {"seq": seq}})));
    }

    let mut expected = 0;
    while expected < 40 {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                assert_eq!(value["data"]["seq"], json!(expected), "frames must stay FIFO");
                expected += 1;
            }
            // Control frames may interleave; ordering only binds payloads.
            tokio_tungstenite::tungstenite::Message::Ping(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
    stop.cancel();
}
