use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use bytes::Bytes;
use connectd::auth::Session;
use connectd::config::GatewayConfig;
use connectd::conn::Connection;
use connectd::registry::Registry;

fn conn(cfg: &GatewayConfig, user: &str, device: &str) -> Arc<Connection> {
    Connection::new(
        Session {
            user_uuid: user.into(),
            device_id: device.into(),
            client_ip: "10.0.0.1".into(),
        },
        cfg,
    )
}

fn bench_registry(c: &mut Criterion) {
    let cfg = GatewayConfig::default();

    c.bench_function("register_unregister", |b| {
        let registry = Registry::new(cfg.shard_count);
        b.iter(|| {
            let conn = conn(&cfg, "bench-user", "bench-device");
            let _ = registry.register(black_box(&conn));
            registry.unregister(black_box(&conn));
        });
    });

    c.bench_function("send_to_device_hot_path", |b| {
        let registry = Registry::new(cfg.shard_count);
        // Big queue so the bench measures lookup + enqueue, not overflow.
        let big_queue = GatewayConfig {
            write_queue_size: 1_000_000,
            ..cfg.clone()
        };
        let target = conn(&big_queue, "u-target", "d1");
        registry.register(&target).expect("register");
        let payload = Bytes::from_static(b"{\"type\":\"chat\",\"data\":\"x\"}");
        b.iter(|| {
            black_box(registry.send_to_device("u-target", "d1", payload.clone()));
        });
    });

    c.bench_function("send_to_user_16_devices", |b| {
        let registry = Registry::new(cfg.shard_count);
        let big_queue = GatewayConfig {
            write_queue_size: 1_000_000,
            ..cfg.clone()
        };
        for i in 0..16 {
            let c = conn(&big_queue, "u-fan", &format!("d{i}"));
            registry.register(&c).expect("register");
        }
        let payload = Bytes::from_static(b"{\"type\":\"chat\"}");
        b.iter(|| {
            black_box(registry.send_to_user("u-fan", payload.clone()));
        });
    });
}

criterion_group!(benches, bench_registry);
criterion_main!(benches);
