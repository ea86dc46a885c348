use serde::Deserialize;
use std::path::Path;
use tracing::{error, warn};

const DEFAULT_WS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PUSH_ADDR: &str = "0.0.0.0:9091";
const DEFAULT_USER_ADDR: &str = "http://127.0.0.1:9090";

const DEFAULT_SHARD_COUNT: usize = 32;
const DEFAULT_WRITE_QUEUE: usize = 64;
const DEFAULT_BATCH_DRAIN: usize = 16;
const DEFAULT_PONG_WAIT_SECS: u64 = 60;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const DEFAULT_LIFECYCLE_WORKERS: usize = 64;
const DEFAULT_LIFECYCLE_QUEUE: usize = 8192;
const DEFAULT_LIFECYCLE_RPC_TIMEOUT_SECS: u64 = 3;

const DEFAULT_THROTTLE_SHARDS: usize = 64;
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 8 * 60;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 4 * 60;
const DEFAULT_PRESENCE_WORKERS: usize = 8;
const DEFAULT_PRESENCE_QUEUE: usize = 8192;

const DEFAULT_HANDSHAKE_RPS: u32 = 50;
const DEFAULT_HANDSHAKE_BURST: u32 = 100;
const DEFAULT_HANDSHAKE_MAX_BUCKETS: usize = 65536;

const DEFAULT_SHUTDOWN_BUDGET_SECS: u64 = 15;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Optional `config.toml` — all fields are overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket listen address (default: 0.0.0.0:8080).
    ws_addr: Option<String>,
    /// Internal push-RPC listen address (default: 0.0.0.0:9091).
    push_addr: Option<String>,
    /// User directory base address (default: http://127.0.0.1:9090).
    user_addr: Option<String>,
    /// Address other services use to reach this node's push plane.
    node_addr: Option<String>,
    /// Log level filter string, e.g. "debug", "info,connectd=trace".
    log: Option<String>,
    /// HS256 secret for handshake token verification.
    token_secret: Option<String>,
    /// Bearer token required on the push-RPC plane. Empty disables auth.
    push_token: Option<String>,
    registry: Option<TomlRegistry>,
    connection: Option<TomlConnection>,
    lifecycle: Option<TomlLifecycle>,
    presence: Option<TomlPresence>,
    handshake: Option<TomlHandshake>,
    shutdown_budget_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlRegistry {
    shard_count: Option<i64>,
}

#[derive(Deserialize, Default)]
struct TomlConnection {
    write_queue_size: Option<usize>,
    batch_drain: Option<usize>,
    pong_wait_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    max_frame_bytes: Option<usize>,
}

#[derive(Deserialize, Default)]
struct TomlLifecycle {
    workers: Option<usize>,
    queue_size: Option<usize>,
    rpc_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlPresence {
    throttle_shards: Option<i64>,
    update_interval_secs: Option<u64>,
    flush_interval_secs: Option<u64>,
    workers: Option<usize>,
    queue_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct TomlHandshake {
    rps: Option<u32>,
    burst: Option<u32>,
    max_buckets: Option<usize>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "unparseable env var — ignoring");
            None
        }
    }
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Client WebSocket + health + metrics listen address.
    pub ws_addr: String,
    /// Internal push-RPC listen address (CONNECT_RPC_ADDR).
    pub push_addr: String,
    /// User directory base URL (USER_RPC_ADDR).
    pub user_addr: String,
    /// This node's push-plane address as published to the routing table
    /// (CONNECT_NODE_ADDR). Deployments must set a dialable address; the
    /// default repeats the push listen address.
    pub node_addr: String,
    pub log: String,
    /// HS256 secret for handshake token verification.
    pub token_secret: Option<String>,
    /// Bearer token for the push-RPC plane. Empty string disables auth
    /// (not recommended outside tests).
    pub push_token: String,

    /// Registry shard count. Must be positive; invalid values fall back.
    pub shard_count: usize,

    /// Per-connection write queue capacity.
    pub write_queue_size: usize,
    /// Extra messages opportunistically drained per write-loop wake.
    pub batch_drain: usize,
    /// Read deadline; a peer that sends nothing (not even Pong) for this
    /// long is dropped.
    pub pong_wait_secs: u64,
    pub write_timeout_secs: u64,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,

    pub lifecycle_workers: usize,
    pub lifecycle_queue: usize,
    pub lifecycle_rpc_timeout_secs: u64,

    pub throttle_shards: usize,
    /// Minimum seconds between two accepted active-time touches per device.
    pub update_interval_secs: u64,
    /// Pending-buffer flush cadence.
    pub flush_interval_secs: u64,
    pub presence_workers: usize,
    pub presence_queue: usize,

    pub handshake_rps: u32,
    pub handshake_burst: u32,
    pub handshake_max_buckets: usize,

    pub shutdown_budget_secs: u64,
}

impl GatewayConfig {
    /// Build config from CLI/env args + optional TOML file, then normalize.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `--config`
    ///   3. Built-in defaults
    pub fn new(
        ws_addr: Option<String>,
        push_addr: Option<String>,
        log: Option<String>,
        config_path: Option<&Path>,
    ) -> Self {
        let toml = config_path.and_then(load_toml).unwrap_or_default();
        let registry = toml.registry.unwrap_or_default();
        let connection = toml.connection.unwrap_or_default();
        let lifecycle = toml.lifecycle.unwrap_or_default();
        let presence = toml.presence.unwrap_or_default();
        let handshake = toml.handshake.unwrap_or_default();

        let ws_addr = ws_addr
            .or(toml.ws_addr)
            .unwrap_or_else(|| DEFAULT_WS_ADDR.to_string());
        let push_addr = push_addr
            .or_else(|| env_string("CONNECT_RPC_ADDR"))
            .or(toml.push_addr)
            .unwrap_or_else(|| DEFAULT_PUSH_ADDR.to_string());
        let user_addr = env_string("USER_RPC_ADDR")
            .or(toml.user_addr)
            .unwrap_or_else(|| DEFAULT_USER_ADDR.to_string());
        let push_addr = normalize_listen_addr(&push_addr);
        let node_addr = env_string("CONNECT_NODE_ADDR")
            .or(toml.node_addr)
            .unwrap_or_else(|| push_addr.clone());
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let token_secret = env_string("CONNECT_TOKEN_SECRET").or(toml.token_secret);
        let push_token = env_string("CONNECT_PUSH_TOKEN")
            .or(toml.push_token)
            .unwrap_or_default();

        let shard_count = env_parse::<i64>("CONNECT_SHARD_COUNT")
            .or(registry.shard_count)
            .unwrap_or(DEFAULT_SHARD_COUNT as i64);

        let cfg = Self {
            ws_addr: normalize_listen_addr(&ws_addr),
            push_addr,
            user_addr: normalize_base_url(&user_addr),
            node_addr,
            log,
            token_secret,
            push_token,
            shard_count: positive_or(shard_count, DEFAULT_SHARD_COUNT, "registry.shard_count"),
            write_queue_size: connection.write_queue_size.unwrap_or(DEFAULT_WRITE_QUEUE),
            batch_drain: connection.batch_drain.unwrap_or(DEFAULT_BATCH_DRAIN),
            pong_wait_secs: connection.pong_wait_secs.unwrap_or(DEFAULT_PONG_WAIT_SECS),
            write_timeout_secs: connection
                .write_timeout_secs
                .unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS),
            max_frame_bytes: connection.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            lifecycle_workers: lifecycle.workers.unwrap_or(DEFAULT_LIFECYCLE_WORKERS),
            lifecycle_queue: lifecycle.queue_size.unwrap_or(DEFAULT_LIFECYCLE_QUEUE),
            lifecycle_rpc_timeout_secs: lifecycle
                .rpc_timeout_secs
                .unwrap_or(DEFAULT_LIFECYCLE_RPC_TIMEOUT_SECS),
            throttle_shards: positive_or(
                presence
                    .throttle_shards
                    .unwrap_or(DEFAULT_THROTTLE_SHARDS as i64),
                DEFAULT_THROTTLE_SHARDS,
                "presence.throttle_shards",
            ),
            update_interval_secs: presence
                .update_interval_secs
                .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS),
            flush_interval_secs: presence
                .flush_interval_secs
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
            presence_workers: presence.workers.unwrap_or(DEFAULT_PRESENCE_WORKERS),
            presence_queue: presence.queue_size.unwrap_or(DEFAULT_PRESENCE_QUEUE),
            handshake_rps: handshake.rps.unwrap_or(DEFAULT_HANDSHAKE_RPS),
            handshake_burst: handshake.burst.unwrap_or(DEFAULT_HANDSHAKE_BURST),
            handshake_max_buckets: handshake
                .max_buckets
                .unwrap_or(DEFAULT_HANDSHAKE_MAX_BUCKETS),
            shutdown_budget_secs: toml
                .shutdown_budget_secs
                .unwrap_or(DEFAULT_SHUTDOWN_BUDGET_SECS),
        };
        cfg.normalize()
    }

    /// Clamp invalid knob values back to defaults so a bad config file can
    /// degrade service quality but never brick the gateway.
    fn normalize(mut self) -> Self {
        if self.write_queue_size == 0 {
            warn!("connection.write_queue_size must be positive — using default");
            self.write_queue_size = DEFAULT_WRITE_QUEUE;
        }
        if self.pong_wait_secs == 0 {
            warn!("connection.pong_wait_secs must be positive — using default");
            self.pong_wait_secs = DEFAULT_PONG_WAIT_SECS;
        }
        if self.write_timeout_secs == 0 {
            self.write_timeout_secs = DEFAULT_WRITE_TIMEOUT_SECS;
        }
        if self.max_frame_bytes == 0 {
            self.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        }
        if self.lifecycle_workers == 0 {
            self.lifecycle_workers = DEFAULT_LIFECYCLE_WORKERS;
        }
        if self.lifecycle_queue == 0 {
            self.lifecycle_queue = DEFAULT_LIFECYCLE_QUEUE;
        }
        if self.update_interval_secs == 0 {
            warn!("presence.update_interval_secs must be positive — using default");
            self.update_interval_secs = DEFAULT_UPDATE_INTERVAL_SECS;
        }
        if self.flush_interval_secs == 0 {
            self.flush_interval_secs = DEFAULT_FLUSH_INTERVAL_SECS;
        }
        // Flushing slower than the throttle window would let accepted touches
        // sit in the pending buffer past their own staleness horizon.
        if self.flush_interval_secs > self.update_interval_secs {
            warn!(
                flush = self.flush_interval_secs,
                update = self.update_interval_secs,
                "presence.flush_interval_secs exceeds update interval — clamping"
            );
            self.flush_interval_secs = self.update_interval_secs;
        }
        if self.presence_workers == 0 {
            self.presence_workers = DEFAULT_PRESENCE_WORKERS;
        }
        if self.presence_queue == 0 {
            self.presence_queue = DEFAULT_PRESENCE_QUEUE;
        }
        if self.handshake_rps == 0 {
            self.handshake_rps = DEFAULT_HANDSHAKE_RPS;
        }
        if self.handshake_burst < self.handshake_rps {
            self.handshake_burst = self.handshake_rps;
        }
        if self.handshake_max_buckets == 0 {
            self.handshake_max_buckets = DEFAULT_HANDSHAKE_MAX_BUCKETS;
        }
        self
    }

    pub fn pong_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pong_wait_secs)
    }

    /// Ping cadence: 90% of the pong deadline, so a healthy peer always
    /// sees a Ping before its read deadline expires.
    pub fn ping_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pong_wait_secs * 900)
    }

    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.write_timeout_secs)
    }

    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.update_interval_secs)
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.flush_interval_secs)
    }

    pub fn lifecycle_rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lifecycle_rpc_timeout_secs)
    }

    pub fn shutdown_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_budget_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(None, None, None, None)
    }
}

fn positive_or(value: i64, default: usize, field: &str) -> usize {
    if value > 0 {
        value as usize
    } else {
        warn!(field, value, "non-positive shard count — using default");
        default
    }
}

/// Accept ":9091" shorthand for "all interfaces, port 9091".
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// The user directory address may be given as ":9090", "host:port", or a
/// full URL; reqwest needs a scheme and host.
fn normalize_base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return addr.trim_end_matches('/').to_string();
    }
    if let Some(port) = addr.strip_prefix(':') {
        return format!("http://127.0.0.1:{port}");
    }
    format!("http://{}", addr.trim_end_matches('/'))
}
