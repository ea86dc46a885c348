use anyhow::Result;
use clap::Parser;
use connectd::{
    config::GatewayConfig,
    directory::{HttpCredentialStore, HttpDirectoryClient, HttpRouteTable},
    gateway, push, shutdown, GatewayContext,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "connectd",
    about = "Connect — real-time chat connection gateway",
    version
)]
struct Args {
    /// Client WebSocket + health + metrics listen address
    #[arg(long, env = "CONNECT_WS_ADDR")]
    ws_addr: Option<String>,

    /// Internal push-RPC listen address (also CONNECT_RPC_ADDR)
    #[arg(long)]
    push_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONNECT_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CONNECT_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Path to an optional config.toml with low-priority overrides
    #[arg(long, env = "CONNECT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "connectd starting");

    let config = GatewayConfig::new(
        args.ws_addr,
        args.push_addr,
        args.log,
        args.config.as_deref(),
    );
    info!(
        ws_addr = %config.ws_addr,
        push_addr = %config.push_addr,
        user_addr = %config.user_addr,
        shards = config.shard_count,
        "config loaded"
    );

    if config.token_secret.is_none() {
        // Without the verification secret every handshake would be refused.
        // This is a startup configuration error, not a recoverable condition.
        eprintln!("FATAL: CONNECT_TOKEN_SECRET is required");
        std::process::exit(1);
    }
    if config.push_token.is_empty() {
        warn!("push RPC authentication disabled — set CONNECT_PUSH_TOKEN");
    }

    let directory = Arc::new(HttpDirectoryClient::new(&config.user_addr)?);
    let routes = Arc::new(HttpRouteTable::new(&config.user_addr)?);
    let credentials = Arc::new(HttpCredentialStore::new(&config.user_addr)?);
    let ctx = GatewayContext::build(config, directory, Some(routes), Some(credentials))?;

    // ── Servers ──────────────────────────────────────────────────────────────
    let http_token = CancellationToken::new();
    let push_token = CancellationToken::new();

    let http_task = {
        let ctx = ctx.clone();
        let token = http_token.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway::serve(ctx, token).await {
                error!(err = %e, "gateway server failed");
            }
        })
    };
    let push_task = {
        let ctx = ctx.clone();
        let token = push_token.clone();
        tokio::spawn(async move {
            if let Err(e) = push::server::run(ctx, token).await {
                error!(err = %e, "push RPC server failed");
            }
        })
    };

    make_shutdown_future().await;
    info!("shutdown signal received");

    shutdown::run(ctx, http_token, http_task, push_token, push_task).await;
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("connectd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to register SIGTERM handler — Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
