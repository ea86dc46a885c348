pub mod auth;
pub mod config;
pub mod conn;
pub mod directory;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod presence;
pub mod push;
pub mod registry;
pub mod session;
pub mod shutdown;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use auth::token::{HsTokenDecoder, TokenDecoder};
use auth::{Authenticator, CredentialStore};
use config::GatewayConfig;
use directory::{DirectoryClient, RouteTable};
use gateway::ratelimit::HandshakeLimiter;
use lifecycle::LifecycleDispatcher;
use metrics::Metrics;
use presence::ActiveTimeSyncer;
use push::PushService;
use registry::Registry;
use session::SessionService;

/// Shared gateway state passed to every server loop and handler.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<Registry>,
    pub syncer: Arc<ActiveTimeSyncer>,
    pub lifecycle: Arc<LifecycleDispatcher>,
    pub sessions: Arc<SessionService>,
    pub push: Arc<PushService>,
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<HandshakeLimiter>,
    /// Parent token observed by every connection; cancelled when the
    /// process starts shutting down.
    pub conn_shutdown: CancellationToken,
    pub started_at: std::time::Instant,
}

impl GatewayContext {
    /// Wire the components together. `directory` serves the lifecycle
    /// dispatcher and the active-time syncer; `routes` and
    /// `credential_store` are optional — without them route publication
    /// is skipped and authentication is token-only.
    pub fn build(
        config: GatewayConfig,
        directory: Arc<dyn DirectoryClient>,
        routes: Option<Arc<dyn RouteTable>>,
        credential_store: Option<Arc<dyn CredentialStore>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new()?);

        let registry = Arc::new(Registry::new(config.shard_count));
        let syncer = Arc::new(ActiveTimeSyncer::spawn(
            &config,
            directory.clone(),
            metrics.clone(),
        ));
        let lifecycle = Arc::new(LifecycleDispatcher::spawn(
            &config,
            directory,
            routes,
            metrics.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            registry.clone(),
            syncer.clone(),
            lifecycle.clone(),
            metrics.clone(),
        ));
        let push = Arc::new(PushService::new(registry.clone(), metrics.clone()));

        let decoder: Arc<dyn TokenDecoder> = Arc::new(HsTokenDecoder::new(
            config.token_secret.clone().unwrap_or_default(),
        ));
        let authenticator = Arc::new(Authenticator::new(
            decoder,
            credential_store,
            metrics.clone(),
        ));
        let limiter = Arc::new(HandshakeLimiter::new(
            config.handshake_rps,
            config.handshake_burst,
            config.handshake_max_buckets,
        ));

        Ok(Arc::new(Self {
            config,
            metrics,
            registry,
            syncer,
            lifecycle,
            sessions,
            push,
            authenticator,
            limiter,
            conn_shutdown: CancellationToken::new(),
            started_at: std::time::Instant::now(),
        }))
    }
}
