//! Phased termination: upgrades stop, the push plane drains, connections
//! close, and the side-effect pipelines flush — strictly in that order,
//! each phase bounded by what remains of the overall budget.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::GatewayContext;

/// Run the full shutdown sequence. A phase that overruns the remaining
/// budget is logged and left behind — shutdown always completes.
pub async fn run(
    ctx: Arc<GatewayContext>,
    http_token: CancellationToken,
    http_task: JoinHandle<()>,
    push_token: CancellationToken,
    push_task: JoinHandle<()>,
) {
    let budget = ctx.config.shutdown_budget();
    let deadline = tokio::time::Instant::now() + budget;
    info!(budget_secs = budget.as_secs(), "shutdown started");

    // 1. Stop accepting new HTTP upgrades.
    http_token.cancel();

    // 2. Stop the push RPC plane and drain its in-flight calls.
    push_token.cancel();
    phase(deadline, "push-rpc", async {
        let _ = push_task.await;
    })
    .await;

    // 3. Close every live connection: Close frames first, then force.
    ctx.conn_shutdown.cancel();
    phase(deadline, "registry", ctx.registry.shutdown()).await;
    phase(deadline, "http", async {
        let _ = http_task.await;
    })
    .await;

    // 4. Close the lifecycle queue and join its workers.
    phase(deadline, "lifecycle", ctx.lifecycle.shutdown()).await;

    // 5. Final active-time flush; close the batch channel; join workers.
    phase(deadline, "presence", ctx.syncer.shutdown()).await;

    // 6. External clients close when the context drops with the process.
    info!("shutdown complete");
}

async fn phase<F: std::future::Future>(deadline: tokio::time::Instant, name: &str, fut: F) {
    let remaining = deadline.duration_since(tokio::time::Instant::now());
    match tokio::time::timeout(remaining, fut).await {
        Ok(_) => debug!(phase = name, "shutdown phase complete"),
        Err(_) => warn!(phase = name, "shutdown phase overran budget — proceeding"),
    }
}
