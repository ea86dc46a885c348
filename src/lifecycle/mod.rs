//! Lifecycle side-effect dispatcher: a bounded queue drained by a fixed
//! worker pool that pushes connect/disconnect status to the user
//! directory.
//!
//! Enqueue is lossy on purpose: handshake and teardown latency must never
//! wait on a remote service, and the directory reconciles missed updates
//! through the active-time channel and its own periodic fixups.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::directory::{DeviceStatus, DirectoryClient, RouteTable};
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct LifecycleTask {
    /// Log tag naming the event that produced the task.
    pub context: &'static str,
    pub user_uuid: String,
    pub device_id: String,
    pub status: DeviceStatus,
}

pub struct LifecycleDispatcher {
    /// Dropped at shutdown to close the queue; workers drain and exit.
    tx: Mutex<Option<mpsc::Sender<LifecycleTask>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl LifecycleDispatcher {
    pub fn spawn(
        cfg: &GatewayConfig,
        client: Arc<dyn DirectoryClient>,
        routes: Option<Arc<dyn RouteTable>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<LifecycleTask>(cfg.lifecycle_queue);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let rpc_timeout = cfg.lifecycle_rpc_timeout();
        let node_addr: Arc<str> = Arc::from(cfg.node_addr.as_str());

        let workers = (0..cfg.lifecycle_workers)
            .map(|_| {
                tokio::spawn(Self::worker(
                    rx.clone(),
                    client.clone(),
                    routes.clone(),
                    node_addr.clone(),
                    rpc_timeout,
                    metrics.clone(),
                ))
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
            metrics,
        }
    }

    /// Non-blocking enqueue. A full (or closed) queue drops the task with
    /// a warning — status updates are reconciled upstream.
    pub fn enqueue(&self, task: LifecycleTask) {
        let sender = {
            let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let Some(sender) = sender else {
            self.drop_task(&task, "dispatcher stopped");
            return;
        };
        if let Err(e) = sender.try_send(task) {
            let task = match e {
                mpsc::error::TrySendError::Full(t) => t,
                mpsc::error::TrySendError::Closed(t) => t,
            };
            self.drop_task(&task, "queue full");
        }
    }

    fn drop_task(&self, task: &LifecycleTask, why: &'static str) {
        self.metrics.lifecycle_dropped.inc();
        warn!(
            context = task.context,
            user = %task.user_uuid,
            device = %task.device_id,
            status = task.status.as_str(),
            why,
            "lifecycle task dropped"
        );
    }

    /// Close the queue and join the workers. Queued tasks are drained
    /// before the workers exit.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take();
        }
        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                debug!(err = %e, "lifecycle worker join error");
            }
        }
    }

    async fn worker(
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LifecycleTask>>>,
        client: Arc<dyn DirectoryClient>,
        routes: Option<Arc<dyn RouteTable>>,
        node_addr: Arc<str>,
        rpc_timeout: std::time::Duration,
        metrics: Arc<Metrics>,
    ) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                break;
            };

            // Route first on connect so push-job can reach the device as
            // soon as the directory marks it online.
            if let Some(routes) = &routes {
                Self::apply_route(routes, &node_addr, &task, rpc_timeout).await;
            }

            // Fresh bounded timeout per task; errors are logged, never
            // retried here.
            let result = tokio::time::timeout(
                rpc_timeout,
                client.update_device_status(&task.user_uuid, &task.device_id, task.status),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics.lifecycle_rpc_errors.inc();
                    warn!(
                        context = task.context,
                        user = %task.user_uuid,
                        device = %task.device_id,
                        status = task.status.as_str(),
                        err = %e,
                        "device-status update failed"
                    );
                }
                Err(_) => {
                    metrics.lifecycle_rpc_errors.inc();
                    warn!(
                        context = task.context,
                        user = %task.user_uuid,
                        device = %task.device_id,
                        status = task.status.as_str(),
                        "device-status update timed out"
                    );
                }
            }
        }
    }

    /// Publish this node's address on connect, withdraw it on disconnect.
    async fn apply_route(
        routes: &Arc<dyn RouteTable>,
        node_addr: &str,
        task: &LifecycleTask,
        rpc_timeout: std::time::Duration,
    ) {
        let op = async {
            match task.status {
                DeviceStatus::Online => {
                    routes
                        .publish(&task.user_uuid, &task.device_id, node_addr)
                        .await
                }
                DeviceStatus::Offline => {
                    routes
                        .withdraw(&task.user_uuid, &task.device_id, node_addr)
                        .await
                }
            }
        };
        match tokio::time::timeout(rpc_timeout, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                user = %task.user_uuid,
                device = %task.device_id,
                status = task.status.as_str(),
                err = %e,
                "route table update failed"
            ),
            Err(_) => warn!(
                user = %task.user_uuid,
                device = %task.device_id,
                status = task.status.as_str(),
                "route table update timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        offline: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryClient for CountingClient {
        async fn update_device_status(
            &self,
            _user_uuid: &str,
            _device_id: &str,
            status: DeviceStatus,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if status == DeviceStatus::Offline {
                self.offline.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn batch_update_active_time(
            &self,
            _items: &[crate::presence::ActiveTimeItem],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn task(user: &str, status: DeviceStatus) -> LifecycleTask {
        LifecycleTask {
            context: "test",
            user_uuid: user.into(),
            device_id: "d1".into(),
            status,
        }
    }

    #[tokio::test]
    async fn test_tasks_reach_the_directory() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            offline: AtomicUsize::new(0),
        });
        let cfg = GatewayConfig {
            lifecycle_workers: 4,
            lifecycle_queue: 64,
            ..GatewayConfig::default()
        };
        let dispatcher = LifecycleDispatcher::spawn(
            &cfg,
            client.clone(),
            None,
            Arc::new(Metrics::new().expect("metrics")),
        );

        for i in 0..10 {
            let status = if i % 2 == 0 {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
            dispatcher.enqueue(task(&format!("u{i}"), status));
        }
        dispatcher.shutdown().await;

        assert_eq!(client.calls.load(Ordering::SeqCst), 10);
        assert_eq!(client.offline.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_routes_follow_device_status() {
        #[derive(Default)]
        struct RecordingRoutes {
            ops: std::sync::Mutex<Vec<(String, String, String)>>,
        }

        #[async_trait]
        impl RouteTable for RecordingRoutes {
            async fn publish(
                &self,
                user_uuid: &str,
                device_id: &str,
                node_addr: &str,
            ) -> Result<()> {
                self.ops.lock().expect("ops").push((
                    "publish".into(),
                    format!("{user_uuid}/{device_id}"),
                    node_addr.into(),
                ));
                Ok(())
            }

            async fn withdraw(
                &self,
                user_uuid: &str,
                device_id: &str,
                node_addr: &str,
            ) -> Result<()> {
                self.ops.lock().expect("ops").push((
                    "withdraw".into(),
                    format!("{user_uuid}/{device_id}"),
                    node_addr.into(),
                ));
                Ok(())
            }
        }

        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            offline: AtomicUsize::new(0),
        });
        let routes = Arc::new(RecordingRoutes::default());
        let cfg = GatewayConfig {
            node_addr: "10.0.0.9:9091".into(),
            lifecycle_workers: 1,
            ..GatewayConfig::default()
        };
        let dispatcher = LifecycleDispatcher::spawn(
            &cfg,
            client,
            Some(routes.clone() as Arc<dyn RouteTable>),
            Arc::new(Metrics::new().expect("metrics")),
        );

        dispatcher.enqueue(task("u1", DeviceStatus::Online));
        dispatcher.enqueue(task("u1", DeviceStatus::Offline));
        dispatcher.shutdown().await;

        let ops = routes.ops.lock().expect("ops");
        assert_eq!(
            *ops,
            vec![
                (
                    "publish".to_string(),
                    "u1/d1".to_string(),
                    "10.0.0.9:9091".to_string()
                ),
                (
                    "withdraw".to_string(),
                    "u1/d1".to_string(),
                    "10.0.0.9:9091".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_drops_with_metric() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            offline: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let dispatcher = LifecycleDispatcher::spawn(
            &GatewayConfig::default(),
            client.clone(),
            None,
            metrics.clone(),
        );
        dispatcher.shutdown().await;

        dispatcher.enqueue(task("u1", DeviceStatus::Online));
        assert_eq!(metrics.lifecycle_dropped.get(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
