//! Active-time syncer: a sharded throttle in front of a coalescing pending
//! buffer, drained by an interval flusher into a bounded batch channel.
//!
//! Presence data is load-bearing for the user directory, so nothing here
//! drops on pressure: a full batch channel or a failed batch handler
//! merges the batch back into the pending buffer for the next flush. The
//! buffer is bounded by the distinct online device population.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::directory::DirectoryClient;
use crate::metrics::Metrics;
use crate::registry::fnv1a_64;

/// One device's most recent activity timestamp, keyed on
/// `user_uuid:device_id` for coalescing inside the pending buffer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActiveTimeItem {
    pub user_uuid: String,
    pub device_id: String,
    pub unix_seconds: i64,
}

fn composite_key(user_uuid: &str, device_id: &str) -> String {
    format!("{user_uuid}:{device_id}")
}

struct SyncerShared {
    /// last-accepted-touch unix seconds per composite key.
    throttle: Vec<Mutex<HashMap<String, i64>>>,
    /// Coalesced items awaiting the next flush.
    pending: Mutex<HashMap<String, ActiveTimeItem>>,
    update_interval_secs: i64,
    metrics: Arc<Metrics>,
}

impl SyncerShared {
    fn throttle_shard(&self, key: &str) -> &Mutex<HashMap<String, i64>> {
        let idx = (fnv1a_64(key.as_bytes()) as usize) % self.throttle.len();
        &self.throttle[idx]
    }

    /// Re-insert a batch without clobbering entries that arrived after the
    /// batch was cut — the pending entry is always the newer one.
    fn merge_back(&self, batch: Vec<ActiveTimeItem>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for item in batch {
            let key = composite_key(&item.user_uuid, &item.device_id);
            pending.entry(key).or_insert(item);
        }
        self.metrics.presence_merge_backs.inc();
    }

    /// Swap the pending buffer out and hand the batch to the worker
    /// channel. A full channel merges the batch straight back.
    fn flush(&self, tx: &mpsc::Sender<Vec<ActiveTimeItem>>) {
        let drained: HashMap<String, ActiveTimeItem> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return;
        }
        let batch: Vec<ActiveTimeItem> = drained.into_values().collect();
        let size = batch.len();
        match tx.try_send(batch) {
            Ok(()) => debug!(items = size, "active-time batch queued"),
            Err(TrySendError::Full(batch)) => {
                warn!(items = size, "active-time channel full — merging batch back");
                self.merge_back(batch);
            }
            Err(TrySendError::Closed(batch)) => {
                warn!(items = size, "active-time channel closed — merging batch back");
                self.merge_back(batch);
            }
        }
    }
}

pub struct ActiveTimeSyncer {
    shared: Arc<SyncerShared>,
    stop: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ActiveTimeSyncer {
    /// Start the flusher and worker pool. `handler` performs the external
    /// RPC for each batch; a handler error is a soft retry — the batch is
    /// merged back and picked up by a later flush.
    pub fn spawn(
        cfg: &GatewayConfig,
        handler: Arc<dyn DirectoryClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(SyncerShared {
            throttle: (0..cfg.throttle_shards)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            pending: Mutex::new(HashMap::new()),
            update_interval_secs: cfg.update_interval_secs as i64,
            metrics,
        });
        let (tx, rx) = mpsc::channel::<Vec<ActiveTimeItem>>(cfg.presence_queue);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stop = CancellationToken::new();

        let mut tasks = Vec::with_capacity(cfg.presence_workers + 1);
        tasks.push(tokio::spawn(Self::flusher(
            shared.clone(),
            tx,
            cfg.flush_interval(),
            stop.clone(),
        )));
        for _ in 0..cfg.presence_workers {
            tasks.push(tokio::spawn(Self::worker(
                shared.clone(),
                rx.clone(),
                handler.clone(),
            )));
        }

        Self {
            shared,
            stop,
            tasks: tokio::sync::Mutex::new(tasks),
        }
    }

    /// Record activity for a device.
    ///
    /// Returns `false` when the touch falls inside the throttle window; a
    /// touch exactly at the window boundary is accepted. Accepted touches
    /// overwrite any pending item for the same device.
    pub fn touch(&self, user_uuid: &str, device_id: &str, now: i64) -> bool {
        let key = composite_key(user_uuid, device_id);
        {
            let shard = self.shared.throttle_shard(&key);
            let mut last_seen = shard.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = last_seen.get(&key) {
                if now - last < self.shared.update_interval_secs {
                    return false;
                }
            }
            last_seen.insert(key.clone(), now);
        }
        let item = ActiveTimeItem {
            user_uuid: user_uuid.to_string(),
            device_id: device_id.to_string(),
            unix_seconds: now,
        };
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, item);
        true
    }

    /// Forget the throttle state for a device so the next touch is always
    /// accepted. The pending buffer is left alone.
    pub fn reset_throttle(&self, user_uuid: &str, device_id: &str) {
        let key = composite_key(user_uuid, device_id);
        self.shared
            .throttle_shard(&key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Drop all state for a device: throttle entry and pending item.
    pub fn delete(&self, user_uuid: &str, device_id: &str) {
        let key = composite_key(user_uuid, device_id);
        self.shared
            .throttle_shard(&key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Final flush, then close the batch channel and join the workers.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                debug!(err = %e, "presence task join error");
            }
        }
    }

    async fn flusher(
        shared: Arc<SyncerShared>,
        tx: mpsc::Sender<Vec<ActiveTimeItem>>,
        period: std::time::Duration,
        stop: CancellationToken,
    ) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    shared.flush(&tx);
                    // Dropping the sender closes the channel; workers drain
                    // what is queued and exit.
                    break;
                }
                _ = interval.tick() => shared.flush(&tx),
            }
        }
    }

    async fn worker(
        shared: Arc<SyncerShared>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<ActiveTimeItem>>>>,
        handler: Arc<dyn DirectoryClient>,
    ) {
        loop {
            let batch = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(batch) = batch else {
                break;
            };
            if let Err(e) = handler.batch_update_active_time(&batch).await {
                warn!(items = batch.len(), err = %e, "active-time batch failed — merging back");
                shared.merge_back(batch);
            }
        }
    }
}
