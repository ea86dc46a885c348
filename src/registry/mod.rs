//! Sharded online index: user_uuid → device_id → Connection.
//!
//! Shards are keyed by a stable FNV-1a hash of the user UUID so every
//! operation on one user serializes on the same shard lock. Locks are held
//! only for map work — never across socket I/O; send paths snapshot the
//! target connections first and enqueue after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::conn::Connection;

const DEFAULT_SHARD_COUNT: usize = 32;
/// How long graceful Close frames get before remaining sockets are forced.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Registration attempted after shutdown began; the caller should
    /// close the connection instead of retrying.
    #[error("registry is shutting down")]
    ShutdownInProgress,
}

type DeviceMap = HashMap<String, Arc<Connection>>;
type Shard = RwLock<HashMap<String, DeviceMap>>;

pub struct Registry {
    shards: Vec<Shard>,
    shutting_down: AtomicBool,
}

impl Registry {
    /// `shard_count` must be positive; non-positive requests fall back to
    /// the default so a bad config cannot produce a zero-shard registry.
    pub fn new(shard_count: usize) -> Self {
        let count = if shard_count > 0 {
            shard_count
        } else {
            DEFAULT_SHARD_COUNT
        };
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn shard(&self, user_uuid: &str) -> &Shard {
        let idx = (fnv1a_64(user_uuid.as_bytes()) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Insert `conn` at its `(user_uuid, device_id)` key.
    ///
    /// If a distinct connection already occupied the key, it is returned as
    /// the replaced value so the caller can terminate it — the
    /// single-device-session rule. Registration is refused once shutdown
    /// has begun.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<Option<Arc<Connection>>, RegistryError> {
        let shard = self.shard(conn.user_uuid());
        let mut users = shard.write().unwrap_or_else(PoisonError::into_inner);
        // Checked under the shard lock: shutdown sets the flag before it
        // sweeps the shards, so an insert that slipped past the flag is
        // still cleared by the sweep.
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutdownInProgress);
        }
        let devices = users.entry(conn.user_uuid().to_string()).or_default();
        let replaced = devices.insert(conn.device_id().to_string(), conn.clone());
        Ok(replaced.filter(|prior| !Arc::ptr_eq(prior, conn)))
    }

    /// Remove `conn` from the index, but only if the stored pointer is
    /// `conn` itself. A late unregister from a replaced connection must
    /// not evict its replacement.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        let shard = self.shard(conn.user_uuid());
        let mut users = shard.write().unwrap_or_else(PoisonError::into_inner);
        let Some(devices) = users.get_mut(conn.user_uuid()) else {
            return;
        };
        let matches = devices
            .get(conn.device_id())
            .is_some_and(|stored| Arc::ptr_eq(stored, conn));
        if !matches {
            return;
        }
        devices.remove(conn.device_id());
        if devices.is_empty() {
            users.remove(conn.user_uuid());
        }
    }

    /// Enqueue `payload` on the device's connection. Never blocks on
    /// socket I/O; false when the device is offline or the enqueue was
    /// rejected.
    pub fn send_to_device(&self, user_uuid: &str, device_id: &str, payload: Bytes) -> bool {
        let target = {
            let users = self
                .shard(user_uuid)
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            users
                .get(user_uuid)
                .and_then(|devices| devices.get(device_id))
                .cloned()
        };
        match target {
            Some(conn) => conn.enqueue(payload),
            None => false,
        }
    }

    /// Enqueue `payload` on every device of `user_uuid`.
    ///
    /// The device map is snapshotted under the read lock and the enqueues
    /// happen after it is released, so a broadcast never holds up
    /// register/unregister. Devices registered after the snapshot are not
    /// delivered to. Returns the count of accepted enqueues.
    pub fn send_to_user(&self, user_uuid: &str, payload: Bytes) -> usize {
        let snapshot: Vec<Arc<Connection>> = {
            let users = self
                .shard(user_uuid)
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match users.get(user_uuid) {
                Some(devices) => devices.values().cloned().collect(),
                None => return 0,
            }
        };
        snapshot
            .into_iter()
            .filter(|conn| conn.enqueue(payload.clone()))
            .count()
    }

    /// Remove the device's connection from the index and close it
    /// gracefully. True iff a matching entry existed.
    pub fn kick_device(&self, user_uuid: &str, device_id: &str) -> bool {
        let evicted = {
            let shard = self.shard(user_uuid);
            let mut users = shard.write().unwrap_or_else(PoisonError::into_inner);
            let Some(devices) = users.get_mut(user_uuid) else {
                return false;
            };
            let evicted = devices.remove(device_id);
            if devices.is_empty() {
                users.remove(user_uuid);
            }
            evicted
        };
        match evicted {
            Some(conn) => {
                debug!(user = %user_uuid, device = %device_id, "device kicked");
                conn.close_gracefully();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the user's online device IDs.
    pub fn online_devices(&self, user_uuid: &str) -> Vec<String> {
        let users = self
            .shard(user_uuid)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        users
            .get(user_uuid)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total registered connections. Metrics only — the value is stale the
    /// moment the locks are released.
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(HashMap::len)
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Terminate every registered connection and refuse new registrations.
    ///
    /// Runs at most once (CAS-guarded). All shards are cleared first, then
    /// the collected connections get a graceful Close, a short grace
    /// period, and finally a forced close.
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut collected: Vec<Arc<Connection>> = Vec::new();
        for shard in &self.shards {
            let mut users = shard.write().unwrap_or_else(PoisonError::into_inner);
            for (_, devices) in users.drain() {
                collected.extend(devices.into_values());
            }
        }

        info!(connections = collected.len(), "registry shutdown — closing connections");
        for conn in &collected {
            conn.close_gracefully();
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        for conn in &collected {
            conn.close();
        }
    }
}

/// FNV-1a, 64-bit. The shard hash must be stable so operations on the same
/// user always serialize on the same lock.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
