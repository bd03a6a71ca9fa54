//! Per-device connection registry.
//!
//! Holds at most one live agent handle per device id, bounded by
//! `max_size` with strict LRU eviction. Entries expire after `max_idle`
//! without use and are discarded on the next lookup once marked unhealthy.
//! Handle construction may block on a handshake, so it runs on the
//! [`WorkerPool`] and concurrent acquires for the same id share one build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{DeviceAgent, DeviceConnector};
use crate::directory::{DeviceDirectory, DeviceRecordPatch};
use crate::error::DeviceError;
use crate::scheduler::{Claim, RequestCoalescer, WorkerPool};
use crate::telemetry;

/// Registry sizing and expiry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_size: usize,
    /// Most recently used entries the idle sweep never removes.
    pub min_idle: usize,
    pub max_idle: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_size: 1200,
            min_idle: 10,
            max_idle: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(120),
        }
    }
}

/// Live handle to one device, owned by the registry.
struct PooledConnection {
    address: String,
    agent: Arc<dyn DeviceAgent>,
    generation: u64,
    created_at: Instant,
    last_used: Instant,
    touch_seq: u64,
    use_count: u64,
    healthy: bool,
}

impl PooledConnection {
    fn is_idle_expired(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= max_idle
    }
}

/// What callers get back from [`ConnectionRegistry::acquire`].
///
/// `generation` identifies the underlying connection; pass it back to
/// [`ConnectionRegistry::mark_unhealthy`] so a late failure report cannot
/// flag a connection that has since been rebuilt.
#[derive(Clone)]
pub struct ConnectionHandle {
    device_id: String,
    address: String,
    agent: Arc<dyn DeviceAgent>,
    generation: u64,
}

impl ConnectionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn agent(&self) -> Arc<dyn DeviceAgent> {
        Arc::clone(&self.agent)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("device_id", &self.device_id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-connection figures for `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub device_id: String,
    pub address: String,
    pub use_count: u64,
    pub idle_seconds: f64,
    pub age_seconds: f64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub max_size: usize,
    pub unhealthy: usize,
    pub created: u64,
    pub evicted: u64,
    pub connections: Vec<ConnectionStats>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, PooledConnection>,
    touch_seq: u64,
}

impl RegistryState {
    fn next_seq(&mut self) -> u64 {
        self.touch_seq += 1;
        self.touch_seq
    }
}

pub struct ConnectionRegistry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    builds: RequestCoalescer<String, Option<ConnectionHandle>>,
    directory: Arc<dyn DeviceDirectory>,
    connector: Arc<dyn DeviceConnector>,
    workers: Arc<WorkerPool>,
    next_generation: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        directory: Arc<dyn DeviceDirectory>,
        connector: Arc<dyn DeviceConnector>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        let config = RegistryConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
            builds: RequestCoalescer::new(),
            directory,
            connector,
            workers,
            next_generation: AtomicU64::new(1),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return a live handle for `device_id`, building one if needed.
    ///
    /// `Ok(None)` means the directory has no record for the id.
    pub async fn acquire(&self, device_id: &str) -> Result<Option<ConnectionHandle>, DeviceError> {
        if let Some(handle) = self.lookup(device_id) {
            return Ok(Some(handle));
        }

        match self.builds.claim(device_id.to_string()) {
            Claim::Follower(follower) => follower.wait().await,
            Claim::Leader(guard) => {
                // Another build may have landed between lookup and claim.
                if let Some(handle) = self.lookup(device_id) {
                    guard.complete(Ok(Some(handle.clone())));
                    return Ok(Some(handle));
                }
                let result = self.build(device_id).await;
                guard.complete(result.clone());
                result
            }
        }
    }

    /// Healthy, unexpired entry for `device_id`, touched. Stale entries are removed.
    fn lookup(&self, device_id: &str) -> Option<ConnectionHandle> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let seq = state.next_seq();

        let stale = match state.entries.get_mut(device_id) {
            None => return None,
            Some(conn) if !conn.healthy => "unhealthy",
            Some(conn) if conn.is_idle_expired(now, self.config.max_idle) => "expired",
            Some(conn) => {
                conn.last_used = now;
                conn.touch_seq = seq;
                conn.use_count += 1;
                telemetry::record_registry_event("reused");
                return Some(ConnectionHandle {
                    device_id: device_id.to_string(),
                    address: conn.address.clone(),
                    agent: Arc::clone(&conn.agent),
                    generation: conn.generation,
                });
            }
        };

        state.entries.remove(device_id);
        self.evicted.fetch_add(1, Ordering::Relaxed);
        telemetry::record_registry_event(stale);
        telemetry::record_registry_size(state.entries.len());
        tracing::debug!(device_id, reason = stale, "discarded stale connection");
        None
    }

    async fn build(&self, device_id: &str) -> Result<Option<ConnectionHandle>, DeviceError> {
        let Some(record) = self.directory.find_by_identifier(device_id).await? else {
            tracing::debug!(device_id, "device not in directory");
            return Ok(None);
        };

        let address = record.address();
        let connector = Arc::clone(&self.connector);
        let agent = match self.workers.run(move || connector.connect(&record)).await {
            Ok(agent) => agent,
            Err(e) => {
                telemetry::record_registry_event("failed");
                tracing::warn!(device_id, address = %address, error = %e, "device connection failed");
                return Err(e);
            }
        };

        let handle = self.insert(device_id, address, agent);
        self.update_directory(device_id, true).await;
        Ok(Some(handle))
    }

    fn insert(&self, device_id: &str, address: String, agent: Arc<dyn DeviceAgent>) -> ConnectionHandle {
        let now = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let seq = state.next_seq();

        if !state.entries.contains_key(device_id) {
            while state.entries.len() >= self.config.max_size {
                if !self.evict_lru(&mut state) {
                    break;
                }
            }
        }

        state.entries.insert(
            device_id.to_string(),
            PooledConnection {
                address: address.clone(),
                agent: Arc::clone(&agent),
                generation,
                created_at: now,
                last_used: now,
                touch_seq: seq,
                use_count: 1,
                healthy: true,
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        telemetry::record_registry_event("created");
        telemetry::record_registry_size(state.entries.len());
        tracing::info!(device_id, address = %address, generation, pool_size = state.entries.len(), "device connection created");

        ConnectionHandle {
            device_id: device_id.to_string(),
            address,
            agent,
            generation,
        }
    }

    fn evict_lru(&self, state: &mut RegistryState) -> bool {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, conn)| conn.touch_seq)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                state.entries.remove(&id);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                telemetry::record_registry_event("evicted");
                tracing::debug!(device_id = %id, "evicted least recently used connection");
                true
            }
            None => false,
        }
    }

    /// Flag the connection identified by `generation` as unhealthy.
    ///
    /// Returns `false` if that connection is no longer pooled (already
    /// evicted or rebuilt). The next `acquire` builds a fresh connection.
    pub async fn mark_unhealthy(&self, device_id: &str, generation: u64) -> bool {
        let marked = {
            let mut state = self.state.lock();
            match state.entries.get_mut(device_id) {
                Some(conn) if conn.generation == generation && conn.healthy => {
                    conn.healthy = false;
                    true
                }
                _ => false,
            }
        };

        if marked {
            telemetry::record_registry_event("unhealthy");
            tracing::warn!(device_id, generation, "connection marked unhealthy");
            self.update_directory(device_id, false).await;
        }
        marked
    }

    async fn update_directory(&self, device_id: &str, ready: bool) {
        if let Err(e) = self
            .directory
            .update_fields(device_id, DeviceRecordPatch::ready(ready))
            .await
        {
            tracing::warn!(device_id, ready, error = %e, "failed to update device record");
        }
    }

    /// Remove idle-expired and unhealthy entries.
    ///
    /// The `min_idle` most recently used entries are kept even when idle.
    /// Returns how many entries were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut by_recency: Vec<(&String, &PooledConnection)> = state.entries.iter().collect();
        by_recency.sort_by(|a, b| b.1.touch_seq.cmp(&a.1.touch_seq));

        let doomed: Vec<String> = by_recency
            .iter()
            .enumerate()
            .filter(|(rank, (_, conn))| {
                !conn.healthy
                    || (*rank >= self.config.min_idle
                        && conn.is_idle_expired(now, self.config.max_idle))
            })
            .map(|(_, (id, _))| (*id).clone())
            .collect();

        for id in &doomed {
            state.entries.remove(id);
            telemetry::record_registry_event("expired");
        }
        if !doomed.is_empty() {
            self.evicted.fetch_add(doomed.len() as u64, Ordering::Relaxed);
            telemetry::record_registry_size(state.entries.len());
            tracing::info!(
                removed = doomed.len(),
                remaining = state.entries.len(),
                "connection cleanup"
            );
        }
        doomed.len()
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.cleanup();
                    }
                }
            }
            tracing::debug!("connection cleanup loop stopped");
        })
    }

    /// Whether an entry (healthy or not) is pooled for `device_id`.
    pub fn contains(&self, device_id: &str) -> bool {
        self.state.lock().entries.contains_key(device_id)
    }

    pub fn remove(&self, device_id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(device_id).is_some();
        if removed {
            telemetry::record_registry_size(state.entries.len());
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        telemetry::record_registry_size(0);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.state.lock();
        let mut connections: Vec<ConnectionStats> = state
            .entries
            .iter()
            .map(|(id, conn)| ConnectionStats {
                device_id: id.clone(),
                address: conn.address.clone(),
                use_count: conn.use_count,
                idle_seconds: now.saturating_duration_since(conn.last_used).as_secs_f64(),
                age_seconds: now.saturating_duration_since(conn.created_at).as_secs_f64(),
                healthy: conn.healthy,
            })
            .collect();
        connections.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        PoolStats {
            total: connections.len(),
            max_size: self.config.max_size,
            unhealthy: connections.iter().filter(|c| !c.healthy).count(),
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            connections,
        }
    }
}
