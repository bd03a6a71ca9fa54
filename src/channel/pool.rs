//! Per-device channels over the connection registry.
//!
//! Every event for a device, whether from a one-shot request or a streaming
//! session, resolves its channel here. The channel re-acquires its
//! connection from the registry each time, so all callers for a device see
//! the same connection and health state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::event::EventKind;
use crate::error::DeviceError;
use crate::pool::{ConnectionHandle, ConnectionRegistry};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_channels: usize,
    pub max_idle: Duration,
    /// Ring buffer length of recent events per channel.
    pub history: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_channels: 1200,
            max_idle: Duration::from_secs(120),
            history: 100,
        }
    }
}

/// One entry of a channel's event ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub ok: bool,
}

struct Channel {
    last_active: Instant,
    touch_seq: u64,
    events: u64,
    history: VecDeque<EventRecord>,
}

impl Channel {
    fn new(now: Instant, seq: u64, capacity: usize) -> Self {
        Self {
            last_active: now,
            touch_seq: seq,
            events: 0,
            history: VecDeque::with_capacity(capacity.min(128)),
        }
    }

    fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_active) >= max_idle
    }
}

/// Channel reference handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub device_id: String,
    pub connection: ConnectionHandle,
}

#[derive(Default)]
struct ChannelState {
    channels: HashMap<String, Channel>,
    touch_seq: u64,
}

pub struct ChannelPool {
    config: ChannelConfig,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<ChannelState>,
}

impl ChannelPool {
    pub fn new(config: ChannelConfig, registry: Arc<ConnectionRegistry>) -> Self {
        let config = ChannelConfig {
            max_channels: config.max_channels.max(1),
            history: config.history.max(1),
            ..config
        };
        Self {
            config,
            registry,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolve the channel for `device_id`, creating it on first use.
    ///
    /// `Ok(None)` when the device is unknown.
    pub async fn acquire(&self, device_id: &str) -> Result<Option<ChannelHandle>, DeviceError> {
        let Some(connection) = self.registry.acquire(device_id).await? else {
            return Ok(None);
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        state.touch_seq += 1;
        let seq = state.touch_seq;

        let expired = state
            .channels
            .get(device_id)
            .is_some_and(|ch| ch.is_idle(now, self.config.max_idle));
        if expired {
            state.channels.remove(device_id);
            tracing::debug!(device_id, "replaced idle channel");
        }

        if let Some(channel) = state.channels.get_mut(device_id) {
            channel.touch_seq = seq;
        } else {
            while state.channels.len() >= self.config.max_channels {
                if !Self::evict_one(&mut state, now, self.config.max_idle) {
                    break;
                }
            }
            state
                .channels
                .insert(device_id.to_string(), Channel::new(now, seq, self.config.history));
            tracing::debug!(device_id, channels = state.channels.len(), "channel opened");
        }

        Ok(Some(ChannelHandle {
            device_id: device_id.to_string(),
            connection,
        }))
    }

    /// Record an event outcome. Success also refreshes the channel's activity.
    pub fn record(&self, device_id: &str, kind: EventKind, ok: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let history_len = self.config.history;
        if let Some(channel) = state.channels.get_mut(device_id) {
            if channel.history.len() >= history_len {
                channel.history.pop_front();
            }
            channel.history.push_back(EventRecord {
                kind,
                at: Utc::now(),
                ok,
            });
            channel.events += 1;
            if ok {
                channel.last_active = now;
            }
        }
    }

    /// Idle channels go first, then the least recently used.
    fn evict_one(state: &mut ChannelState, now: Instant, max_idle: Duration) -> bool {
        let victim = state
            .channels
            .iter()
            .find(|(_, ch)| ch.is_idle(now, max_idle))
            .or_else(|| state.channels.iter().min_by_key(|(_, ch)| ch.touch_seq))
            .map(|(id, _)| id.clone());
        match victim {
            Some(id) => {
                state.channels.remove(&id);
                tracing::debug!(device_id = %id, "evicted channel");
                true
            }
            None => false,
        }
    }

    /// Remove idle channels. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.channels.len();
        let max_idle = self.config.max_idle;
        state.channels.retain(|_, ch| !ch.is_idle(now, max_idle));
        let removed = before - state.channels.len();
        if removed > 0 {
            tracing::info!(removed, remaining = state.channels.len(), "channel cleanup");
        }
        removed
    }

    /// Most recent events for `device_id`, oldest first.
    pub fn recent_events(&self, device_id: &str) -> Vec<EventRecord> {
        self.state
            .lock()
            .channels
            .get(device_id)
            .map(|ch| ch.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn event_count(&self, device_id: &str) -> u64 {
        self.state
            .lock()
            .channels
            .get(device_id)
            .map(|ch| ch.events)
            .unwrap_or(0)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.state.lock().channels.contains_key(device_id)
    }

    pub fn remove(&self, device_id: &str) -> bool {
        self.state.lock().channels.remove(device_id).is_some()
    }

    pub fn clear(&self) {
        self.state.lock().channels.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockConnector;
    use crate::directory::{DeviceRecord, MemoryDirectory};
    use crate::pool::RegistryConfig;
    use crate::scheduler::{WorkerPool, WorkerPoolConfig};

    fn channel_pool(config: ChannelConfig, ids: &[&str]) -> ChannelPool {
        let directory = Arc::new(MemoryDirectory::with_records(
            ids.iter().map(|id| DeviceRecord::mock(*id)),
        ));
        let workers = Arc::new(
            WorkerPool::new(WorkerPoolConfig {
                num_threads: 2,
                op_timeout: None,
                ..Default::default()
            })
            .unwrap(),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            RegistryConfig::default(),
            directory,
            Arc::new(MockConnector::default()),
            workers,
        ));
        ChannelPool::new(config, registry)
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let pool = channel_pool(
            ChannelConfig {
                history: 3,
                ..ChannelConfig::default()
            },
            &["D"],
        );
        pool.acquire("D").await.unwrap().unwrap();
        for i in 0..5 {
            pool.record("D", EventKind::Touch, i % 2 == 0);
        }

        let events = pool.recent_events("D");
        assert_eq!(events.len(), 3);
        assert_eq!(pool.event_count("D"), 5);
        assert!(events[2].ok);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lru_channel() {
        let pool = channel_pool(
            ChannelConfig {
                max_channels: 2,
                ..ChannelConfig::default()
            },
            &["a", "b", "c"],
        );
        pool.acquire("a").await.unwrap();
        pool.acquire("b").await.unwrap();
        pool.acquire("a").await.unwrap();
        pool.acquire("c").await.unwrap();

        assert_eq!(pool.len(), 2);
        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
    }

    #[tokio::test]
    async fn test_unknown_device_has_no_channel() {
        let pool = channel_pool(ChannelConfig::default(), &[]);
        assert!(pool.acquire("ghost").await.unwrap().is_none());
        assert!(pool.is_empty());
    }
}
