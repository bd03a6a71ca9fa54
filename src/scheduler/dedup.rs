//! Short-lived result caching and request coalescing.
//!
//! [`ResultCache`] keeps recently produced artifacts (mostly encoded
//! screenshots) for a few hundred milliseconds. [`RequestCoalescer`] lets
//! concurrent callers for the same key share one in-flight operation, so a
//! burst of viewers polling the same device at the same resolution costs a
//! single device round-trip.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::agent::CaptureOptions;
use crate::error::DeviceError;
use crate::telemetry;

/// Immutable artifact bytes shared between the cache and every waiter.
pub type Payload = Arc<[u8]>;

/// Composite cache key: the owning device plus every parameter that changes
/// the output bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    device_id: String,
    params: String,
}

impl CacheKey {
    pub fn new(device_id: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            params: params.into(),
        }
    }

    /// Key for an encoded frame of `device_id` at the given quality/scale.
    pub fn screenshot(device_id: &str, options: &CaptureOptions) -> Self {
        Self::new(
            device_id,
            format!("screenshot:q{}:s{:.2}", options.quality, options.scale),
        )
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.params)
    }
}

/// How a `get_or_compute` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// This caller ran the producer.
    Miss,
    /// Served from a live cache entry.
    Hit,
    /// Shared the result of another caller's in-flight producer.
    Dedup,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Miss => "MISS",
            Self::Hit => "HIT",
            Self::Dedup => "DEDUP",
        }
    }
}

// ---------------------------------------------------------------------------
// Request coalescing
// ---------------------------------------------------------------------------

type Shared<V> = Result<V, DeviceError>;

/// Outcome of claiming a key on the coalescer.
pub enum Claim<'a, K: Eq + Hash + Clone + fmt::Debug, V: Clone> {
    /// No equivalent operation is running; the holder must produce the value.
    Leader(LeaderGuard<'a, K, V>),
    /// An equivalent operation is running; await its result.
    Follower(Follower<V>),
}

/// Waiter on another caller's in-flight operation.
pub struct Follower<V> {
    rx: broadcast::Receiver<Shared<V>>,
}

impl<V: Clone> Follower<V> {
    /// Await the leader's result.
    pub async fn wait(mut self) -> Shared<V> {
        match self.rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Cancelled("in-flight request abandoned".into())),
        }
    }
}

/// Tracks in-flight operations by key.
///
/// At most one pending entry exists per key. The entry is removed exactly
/// once, either when the leader completes or when the leader is dropped
/// without completing (waiters then see [`DeviceError::Cancelled`]).
pub struct RequestCoalescer<K, V> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<Shared<V>>>>,
    leaders: AtomicU64,
    followers: AtomicU64,
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
        }
    }

    /// Register interest in `key`, becoming leader or follower.
    pub fn claim(&self, key: K) -> Claim<'_, K, V> {
        let mut in_flight = self.in_flight.lock();
        if let Some(tx) = in_flight.get(&key) {
            self.followers.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = ?key, "joining in-flight request");
            return Claim::Follower(Follower { rx: tx.subscribe() });
        }

        // A single value is ever sent per channel.
        let (tx, _rx) = broadcast::channel(1);
        in_flight.insert(key.clone(), tx);
        self.leaders.fetch_add(1, Ordering::Relaxed);
        Claim::Leader(LeaderGuard {
            coalescer: self,
            key,
            completed: false,
        })
    }

    /// Run `producer` for `key`, or share the result of an equivalent run.
    ///
    /// Returns the result and whether this caller was the leader.
    pub async fn run<F>(&self, key: K, producer: F) -> (Shared<V>, bool)
    where
        F: std::future::Future<Output = Shared<V>>,
    {
        match self.claim(key) {
            Claim::Leader(guard) => {
                let result = producer.await;
                guard.complete(result.clone());
                (result, true)
            }
            Claim::Follower(follower) => (follower.wait().await, false),
        }
    }

    /// Keys with an operation currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// (leader claims, follower claims) since creation.
    pub fn claim_counts(&self) -> (u64, u64) {
        (
            self.leaders.load(Ordering::Relaxed),
            self.followers.load(Ordering::Relaxed),
        )
    }

    fn finish(&self, key: &K, result: Shared<V>) {
        let tx = self.in_flight.lock().remove(key);
        if let Some(tx) = tx {
            let waiters = tx.receiver_count();
            // No receivers is fine: nobody joined.
            let _ = tx.send(result);
            if waiters > 0 {
                tracing::debug!(key = ?key, waiters, "broadcast result to coalesced waiters");
            }
        }
    }
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Leadership over one in-flight key. Completing or dropping it releases the key.
pub struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    coalescer: &'a RequestCoalescer<K, V>,
    key: K,
    completed: bool,
}

impl<K, V> LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Publish the result to every waiter and release the key.
    pub fn complete(mut self, result: Shared<V>) {
        self.completed = true;
        self.coalescer.finish(&self.key, result);
    }
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.coalescer.finish(
                &self.key,
                Err(DeviceError::Cancelled("leader request dropped".into())),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Result cache
// ---------------------------------------------------------------------------

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            default_ttl: Duration::from_millis(300),
        }
    }
}

/// Cached artifact with its production time.
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Payload,
    produced_at: Instant,
    ttl: Duration,
    last_access: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.produced_at) < self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    access_seq: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub dedup: u64,
    pub in_flight: usize,
}

/// Bounded TTL cache with LRU eviction and built-in request coalescing.
pub struct ResultCache {
    state: Mutex<CacheState>,
    coalescer: RequestCoalescer<CacheKey, Payload>,
    config: ResultCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    dedup: AtomicU64,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            coalescer: RequestCoalescer::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dedup: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Get a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.access_seq += 1;
        let seq = state.access_seq;

        match state.entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.last_access = seq;
                Some(Arc::clone(&entry.payload))
            }
            Some(_) => {
                state.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `payload` as produced now, evicting the least recently used
    /// entries if the cache is full.
    pub fn insert(&self, key: CacheKey, payload: Payload, ttl: Duration) {
        let mut state = self.state.lock();
        state.access_seq += 1;
        let seq = state.access_seq;

        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries.max(1) {
                if !Self::evict_lru(&mut state) {
                    break;
                }
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                payload,
                produced_at: Instant::now(),
                ttl,
                last_access: seq,
            },
        );
    }

    /// Return a cached value, join an in-flight producer, or run `producer`.
    ///
    /// On success the produced bytes are cached under `key` for `ttl`
    /// measured from production time. Failures are not cached; they are
    /// delivered to every caller that joined the same in-flight request.
    pub async fn get_or_compute<F>(
        &self,
        key: CacheKey,
        ttl: Duration,
        producer: F,
    ) -> Result<(Payload, CacheStatus), DeviceError>
    where
        F: std::future::Future<Output = Result<Payload, DeviceError>>,
    {
        if let Some(payload) = self.get(&key) {
            return Ok(self.served(payload, CacheStatus::Hit));
        }

        match self.coalescer.claim(key.clone()) {
            Claim::Follower(follower) => {
                let payload = follower.wait().await?;
                Ok(self.served(payload, CacheStatus::Dedup))
            }
            Claim::Leader(guard) => {
                // A previous leader may have finished between our lookup and claim.
                if let Some(payload) = self.get(&key) {
                    guard.complete(Ok(Arc::clone(&payload)));
                    return Ok(self.served(payload, CacheStatus::Hit));
                }

                let result = producer.await;
                if let Ok(payload) = &result {
                    self.insert(key, Arc::clone(payload), ttl);
                }
                guard.complete(result.clone());
                result.map(|payload| self.served(payload, CacheStatus::Miss))
            }
        }
    }

    fn served(&self, payload: Payload, status: CacheStatus) -> (Payload, CacheStatus) {
        let counter = match status {
            CacheStatus::Hit => &self.hits,
            CacheStatus::Miss => &self.misses,
            CacheStatus::Dedup => &self.dedup,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_cache_lookup(status.as_str());
        (payload, status)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        before - state.entries.len()
    }

    /// Drop every entry for `device_id` (e.g. after its connection failed).
    pub fn invalidate_device(&self, device_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| key.device_id() != device_id);
        before - state.entries.len()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dedup: self.dedup.load(Ordering::Relaxed),
            in_flight: self.coalescer.in_flight_count(),
        }
    }

    fn evict_lru(state: &mut CacheState) -> bool {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                state.entries.remove(&key);
                tracing::debug!(cache_key = %key, "evicted least recently used cache entry");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn payload(bytes: &[u8]) -> Payload {
        Arc::from(bytes)
    }

    fn cache(max_entries: usize) -> ResultCache {
        ResultCache::new(ResultCacheConfig {
            max_entries,
            default_ttl: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_screenshot_key_covers_parameters() {
        let a = CacheKey::screenshot("D", &CaptureOptions { quality: 50, scale: 0.5 });
        let b = CacheKey::screenshot("D", &CaptureOptions { quality: 60, scale: 0.5 });
        let c = CacheKey::screenshot("D", &CaptureOptions { quality: 50, scale: 0.4 });
        let d = CacheKey::screenshot("E", &CaptureOptions { quality: 50, scale: 0.5 });
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(
            a,
            CacheKey::screenshot("D", &CaptureOptions { quality: 50, scale: 0.5 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = cache(10);
        let key = CacheKey::new("D", "frame");
        cache.insert(key.clone(), payload(b"jpeg"), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(cache.get(&key).is_some(), "ttl - 1ms must still be served");

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.get(&key).is_none(), "ttl + 1ms must miss");
        assert!(cache.is_empty(), "expired entry is dropped lazily");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_ttl_is_expired() {
        let cache = cache(10);
        let key = CacheKey::new("D", "frame");
        cache.insert(key.clone(), payload(b"jpeg"), Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = cache(2);
        let ttl = Duration::from_secs(60);
        cache.insert(CacheKey::new("D", "a"), payload(b"a"), ttl);
        cache.insert(CacheKey::new("D", "b"), payload(b"b"), ttl);

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get(&CacheKey::new("D", "a")).is_some());
        cache.insert(CacheKey::new("D", "c"), payload(b"c"), ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::new("D", "a")).is_some());
        assert!(cache.get(&CacheKey::new("D", "b")).is_none());
        assert!(cache.get(&CacheKey::new("D", "c")).is_some());
    }

    #[test]
    fn test_invalidate_device_only_touches_its_keys() {
        let cache = cache(10);
        let ttl = Duration::from_secs(60);
        let opts = CaptureOptions { quality: 40, scale: 0.4 };
        cache.insert(CacheKey::screenshot("D1", &opts), payload(b"1"), ttl);
        cache.insert(CacheKey::screenshot("D10", &opts), payload(b"10"), ttl);
        assert_eq!(cache.invalidate_device("D1"), 1);
        assert!(cache.get(&CacheKey::screenshot("D10", &opts)).is_some());
    }

    #[tokio::test]
    async fn test_get_or_compute_miss_then_hit() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("D", "frame");
        let ttl = Duration::from_secs(5);

        let (first, status) = cache
            .get_or_compute(key.clone(), ttl, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(payload(b"frame"))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);

        let (second, status) = cache
            .get_or_compute(key, ttl, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(payload(b"other"))
            })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = cache(10);
        let key = CacheKey::new("D", "frame");
        let ttl = Duration::from_secs(5);

        let err = cache
            .get_or_compute(key.clone(), ttl, async {
                Err(DeviceError::Unavailable("capture failed".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Unavailable("capture failed".into()));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().in_flight, 0);

        let (_, status) = cache
            .get_or_compute(key, ttl, async { Ok(payload(b"ok")) })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_waiters() {
        let coalescer: RequestCoalescer<String, u32> = RequestCoalescer::new();
        let leader = coalescer.claim("k".to_string());
        let follower = coalescer.claim("k".to_string());

        let follower = match follower {
            Claim::Follower(follower) => follower,
            Claim::Leader(_) => panic!("second claim must follow"),
        };
        drop(leader);

        let result = follower.wait().await;
        assert!(matches!(result, Err(DeviceError::Cancelled(_))));
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_coalescer_releases_key_after_completion() {
        let coalescer: RequestCoalescer<String, u32> = RequestCoalescer::new();
        let (result, leader) = coalescer.run("k".to_string(), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert!(leader);
        assert!(!coalescer.is_in_flight(&"k".to_string()));
        assert_eq!(coalescer.claim_counts(), (1, 0));
    }
}
