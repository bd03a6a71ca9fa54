//! Router-facing device service.
//!
//! [`DeviceService`] wires the worker pool, connection registry, result
//! cache, channel pool, dispatcher and batch engine together and exposes the
//! awaitable operations (`screenshot`, `touch`, ...), their detached
//! variants, streaming sessions and operational stats.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{CaptureOptions, DeviceConnector};
use crate::channel::{
    ChannelConfig, ChannelPool, DeviceEvent, EventDispatcher, EventKind, EventPayload,
    EventRecord, SessionConfig, SessionSink, StreamingSession,
};
use crate::directory::DeviceDirectory;
use crate::error::DeviceError;
use crate::health::{HealthChecker, HealthConfig, HealthReport};
use crate::pool::{ConnectionRegistry, PoolStats, RegistryConfig};
use crate::scheduler::{
    BatchConfig, BatchEngine, BatchHandler, BatchStats, CacheStats, CacheStatus, Payload,
    ResultCache, ResultCacheConfig, WorkerPool, WorkerPoolConfig, WorkerPoolStats,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};

/// How often expired cache entries and idle channels are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for every component owned by the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workers: WorkerPoolConfig,
    pub registry: RegistryConfig,
    pub cache: ResultCacheConfig,
    pub batch: BatchConfig,
    pub channels: ChannelConfig,
    pub session: SessionConfig,
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: WorkerPoolConfig::default(),
            registry: RegistryConfig::default(),
            cache: ResultCacheConfig::default(),
            batch: BatchConfig::default(),
            channels: ChannelConfig::default(),
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Operational snapshot returned by [`DeviceService::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub connection_pool: PoolStats,
    pub worker_pool: WorkerPoolStats,
    pub cache: CacheStats,
    pub channels: usize,
    pub sessions: usize,
    pub batch: BatchStats,
}

/// An event submitted without waiting for its result.
#[derive(Debug, Clone)]
pub struct DetachedEvent {
    pub device_id: String,
    pub event: DeviceEvent,
}

struct DispatchHandler {
    dispatcher: Arc<EventDispatcher>,
}

#[async_trait]
impl BatchHandler<DetachedEvent, EventPayload> for DispatchHandler {
    async fn handle(&self, item: DetachedEvent) -> Result<EventPayload, DeviceError> {
        self.dispatcher
            .process(&item.device_id, item.event)
            .await
            .into_result()
    }
}

type DetachedEngine = BatchEngine<EventKind, DetachedEvent, EventPayload>;

pub struct DeviceService {
    config: ServiceConfig,
    workers: Arc<WorkerPool>,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<ResultCache>,
    channels: Arc<ChannelPool>,
    dispatcher: Arc<EventDispatcher>,
    batch: Arc<DetachedEngine>,
    sessions: DashMap<Uuid, Arc<StreamingSession>>,
    shutdown: ShutdownCoordinator,
    health: HealthChecker,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeviceService {
    pub fn new(
        config: ServiceConfig,
        directory: Arc<dyn DeviceDirectory>,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<Self, DeviceError> {
        let workers = Arc::new(WorkerPool::new(config.workers.clone())?);
        let registry = Arc::new(ConnectionRegistry::new(
            config.registry.clone(),
            directory,
            connector,
            Arc::clone(&workers),
        ));
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let channels = Arc::new(ChannelPool::new(
            config.channels.clone(),
            Arc::clone(&registry),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&channels),
            Arc::clone(&workers),
            Arc::clone(&cache),
            cache.default_ttl(),
        ));

        let batch = Arc::new(DetachedEngine::new(config.batch.clone()));
        let handler: Arc<dyn BatchHandler<DetachedEvent, EventPayload>> =
            Arc::new(DispatchHandler {
                dispatcher: Arc::clone(&dispatcher),
            });
        for kind in EventKind::ALL {
            batch.register_handler(kind, Arc::clone(&handler));
        }

        let health = HealthChecker::new(HealthConfig {
            max_worker_backlog: (config.workers.queue_size / 2).max(1),
        });

        Ok(Self {
            config,
            workers,
            registry,
            cache,
            channels,
            dispatcher,
            batch,
            sessions: DashMap::new(),
            shutdown: ShutdownCoordinator::new(),
            health,
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.channels
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn is_accepting(&self) -> bool {
        self.shutdown.is_accepting()
    }

    /// Start the batch engine and the background sweeps. Returns `false` if
    /// already started.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) || !self.is_accepting() {
            return false;
        }

        self.batch.start();
        let mut tasks = self.tasks.lock();
        tasks.push(self.registry.spawn_cleanup(self.background.child_token()));
        tasks.push(self.spawn_maintenance());
        tracing::info!(
            workers = self.workers.num_threads(),
            pool_max_size = self.config.registry.max_size,
            cache_ttl_ms = self.cache.default_ttl().as_millis() as u64,
            "device service started"
        );
        true
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let channels = Arc::clone(&self.channels);
        let cancel = self.background.child_token();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + MAINTENANCE_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        let closed = channels.cleanup();
                        if purged > 0 || closed > 0 {
                            tracing::debug!(purged, closed, "maintenance sweep");
                        }
                    }
                }
            }
        })
    }

    /// Capture a frame. Quality and scale are clamped before the cache key
    /// is formed, so clamped-equal requests share one entry.
    pub async fn screenshot(
        &self,
        device_id: &str,
        quality: u8,
        scale: f32,
    ) -> Result<(Payload, CacheStatus), DeviceError> {
        let options = CaptureOptions::new(quality, scale).clamped();
        match self.execute(device_id, DeviceEvent::Screenshot(options)).await? {
            EventPayload::Frame { bytes, cache } => Ok((bytes, cache)),
            EventPayload::Ack => Err(DeviceError::Unavailable(format!(
                "{device_id}: capture returned no frame"
            ))),
        }
    }

    pub async fn touch(&self, device_id: &str, x: i32, y: i32) -> Result<(), DeviceError> {
        self.execute(device_id, DeviceEvent::Touch { x, y })
            .await
            .map(|_| ())
    }

    /// Swipe; `duration_ms` is clamped to 50..=2000.
    pub async fn swipe(
        &self,
        device_id: &str,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), DeviceError> {
        let event = DeviceEvent::swipe(x1, y1, x2, y2, Duration::from_millis(duration_ms));
        self.execute(device_id, event).await.map(|_| ())
    }

    pub async fn input_text(&self, device_id: &str, text: &str) -> Result<(), DeviceError> {
        let event = DeviceEvent::Input {
            text: text.to_string(),
        };
        self.execute(device_id, event).await.map(|_| ())
    }

    /// Key press; browser key names are translated to Android names.
    pub async fn key_event(&self, device_id: &str, key: &str) -> Result<(), DeviceError> {
        self.execute(device_id, DeviceEvent::key(key))
            .await
            .map(|_| ())
    }

    async fn execute(&self, device_id: &str, event: DeviceEvent) -> Result<EventPayload, DeviceError> {
        let _guard = self.shutdown.track()?;
        self.dispatcher.process(device_id, event).await.into_result()
    }

    pub fn touch_detached(&self, device_id: &str, x: i32, y: i32) -> Result<(), DeviceError> {
        self.submit_detached(device_id, DeviceEvent::Touch { x, y })
    }

    pub fn swipe_detached(
        &self,
        device_id: &str,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), DeviceError> {
        let event = DeviceEvent::swipe(x1, y1, x2, y2, Duration::from_millis(duration_ms));
        self.submit_detached(device_id, event)
    }

    pub fn input_text_detached(&self, device_id: &str, text: &str) -> Result<(), DeviceError> {
        let event = DeviceEvent::Input {
            text: text.to_string(),
        };
        self.submit_detached(device_id, event)
    }

    pub fn key_event_detached(&self, device_id: &str, key: &str) -> Result<(), DeviceError> {
        self.submit_detached(device_id, DeviceEvent::key(key))
    }

    /// Queue `event` on the batch engine and return at once.
    ///
    /// Failures are only visible in logs, metrics and the connection's
    /// health flag. The only error returned here is `ShuttingDown`.
    fn submit_detached(&self, device_id: &str, event: DeviceEvent) -> Result<(), DeviceError> {
        let guard = self.shutdown.track()?;
        let kind = event.kind();
        let device_id = device_id.to_string();
        let deferred = self.batch.submit(
            kind,
            DetachedEvent {
                device_id: device_id.clone(),
                event,
            },
        );

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = deferred.await {
                tracing::warn!(device_id = %device_id, op = kind.as_str(), error = %e, "detached operation failed");
            }
        });
        Ok(())
    }

    /// Create and open a session bound to `device_id`. The caller feeds it
    /// with [`StreamingSession::handle_message`] or [`StreamingSession::drive`].
    pub fn open_streaming_session(
        &self,
        device_id: &str,
        sink: Arc<dyn SessionSink>,
    ) -> Result<Arc<StreamingSession>, DeviceError> {
        if !self.is_accepting() {
            return Err(DeviceError::ShuttingDown);
        }
        let session = Arc::new(StreamingSession::new(
            device_id,
            sink,
            Arc::clone(&self.dispatcher),
            self.config.session.clone(),
        ));
        session.open();
        self.sessions.insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    /// Run a session over `inbound` until the socket closes.
    pub async fn serve_stream<S, E>(
        &self,
        device_id: &str,
        sink: Arc<dyn SessionSink>,
        inbound: S,
    ) -> Result<(), DeviceError>
    where
        S: Stream<Item = Result<String, E>> + Send,
        E: fmt::Display,
    {
        let session = self.open_streaming_session(device_id, sink)?;
        session.drive(inbound).await;
        self.sessions.remove(&session.id());
        Ok(())
    }

    pub async fn close_streaming_session(&self, session_id: Uuid) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        session.close().await;
        true
    }

    /// Open sessions, after pruning any that closed on their own.
    pub fn session_count(&self) -> usize {
        self.sessions.retain(|_, s| !s.is_closed());
        self.sessions.len()
    }

    pub fn recent_events(&self, device_id: &str) -> Vec<EventRecord> {
        self.channels.recent_events(device_id)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            connection_pool: self.registry.stats(),
            worker_pool: self.workers.stats(),
            cache: self.cache.stats(),
            channels: self.channels.len(),
            sessions: self.session_count(),
            batch: self.batch.stats(),
        }
    }

    pub fn health(&self) -> HealthReport {
        self.health.report(self.shutdown.state(), &self.stats())
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Stop accepting work, drain in-flight operations (bounded by the
    /// configured timeout), then tear every component down.
    pub async fn stop(&self) -> ShutdownResult {
        if self.shutdown.state() == ShutdownState::Stopped {
            return ShutdownResult::Complete;
        }
        tracing::info!(
            in_flight = self.shutdown.in_flight_count(),
            "device service stopping"
        );

        let result = self.shutdown.initiate(self.config.shutdown_timeout).await;
        if let ShutdownResult::Timeout { remaining } = &result {
            tracing::warn!(remaining, "shutdown drain timed out");
        }

        self.background.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }

        let sessions: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        self.sessions.clear();
        for session in sessions {
            session.close().await;
        }

        self.batch.stop().await;
        self.channels.clear();
        self.registry.clear();
        self.cache.clear();

        let workers = Arc::clone(&self.workers);
        if let Err(e) = tokio::task::spawn_blocking(move || workers.shutdown()).await {
            tracing::error!(error = %e, "worker pool shutdown failed");
        }

        tracing::info!("device service stopped");
        result
    }
}
