//! Time/size windowed event batching.
//!
//! Items are collected until either `batch_size` have accumulated or
//! `flush_interval` has passed since the oldest unflushed item. A flushed
//! batch is grouped by event type; groups run concurrently, items within a
//! group run one after another through the group's handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DeviceError;
use crate::telemetry;

/// Configuration for batch collection.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
        }
    }
}

/// Processes items of one event type.
#[async_trait]
pub trait BatchHandler<P, R>: Send + Sync {
    async fn handle(&self, payload: P) -> Result<R, DeviceError>;
}

/// Adapts an async closure into a [`BatchHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<P, R, F, Fut> BatchHandler<P, R> for FnHandler<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, DeviceError>> + Send,
{
    async fn handle(&self, payload: P) -> Result<R, DeviceError> {
        (self.0)(payload).await
    }
}

/// Result of a submitted item, resolved when its batch is processed.
pub struct Deferred<R> {
    rx: oneshot::Receiver<Result<R, DeviceError>>,
}

impl<R> Deferred<R> {
    fn rejected(err: DeviceError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl<R> Future for Deferred<R> {
    type Output = Result<R, DeviceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(DeviceError::Cancelled("batch item dropped".into())))
        })
    }
}

struct BatchItem<K, P, R> {
    kind: K,
    payload: P,
    reply: oneshot::Sender<Result<R, DeviceError>>,
    enqueued_at: Instant,
}

/// Snapshot of batch engine counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub submitted: u64,
    pub flushed_batches: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    resolved: AtomicU64,
    flushed_batches: AtomicU64,
}

impl Counters {
    fn resolve<R>(&self, reply: oneshot::Sender<Result<R, DeviceError>>, result: Result<R, DeviceError>) {
        // Count first so a woken submitter never sees its item as pending.
        self.resolved.fetch_add(1, Ordering::Relaxed);
        let _ = reply.send(result);
    }
}

type HandlerMap<K, P, R> = Arc<RwLock<HashMap<K, Arc<dyn BatchHandler<P, R>>>>>;

/// Generic batching engine keyed by event type `K`.
pub struct BatchEngine<K, P, R> {
    config: BatchConfig,
    tx: mpsc::UnboundedSender<BatchItem<K, P, R>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BatchItem<K, P, R>>>>,
    handlers: HandlerMap<K, P, R>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, P, R> BatchEngine<K, P, R>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                flush_interval: config.flush_interval,
            },
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register_handler(&self, kind: K, handler: Arc<dyn BatchHandler<P, R>>) {
        self.handlers.write().insert(kind, handler);
    }

    /// Queue an item. The returned future resolves once its batch is flushed.
    pub fn submit(&self, kind: K, payload: P) -> Deferred<R> {
        if self.cancel.is_cancelled() {
            return Deferred::rejected(DeviceError::ShuttingDown);
        }

        let (reply, rx) = oneshot::channel();
        let item = BatchItem {
            kind,
            payload,
            reply,
            enqueued_at: Instant::now(),
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
            self.counters
                .resolve(item.reply, Err(DeviceError::ShuttingDown));
        }
        Deferred { rx }
    }

    /// Start the collection loop. Returns `false` if it was already started
    /// or the engine has been stopped.
    pub fn start(&self) -> bool {
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };

        let runner = Runner {
            config: self.config.clone(),
            handlers: Arc::clone(&self.handlers),
            counters: Arc::clone(&self.counters),
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(runner.run(rx)));
        tracing::info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "batch engine started"
        );
        true
    }

    /// Stop the loop. Items not yet processed are rejected with `Cancelled`.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "batch engine task failed");
            }
        } else if let Some(mut rx) = self.rx.lock().take() {
            Runner::<K, P, R>::reject_queued(&mut rx, &self.counters);
        }
        tracing::info!("batch engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some() && !self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> BatchStats {
        let submitted = self.counters.submitted.load(Ordering::Relaxed);
        let resolved = self.counters.resolved.load(Ordering::Relaxed);
        BatchStats {
            submitted,
            flushed_batches: self.counters.flushed_batches.load(Ordering::Relaxed),
            pending: submitted.saturating_sub(resolved),
        }
    }
}

struct Runner<K, P, R> {
    config: BatchConfig,
    handlers: HandlerMap<K, P, R>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<K, P, R> Runner<K, P, R>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    P: Send + 'static,
    R: Send + 'static,
{
    async fn run(self, mut rx: mpsc::UnboundedReceiver<BatchItem<K, P, R>>) {
        'collect: loop {
            // Cancellation wins over queued items.
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'collect,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break 'collect,
                },
            };

            let deadline = first.enqueued_at + self.config.flush_interval;
            let mut batch = Vec::with_capacity(self.config.batch_size);
            batch.push(first);

            while batch.len() < self.config.batch_size {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        for item in batch {
                            self.counters.resolve(
                                item.reply,
                                Err(DeviceError::Cancelled("batch engine stopped".into())),
                            );
                        }
                        break 'collect;
                    }
                    next = tokio::time::timeout_at(deadline, rx.recv()) => match next {
                        Ok(Some(item)) => batch.push(item),
                        // Deadline reached or all senders gone.
                        Ok(None) | Err(_) => break,
                    },
                }
            }

            self.flush(batch).await;
        }

        Self::reject_queued(&mut rx, &self.counters);
    }

    async fn flush(&self, batch: Vec<BatchItem<K, P, R>>) {
        let size = batch.len();
        let mut order: Vec<K> = Vec::new();
        let mut groups: HashMap<K, Vec<BatchItem<K, P, R>>> = HashMap::new();
        for item in batch {
            if !groups.contains_key(&item.kind) {
                order.push(item.kind.clone());
            }
            groups.entry(item.kind.clone()).or_default().push(item);
        }

        let group_count = order.len();
        self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
        telemetry::record_batch_flush(size, group_count);
        let runs = order.into_iter().filter_map(|kind| {
            let items = groups.remove(&kind)?;
            let handler = self.handlers.read().get(&kind).cloned();
            let counters = Arc::clone(&self.counters);
            Some(async move {
                let Some(handler) = handler else {
                    tracing::warn!(event_type = %kind, items = items.len(), "no handler registered");
                    for item in items {
                        counters.resolve(item.reply, Err(DeviceError::Unrecognized(kind.to_string())));
                    }
                    return;
                };

                for item in items {
                    let result = AssertUnwindSafe(handler.handle(item.payload))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(DeviceError::Unavailable(format!("{kind} handler panicked")))
                        });
                    if let Err(e) = &result {
                        tracing::debug!(event_type = %kind, error = %e, "batch item failed");
                    }
                    counters.resolve(item.reply, result);
                }
            })
        });
        join_all(runs).await;
    }

    fn reject_queued(rx: &mut mpsc::UnboundedReceiver<BatchItem<K, P, R>>, counters: &Counters) {
        rx.close();
        let mut rejected = 0usize;
        while let Ok(item) = rx.try_recv() {
            counters.resolve(
                item.reply,
                Err(DeviceError::Cancelled("batch engine stopped".into())),
            );
            rejected += 1;
        }
        if rejected > 0 {
            tracing::info!(rejected, "rejected queued batch items on stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn BatchHandler<u32, u32>> {
        Arc::new(FnHandler(|v: u32| async move { Ok(v * 2) }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_size_before_deadline() {
        let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
            batch_size: 3,
            flush_interval: Duration::from_secs(3600),
        });
        engine.register_handler("tap", echo());
        engine.start();

        let started = Instant::now();
        let deferred: Vec<_> = (1..=3).map(|v| engine.submit("tap", v)).collect();
        let results: Vec<_> = join_all(deferred).await;

        assert_eq!(results, vec![Ok(2), Ok(4), Ok(6)]);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.stats().flushed_batches, 1);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_deadline_with_partial_batch() {
        let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
        });
        engine.register_handler("tap", echo());
        engine.start();

        let started = Instant::now();
        let result = engine.submit("tap", 21).await;

        assert_eq!(result, Ok(42));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "flushed early: {waited:?}");
        assert!(waited < Duration::from_millis(100), "flushed late: {waited:?}");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_unregistered_type_is_unrecognized() {
        let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
            batch_size: 1,
            flush_interval: Duration::from_millis(10),
        });
        engine.start();

        let err = engine.submit("fling", 1).await.unwrap_err();
        assert_eq!(err, DeviceError::Unrecognized("fling".into()));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_rejects_unstarted_items() {
        let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig::default());
        engine.register_handler("tap", echo());
        let pending = engine.submit("tap", 1);
        engine.stop().await;

        assert!(matches!(pending.await, Err(DeviceError::Cancelled(_))));
        assert_eq!(engine.submit("tap", 2).await, Err(DeviceError::ShuttingDown));
        assert_eq!(engine.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig::default());
        assert!(engine.start());
        assert!(!engine.start());
        assert!(engine.is_running());
        engine.stop().await;
        assert!(!engine.is_running());
    }
}
