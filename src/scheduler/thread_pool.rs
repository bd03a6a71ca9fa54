//! Bounded OS-thread pool for blocking device operations.
//!
//! Device round-trips (frame capture, input injection, handshakes) block on
//! the network for far longer than they compute, so the pool is sized well
//! above the core count but capped to keep thread count independent of the
//! number of attached devices. Results come back to the async side through
//! a oneshot channel, so the scheduler threads never block.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::DeviceError;
use crate::telemetry;

/// Threads per core for I/O-bound device work.
const THREADS_PER_CORE: usize = 20;
/// Hard cap on worker threads regardless of core count.
const MAX_THREADS: usize = 200;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (0 = auto: `min(cpus * 20, 200)`).
    pub num_threads: usize,
    /// Maximum number of tasks waiting for a thread.
    pub queue_size: usize,
    /// Thread stack size in bytes (0 = platform default).
    pub stack_size: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// How long an idle worker parks before re-checking for shutdown.
    pub idle_timeout_ms: u64,
    /// Upper bound an awaiting caller waits for one operation (`None` = unbounded).
    pub op_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0, // Auto-detect
            queue_size: 10_000,
            stack_size: 0,
            thread_name_prefix: "device-worker".to_string(),
            idle_timeout_ms: 100,
            op_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl WorkerPoolConfig {
    /// Create config with a specific thread count.
    pub fn with_threads(count: usize) -> Self {
        Self {
            num_threads: count.max(1),
            ..Default::default()
        }
    }

    /// Thread count for I/O-bound device work on this machine.
    pub fn io_bound_threads() -> usize {
        (num_cpus::get().max(1) * THREADS_PER_CORE).min(MAX_THREADS)
    }

    fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 {
            Self::io_bound_threads()
        } else {
            self.num_threads
        }
    }
}

/// A unit of work executed by a worker thread.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Point-in-time statistics for the pool.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub threads: usize,
    pub active: usize,
    pub queued: usize,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub avg_exec_time_us: u64,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    executed: AtomicU64,
    failed: AtomicU64,
    avg_exec_us: AtomicU64,
}

impl Shared {
    fn record_exec(&self, exec_time: Duration) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        // Rolling average of execution time
        let exec_us = exec_time.as_micros() as u64;
        let _ = self
            .avg_exec_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |avg| {
                Some(if avg == 0 { exec_us } else { (avg * 9 + exec_us) / 10 })
            });
    }
}

/// Fixed-size pool of OS threads running blocking device operations.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Create a new pool and start its worker threads.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerPoolError> {
        let threads = config.resolved_threads();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_size.min(1024))),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            avg_exec_us: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, id));
            if config.stack_size > 0 {
                builder = builder.stack_size(config.stack_size);
            }
            let worker_shared = Arc::clone(&shared);
            let idle_timeout = Duration::from_millis(config.idle_timeout_ms.max(1));
            let spawned = builder.spawn(move || Self::worker_loop(&worker_shared, idle_timeout));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Release whatever already started before bailing out.
                    shared.shutdown.store(true, Ordering::SeqCst);
                    shared.available.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(WorkerPoolError::ThreadSpawnFailed(e.to_string()));
                }
            }
        }

        tracing::info!(
            threads,
            cpus = num_cpus::get(),
            queue_size = config.queue_size,
            "worker pool started"
        );

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            threads,
            config,
        })
    }

    /// Run `op` on a worker thread and await its result.
    ///
    /// Errors (and panics) raised by `op` come back as a failed result; the
    /// pool never retries. If the implicit per-operation bound elapses the
    /// caller gets [`DeviceError::Timeout`] while the operation is left to
    /// finish on its thread, its result discarded.
    pub async fn run<F, T, E>(&self, op: F) -> Result<T, DeviceError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<DeviceError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(op)) {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(DeviceError::Unavailable("worker task panicked".into())),
            };
            if result.is_err() {
                shared.failed.fetch_add(1, Ordering::Relaxed);
            }
            // Receiver may be gone if the caller timed out or was cancelled.
            let _ = tx.send(result);
        }))?;

        let received = match self.config.op_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| DeviceError::Timeout(limit))?,
            None => rx.await,
        };
        received.unwrap_or_else(|_| Err(DeviceError::Cancelled("worker dropped the task".into())))
    }

    /// Submit `op` without awaiting it.
    ///
    /// Only submission failures are returned. Failures of `op` itself are
    /// observable through logs and metrics alone.
    pub fn spawn_detached<F, E>(&self, label: &'static str, op: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<DeviceError> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            let failure = match panic::catch_unwind(AssertUnwindSafe(op)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.into()),
                Err(_) => Some(DeviceError::Unavailable("worker task panicked".into())),
            };
            if let Some(err) = failure {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(op = label, error = %err, "detached worker task failed");
            }
        }))
    }

    fn submit(&self, task: Task) -> Result<(), DeviceError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(WorkerPoolError::PoolShutdown.into());
        }

        let depth = {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.config.queue_size {
                return Err(WorkerPoolError::QueueFull.into());
            }
            queue.push_back(task);
            queue.len()
        };
        telemetry::record_worker_queue_depth(depth);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Worker thread main loop. Keeps draining the queue after shutdown is
    /// signalled and exits only once it is empty.
    fn worker_loop(shared: &Shared, idle_timeout: Duration) {
        loop {
            let task = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break Some(task);
                    }
                    if shared.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    shared.available.wait_for(&mut queue, idle_timeout);
                }
            };

            let Some(task) = task else {
                break;
            };

            shared.active.fetch_add(1, Ordering::SeqCst);
            let start = Instant::now();
            task();
            let exec_time = start.elapsed();
            shared.active.fetch_sub(1, Ordering::SeqCst);

            shared.record_exec(exec_time);
            telemetry::record_worker_task(exec_time);
        }
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.threads
    }

    /// Tasks waiting for a free thread.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Check if the pool is shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Get current statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            threads: self.threads,
            active: self.shared.active.load(Ordering::SeqCst),
            queued: self.queued(),
            tasks_executed: self.shared.executed.load(Ordering::Relaxed),
            tasks_failed: self.shared.failed.load(Ordering::Relaxed),
            avg_exec_time_us: self.shared.avg_exec_us.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, let queued and in-flight tasks finish, then
    /// join the worker threads. Blocking; call from a blocking context.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // A task holding the last reference may drop the pool from a worker.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        tracing::info!(threads = self.threads, "worker pool drained");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.lock().is_empty() {
            self.shutdown();
        }
    }
}

/// Errors for worker pool operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("worker queue is full")]
    QueueFull,

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),
}

impl From<WorkerPoolError> for DeviceError {
    fn from(err: WorkerPoolError) -> Self {
        match err {
            WorkerPoolError::PoolShutdown => DeviceError::ShuttingDown,
            WorkerPoolError::QueueFull => DeviceError::QueueFull,
            WorkerPoolError::ThreadSpawnFailed(msg) => DeviceError::Unavailable(msg),
        }
    }
}
