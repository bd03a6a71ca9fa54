//! Execution scheduling for device operations.
//!
//! Bounded worker threads for blocking device I/O, short-lived result
//! caching with request coalescing, and windowed event batching.

mod batch;
mod dedup;
mod thread_pool;

pub use batch::{BatchConfig, BatchEngine, BatchHandler, BatchStats, Deferred, FnHandler};
pub use dedup::{
    CacheKey, CacheStats, CacheStatus, Claim, Follower, LeaderGuard, Payload, RequestCoalescer, ResultCache,
    ResultCacheConfig,
};
pub use thread_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStats};
