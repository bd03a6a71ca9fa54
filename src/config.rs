//! Configuration loading from environment variables.
//!
//! All values come from `CLOUDCTL_*` environment variables with defaults.
//! Invalid values fall back to defaults without crashing; sizes and
//! intervals are floored so a bad override cannot disable a component.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `CLOUDCTL_WORKER_THREADS` | 0 | Worker threads (0 = min(cpus * 20, 200)) |
//! | `CLOUDCTL_WORKER_QUEUE` | 10000 | Max tasks waiting for a worker |
//! | `CLOUDCTL_WORKER_TIMEOUT_MS` | 10000 | Per-operation bound (0 = unbounded) |
//! | `CLOUDCTL_POOL_MAX_SIZE` | 1200 | Max pooled device connections |
//! | `CLOUDCTL_POOL_MIN_IDLE` | 10 | Connections kept by the idle sweep |
//! | `CLOUDCTL_POOL_MAX_IDLE_SECS` | 600 | Connection idle expiry |
//! | `CLOUDCTL_POOL_CLEANUP_SECS` | 120 | Idle sweep interval |
//! | `CLOUDCTL_CACHE_MAX_ENTRIES` | 500 | Max cached results |
//! | `CLOUDCTL_CACHE_TTL_MS` | 300 | Screenshot cache TTL |
//! | `CLOUDCTL_BATCH_SIZE` | 10 | Items per batch |
//! | `CLOUDCTL_BATCH_FLUSH_MS` | 50 | Max wait for a partial batch |
//! | `CLOUDCTL_CHANNEL_MAX` | 1200 | Max device channels |
//! | `CLOUDCTL_CHANNEL_IDLE_SECS` | 120 | Channel idle expiry |
//! | `CLOUDCTL_STREAM_MIN_INTERVAL_MS` | 30 | Push interval floor |
//! | `CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS` | 50 | Push interval when unspecified |
//! | `CLOUDCTL_SHUTDOWN_TIMEOUT` | 30 | Graceful drain timeout (secs) |

use std::time::Duration;

use serde::Serialize;

use crate::channel::{ChannelConfig, SessionConfig};
use crate::pool::RegistryConfig;
use crate::scheduler::{BatchConfig, ResultCacheConfig, WorkerPoolConfig};
use crate::service::ServiceConfig;
use crate::telemetry::LogConfig;

/// Flat summary of effective values, printed by `config show`.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub worker_threads: usize,
    pub worker_queue: usize,
    pub worker_timeout_ms: u64,
    pub pool_max_size: usize,
    pub pool_min_idle: usize,
    pub pool_max_idle_secs: u64,
    pub pool_cleanup_secs: u64,
    pub cache_max_entries: usize,
    pub cache_ttl_ms: u64,
    pub batch_size: usize,
    pub batch_flush_ms: u64,
    pub channel_max: usize,
    pub channel_idle_secs: u64,
    pub stream_min_interval_ms: u64,
    pub stream_default_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

/// Everything loaded from the environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub service: ServiceConfig,
    pub logging: LogConfig,
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_worker_config() -> WorkerPoolConfig {
    let num_threads = parse_usize("CLOUDCTL_WORKER_THREADS", 0);
    let queue_size = parse_usize("CLOUDCTL_WORKER_QUEUE", 10_000).max(1);
    let timeout_ms = parse_u64("CLOUDCTL_WORKER_TIMEOUT_MS", 10_000);
    WorkerPoolConfig {
        num_threads,
        queue_size,
        op_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        ..WorkerPoolConfig::default()
    }
}

fn load_registry_config() -> RegistryConfig {
    let max_size = parse_usize("CLOUDCTL_POOL_MAX_SIZE", 1200).max(1);
    let min_idle = parse_usize("CLOUDCTL_POOL_MIN_IDLE", 10).min(max_size);
    let max_idle = parse_u64("CLOUDCTL_POOL_MAX_IDLE_SECS", 600).max(1);
    let cleanup = parse_u64("CLOUDCTL_POOL_CLEANUP_SECS", 120).max(1);
    RegistryConfig {
        max_size,
        min_idle,
        max_idle: Duration::from_secs(max_idle),
        cleanup_interval: Duration::from_secs(cleanup),
    }
}

fn load_cache_config() -> ResultCacheConfig {
    let max_entries = parse_usize("CLOUDCTL_CACHE_MAX_ENTRIES", 500).max(1);
    let ttl_ms = parse_u64("CLOUDCTL_CACHE_TTL_MS", 300).max(1);
    ResultCacheConfig {
        max_entries,
        default_ttl: Duration::from_millis(ttl_ms),
    }
}

fn load_batch_config() -> BatchConfig {
    let batch_size = parse_usize("CLOUDCTL_BATCH_SIZE", 10).max(1);
    let flush_ms = parse_u64("CLOUDCTL_BATCH_FLUSH_MS", 50).max(1);
    BatchConfig {
        batch_size,
        flush_interval: Duration::from_millis(flush_ms),
    }
}

fn load_channel_config() -> ChannelConfig {
    let max_channels = parse_usize("CLOUDCTL_CHANNEL_MAX", 1200).max(1);
    let idle_secs = parse_u64("CLOUDCTL_CHANNEL_IDLE_SECS", 120).max(1);
    ChannelConfig {
        max_channels,
        max_idle: Duration::from_secs(idle_secs),
        ..ChannelConfig::default()
    }
}

fn load_session_config() -> SessionConfig {
    let min_ms = parse_u64("CLOUDCTL_STREAM_MIN_INTERVAL_MS", 30).max(1);
    let default_ms = parse_u64("CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS", 50).max(min_ms);
    SessionConfig {
        min_interval: Duration::from_millis(min_ms),
        default_interval: Duration::from_millis(default_ms),
        ..SessionConfig::default()
    }
}

/// Load all configuration from environment variables.
pub fn load() -> EnvConfig {
    let shutdown_secs = parse_u64("CLOUDCTL_SHUTDOWN_TIMEOUT", 30).max(1);

    EnvConfig {
        service: ServiceConfig {
            workers: load_worker_config(),
            registry: load_registry_config(),
            cache: load_cache_config(),
            batch: load_batch_config(),
            channels: load_channel_config(),
            session: load_session_config(),
            shutdown_timeout: Duration::from_secs(shutdown_secs),
        },
        logging: LogConfig::from_env(),
    }
}

impl EnvConfig {
    pub fn effective_config(&self) -> EffectiveConfig {
        let s = &self.service;
        EffectiveConfig {
            worker_threads: if s.workers.num_threads == 0 {
                WorkerPoolConfig::io_bound_threads()
            } else {
                s.workers.num_threads
            },
            worker_queue: s.workers.queue_size,
            worker_timeout_ms: s
                .workers
                .op_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
            pool_max_size: s.registry.max_size,
            pool_min_idle: s.registry.min_idle,
            pool_max_idle_secs: s.registry.max_idle.as_secs(),
            pool_cleanup_secs: s.registry.cleanup_interval.as_secs(),
            cache_max_entries: s.cache.max_entries,
            cache_ttl_ms: s.cache.default_ttl.as_millis() as u64,
            batch_size: s.batch.batch_size,
            batch_flush_ms: s.batch.flush_interval.as_millis() as u64,
            channel_max: s.channels.max_channels,
            channel_idle_secs: s.channels.max_idle.as_secs(),
            stream_min_interval_ms: s.session.min_interval.as_millis() as u64,
            stream_default_interval_ms: s.session.default_interval.as_millis() as u64,
            shutdown_timeout_secs: s.shutdown_timeout.as_secs(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests across modules.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "CLOUDCTL_WORKER_THREADS",
        "CLOUDCTL_WORKER_QUEUE",
        "CLOUDCTL_WORKER_TIMEOUT_MS",
        "CLOUDCTL_POOL_MAX_SIZE",
        "CLOUDCTL_POOL_MIN_IDLE",
        "CLOUDCTL_POOL_MAX_IDLE_SECS",
        "CLOUDCTL_POOL_CLEANUP_SECS",
        "CLOUDCTL_CACHE_MAX_ENTRIES",
        "CLOUDCTL_CACHE_TTL_MS",
        "CLOUDCTL_BATCH_SIZE",
        "CLOUDCTL_BATCH_FLUSH_MS",
        "CLOUDCTL_CHANNEL_MAX",
        "CLOUDCTL_CHANNEL_IDLE_SECS",
        "CLOUDCTL_STREAM_MIN_INTERVAL_MS",
        "CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS",
        "CLOUDCTL_SHUTDOWN_TIMEOUT",
        "CLOUDCTL_LOG_FORMAT",
        "CLOUDCTL_LOG_LEVEL",
        "CLOUDCTL_LOG_FILE",
    ];

    pub(crate) fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        let cfg = load().service;
        assert_eq!(cfg.workers.num_threads, 0);
        assert_eq!(cfg.workers.queue_size, 10_000);
        assert_eq!(cfg.workers.op_timeout, Some(Duration::from_secs(10)));
        assert_eq!(cfg.registry.max_size, 1200);
        assert_eq!(cfg.registry.min_idle, 10);
        assert_eq!(cfg.registry.max_idle, Duration::from_secs(600));
        assert_eq!(cfg.registry.cleanup_interval, Duration::from_secs(120));
        assert_eq!(cfg.cache.max_entries, 500);
        assert_eq!(cfg.cache.default_ttl, Duration::from_millis(300));
        assert_eq!(cfg.batch.batch_size, 10);
        assert_eq!(cfg.batch.flush_interval, Duration::from_millis(50));
        assert_eq!(cfg.channels.max_channels, 1200);
        assert_eq!(cfg.channels.max_idle, Duration::from_secs(120));
        assert_eq!(cfg.session.min_interval, Duration::from_millis(30));
        assert_eq!(cfg.session.default_interval, Duration::from_millis(50));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("CLOUDCTL_POOL_MAX_SIZE", "1000");
        std::env::set_var("CLOUDCTL_CACHE_TTL_MS", "150");
        std::env::set_var("CLOUDCTL_WORKER_THREADS", "16");
        std::env::set_var("CLOUDCTL_WORKER_TIMEOUT_MS", "0");
        let cfg = load().service;
        assert_eq!(cfg.registry.max_size, 1000);
        assert_eq!(cfg.cache.default_ttl, Duration::from_millis(150));
        assert_eq!(cfg.workers.num_threads, 16);
        assert_eq!(cfg.workers.op_timeout, None);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("CLOUDCTL_POOL_MAX_SIZE", "lots");
        std::env::set_var("CLOUDCTL_BATCH_FLUSH_MS", "-5");
        let cfg = load().service;
        assert_eq!(cfg.registry.max_size, 1200);
        assert_eq!(cfg.batch.flush_interval, Duration::from_millis(50));
        clear_env_vars();
    }

    #[test]
    fn test_floors_applied() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        std::env::set_var("CLOUDCTL_POOL_MAX_SIZE", "0");
        std::env::set_var("CLOUDCTL_POOL_MIN_IDLE", "50");
        std::env::set_var("CLOUDCTL_CACHE_TTL_MS", "0");
        std::env::set_var("CLOUDCTL_STREAM_MIN_INTERVAL_MS", "100");
        std::env::set_var("CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS", "20");
        let cfg = load().service;
        assert_eq!(cfg.registry.max_size, 1);
        assert_eq!(cfg.registry.min_idle, 1, "min_idle never exceeds max_size");
        assert_eq!(cfg.cache.default_ttl, Duration::from_millis(1));
        assert_eq!(cfg.session.default_interval, Duration::from_millis(100));
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_resolves_auto_threads() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        let eff = load().effective_config();
        assert_eq!(eff.worker_threads, WorkerPoolConfig::io_bound_threads());
        assert_eq!(eff.worker_timeout_ms, 10_000);
        assert_eq!(eff.cache_ttl_ms, 300);
        assert_eq!(eff.shutdown_timeout_secs, 30);
    }
}
