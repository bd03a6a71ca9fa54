//! Health evaluation over service statistics.
//!
//! Provides liveness, readiness and a full report for the router layer and
//! process supervisors.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::service::ServiceStats;
use crate::shutdown::ShutdownState;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub ready: bool,
    pub accepting_requests: bool,
    pub connections: usize,
    pub max_connections: usize,
    pub unhealthy_connections: usize,
    pub worker_backlog: usize,
    pub sessions: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Worker backlog at which the service reports itself degraded.
    pub max_worker_backlog: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_worker_backlog: 1000,
        }
    }
}

pub struct HealthChecker {
    config: HealthConfig,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
        }
    }

    /// Check readiness: accepting traffic and the backlog is under the limit.
    pub fn is_ready(&self, shutdown_state: ShutdownState, stats: &ServiceStats) -> bool {
        shutdown_state == ShutdownState::Running
            && stats.worker_pool.queued < self.config.max_worker_backlog
    }

    pub fn report(&self, shutdown_state: ShutdownState, stats: &ServiceStats) -> HealthReport {
        HealthReport {
            state: self.compute_state(shutdown_state, stats),
            ready: self.is_ready(shutdown_state, stats),
            accepting_requests: shutdown_state == ShutdownState::Running,
            connections: stats.connection_pool.total,
            max_connections: stats.connection_pool.max_size,
            unhealthy_connections: stats.connection_pool.unhealthy,
            worker_backlog: stats.worker_pool.queued,
            sessions: stats.sessions,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn compute_state(&self, shutdown_state: ShutdownState, stats: &ServiceStats) -> HealthState {
        if shutdown_state != ShutdownState::Running {
            return HealthState::Unhealthy;
        }
        if stats.worker_pool.queued >= self.config.max_worker_backlog {
            return HealthState::Degraded;
        }
        let pool = &stats.connection_pool;
        if pool.total >= pool.max_size && pool.unhealthy > 0 {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStats;
    use crate::scheduler::{BatchStats, CacheStats, WorkerPoolStats};

    fn stats(queued: usize, total: usize, max_size: usize, unhealthy: usize) -> ServiceStats {
        ServiceStats {
            connection_pool: PoolStats {
                total,
                max_size,
                unhealthy,
                ..PoolStats::default()
            },
            worker_pool: WorkerPoolStats {
                queued,
                ..WorkerPoolStats::default()
            },
            cache: CacheStats::default(),
            channels: 0,
            sessions: 0,
            batch: BatchStats::default(),
        }
    }

    #[test]
    fn test_healthy_when_running() {
        let checker = HealthChecker::default();
        let report = checker.report(ShutdownState::Running, &stats(0, 5, 10, 0));
        assert_eq!(report.state, HealthState::Healthy);
        assert!(report.ready);
        assert!(report.accepting_requests);
    }

    #[test]
    fn test_unhealthy_when_draining() {
        let checker = HealthChecker::default();
        let report = checker.report(ShutdownState::Draining, &stats(0, 0, 10, 0));
        assert_eq!(report.state, HealthState::Unhealthy);
        assert!(!report.ready);
    }

    #[test]
    fn test_degraded_on_backlog() {
        let checker = HealthChecker::new(HealthConfig {
            max_worker_backlog: 10,
        });
        let report = checker.report(ShutdownState::Running, &stats(10, 0, 10, 0));
        assert_eq!(report.state, HealthState::Degraded);
        assert!(!report.ready);
    }

    #[test]
    fn test_degraded_when_full_with_unhealthy_entries() {
        let checker = HealthChecker::default();
        let full_clean = checker.report(ShutdownState::Running, &stats(0, 10, 10, 0));
        assert_eq!(full_clean.state, HealthState::Healthy);

        let full_dirty = checker.report(ShutdownState::Running, &stats(0, 10, 10, 2));
        assert_eq!(full_dirty.state, HealthState::Degraded);
        assert!(full_dirty.ready);
    }
}
