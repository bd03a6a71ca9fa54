//! Graceful shutdown coordination.
//!
//! Device operations register with [`ShutdownCoordinator::track`] while they
//! run. Once shutdown starts no new operation is admitted, and `initiate`
//! waits (bounded) for the admitted ones to finish.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: usize },
}

struct Inner {
    state: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ShutdownState::Running as u8),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Admit one operation. Fails with `ShuttingDown` once draining starts.
    pub fn track(&self) -> Result<ShutdownGuard, DeviceError> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        // Re-check after incrementing so `initiate` cannot miss us.
        if !self.is_accepting() {
            self.release();
            return Err(DeviceError::ShuttingDown);
        }
        Ok(ShutdownGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting work and wait up to `timeout` for in-flight work.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        let _ = self.inner.state.compare_exchange(
            ShutdownState::Running as u8,
            ShutdownState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        let drained = tokio::time::timeout(timeout, self.wait_for_drain()).await;
        self.inner
            .state
            .store(ShutdownState::Stopped as u8, Ordering::SeqCst);

        match drained {
            Ok(()) => ShutdownResult::Complete,
            Err(_) => ShutdownResult::Timeout {
                remaining: self.in_flight_count(),
            },
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        release(&self.inner);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn release(inner: &Inner) {
    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.drained.notify_waiters();
    }
}

/// Held by an admitted operation; releases its slot on drop.
pub struct ShutdownGuard {
    inner: Arc<Inner>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        release(&self.inner);
    }
}
