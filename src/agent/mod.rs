//! Device-agent capability traits.
//!
//! An agent is the opaque, blocking client for one device's on-device
//! automation service. Every call may block on network I/O and may fail
//! with an [`AgentError`]; callers run them on the worker pool.

mod mock;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::DeviceRecord;
use crate::error::AgentError;

pub use mock::{MockAgent, MockBehavior, MockConnector};

pub const MIN_QUALITY: u8 = 20;
pub const MAX_QUALITY: u8 = 90;
pub const MIN_SCALE: f32 = 0.2;
pub const MAX_SCALE: f32 = 1.0;

/// Frame capture parameters. Both affect the encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// JPEG quality.
    pub quality: u8,
    /// Resize factor applied before encoding.
    pub scale: f32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            quality: 40,
            scale: 0.4,
        }
    }
}

impl CaptureOptions {
    pub fn new(quality: u8, scale: f32) -> Self {
        Self { quality, scale }
    }

    /// Clamp into the supported range and round scale to the two decimals
    /// the cache key carries. A non-finite scale falls back to the default.
    pub fn clamped(self) -> Self {
        let scale = if self.scale.is_finite() {
            ((self.scale.clamp(MIN_SCALE, MAX_SCALE) * 100.0).round() / 100.0)
                .clamp(MIN_SCALE, MAX_SCALE)
        } else {
            Self::default().scale
        };
        Self {
            quality: self.quality.clamp(MIN_QUALITY, MAX_QUALITY),
            scale,
        }
    }
}

/// Blocking client for a single device.
pub trait DeviceAgent: Send + Sync {
    /// Capture and encode the current screen.
    fn capture_frame(&self, options: &CaptureOptions) -> Result<Vec<u8>, AgentError>;

    fn tap(&self, x: i32, y: i32) -> Result<(), AgentError>;

    fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration: Duration)
        -> Result<(), AgentError>;

    fn send_text(&self, text: &str) -> Result<(), AgentError>;

    /// Press a key by its agent-side name (`home`, `back`, `enter`...).
    fn press_key(&self, key: &str) -> Result<(), AgentError>;
}

/// Builds agents for directory records. May block on a handshake.
pub trait DeviceConnector: Send + Sync {
    fn connect(&self, record: &DeviceRecord) -> Result<Arc<dyn DeviceAgent>, AgentError>;
}
