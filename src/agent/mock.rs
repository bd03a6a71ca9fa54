//! In-process mock devices for stress runs and tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{CaptureOptions, DeviceAgent, DeviceConnector};
use crate::directory::DeviceRecord;
use crate::error::AgentError;

const GREY: u8 = 0x80;

/// Timing and shape of mock devices.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Blocking delay per agent call.
    pub latency: Duration,
    /// Blocking delay per connect (handshake).
    pub connect_latency: Duration,
    /// Grey pixel bytes per encoded frame.
    pub frame_size: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            connect_latency: Duration::ZERO,
            frame_size: 1024,
        }
    }
}

/// A device that answers every call locally.
///
/// Frames are a fake JPEG of solid grey. Each capture embeds a sequence
/// number, so two captures never produce identical bytes.
pub struct MockAgent {
    device_id: String,
    behavior: MockBehavior,
    failing: AtomicBool,
    frame_seq: AtomicU64,
    captures: Mutex<Vec<CaptureOptions>>,
    taps: AtomicUsize,
    swipes: AtomicUsize,
    texts: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new(device_id: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            device_id: device_id.into(),
            behavior,
            failing: AtomicBool::new(false),
            frame_seq: AtomicU64::new(0),
            captures: Mutex::new(Vec::new()),
            taps: AtomicUsize::new(0),
            swipes: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Make every subsequent call fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().len()
    }

    /// Options of every capture, oldest first.
    pub fn captured_options(&self) -> Vec<CaptureOptions> {
        self.captures.lock().clone()
    }

    pub fn tap_count(&self) -> usize {
        self.taps.load(Ordering::SeqCst)
    }

    pub fn swipe_count(&self) -> usize {
        self.swipes.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().clone()
    }

    fn call(&self) -> Result<(), AgentError> {
        if !self.behavior.latency.is_zero() {
            thread::sleep(self.behavior.latency);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Transport(format!(
                "mock device {} is failing",
                self.device_id
            )));
        }
        Ok(())
    }
}

impl DeviceAgent for MockAgent {
    fn capture_frame(&self, options: &CaptureOptions) -> Result<Vec<u8>, AgentError> {
        self.call()?;
        self.captures.lock().push(*options);
        let seq = self.frame_seq.fetch_add(1, Ordering::SeqCst);

        let mut frame = Vec::with_capacity(self.behavior.frame_size + 16);
        frame.extend_from_slice(&[0xFF, 0xD8]);
        frame.push(options.quality);
        frame.push((options.scale * 100.0).round() as u8);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.resize(frame.len() + self.behavior.frame_size, GREY);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        Ok(frame)
    }

    fn tap(&self, _x: i32, _y: i32) -> Result<(), AgentError> {
        self.call()?;
        self.taps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn swipe(
        &self,
        _x1: i32,
        _y1: i32,
        _x2: i32,
        _y2: i32,
        _duration: Duration,
    ) -> Result<(), AgentError> {
        self.call()?;
        self.swipes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_text(&self, text: &str) -> Result<(), AgentError> {
        self.call()?;
        self.texts.lock().push(text.to_string());
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<(), AgentError> {
        self.call()?;
        self.keys.lock().push(key.to_string());
        Ok(())
    }
}

/// Connector producing [`MockAgent`]s, remembering the latest one per device.
pub struct MockConnector {
    behavior: MockBehavior,
    agents: DashMap<String, Arc<MockAgent>>,
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            agents: DashMap::new(),
            refused: Mutex::new(HashSet::new()),
            connects: AtomicUsize::new(0),
        }
    }

    /// Refuse (or stop refusing) handshakes for `device_id`.
    pub fn set_refused(&self, device_id: &str, refused: bool) {
        let mut set = self.refused.lock();
        if refused {
            set.insert(device_id.to_string());
        } else {
            set.remove(device_id);
        }
    }

    /// Total successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most recently built agent for `device_id`.
    pub fn agent(&self, device_id: &str) -> Option<Arc<MockAgent>> {
        self.agents.get(device_id).map(|a| Arc::clone(a.value()))
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(MockBehavior::default())
    }
}

impl DeviceConnector for MockConnector {
    fn connect(&self, record: &DeviceRecord) -> Result<Arc<dyn DeviceAgent>, AgentError> {
        if !self.behavior.connect_latency.is_zero() {
            thread::sleep(self.behavior.connect_latency);
        }
        if self.refused.lock().contains(&record.udid) {
            return Err(AgentError::Handshake {
                address: record.address(),
                reason: "connection refused".to_string(),
            });
        }

        let agent = Arc::new(MockAgent::new(record.udid.clone(), self.behavior.clone()));
        self.agents.insert(record.udid.clone(), Arc::clone(&agent));
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_distinct_per_capture() {
        let agent = MockAgent::new("D", MockBehavior::default());
        let opts = CaptureOptions::new(50, 0.5);
        let a = agent.capture_frame(&opts).unwrap();
        let b = agent.capture_frame(&opts).unwrap();
        assert_ne!(a, b);
        assert_eq!(&a[..2], &[0xFF, 0xD8]);
        assert_eq!(agent.capture_count(), 2);
    }

    #[test]
    fn test_failure_injection() {
        let agent = MockAgent::new("D", MockBehavior::default());
        agent.set_failing(true);
        assert!(agent.tap(1, 2).is_err());
        agent.set_failing(false);
        agent.tap(1, 2).unwrap();
        assert_eq!(agent.tap_count(), 1);
    }

    #[test]
    fn test_refused_handshake() {
        let connector = MockConnector::default();
        let record = DeviceRecord::new("D", "10.0.0.9", 7912);
        connector.set_refused("D", true);
        assert!(matches!(
            connector.connect(&record),
            Err(AgentError::Handshake { .. })
        ));
        connector.set_refused("D", false);
        assert!(connector.connect(&record).is_ok());
        assert!(connector.agent("D").is_some());
    }
}
