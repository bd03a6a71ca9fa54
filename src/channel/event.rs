//! Typed device events and their structured results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::CaptureOptions;
use crate::error::DeviceError;
use crate::scheduler::{CacheStatus, Payload};

pub const MIN_SWIPE_DURATION: Duration = Duration::from_millis(50);
pub const MAX_SWIPE_DURATION: Duration = Duration::from_millis(2000);
pub const DEFAULT_SWIPE_DURATION: Duration = Duration::from_millis(200);

/// Closed set of events a device can process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Screenshot,
    Touch,
    Swipe,
    Input,
    Keyevent,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Screenshot,
        EventKind::Touch,
        EventKind::Swipe,
        EventKind::Input,
        EventKind::Keyevent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Touch => "touch",
            Self::Swipe => "swipe",
            Self::Input => "input",
            Self::Keyevent => "keyevent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DeviceError::Unrecognized(s.to_string()))
    }
}

/// An event with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Screenshot(CaptureOptions),
    Touch {
        x: i32,
        y: i32,
    },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration: Duration,
    },
    Input {
        text: String,
    },
    /// `key` is already the agent-side name; see [`android_key_name`].
    Key {
        key: String,
    },
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Screenshot(_) => EventKind::Screenshot,
            Self::Touch { .. } => EventKind::Touch,
            Self::Swipe { .. } => EventKind::Swipe,
            Self::Input { .. } => EventKind::Input,
            Self::Key { .. } => EventKind::Keyevent,
        }
    }

    /// Swipe with its duration clamped to the supported range.
    pub fn swipe(x1: i32, y1: i32, x2: i32, y2: i32, duration: Duration) -> Self {
        Self::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration: duration.clamp(MIN_SWIPE_DURATION, MAX_SWIPE_DURATION),
        }
    }

    /// Key event from a browser or Android key name.
    pub fn key(name: &str) -> Self {
        Self::Key {
            key: android_key_name(name),
        }
    }

    /// Parse a socket message's `type` and `data` fields.
    ///
    /// Swipe `duration` is in seconds. Missing input text means an empty string.
    pub fn from_message(kind: &str, data: &Value) -> Result<Self, DeviceError> {
        let kind: EventKind = kind.parse()?;
        let int = |field: &str| data.get(field).and_then(Value::as_f64).map(|v| v as i32);

        match kind {
            EventKind::Screenshot => {
                let defaults = CaptureOptions::default();
                let quality = data
                    .get("quality")
                    .and_then(Value::as_u64)
                    .map(|q| q.min(u8::MAX as u64) as u8)
                    .unwrap_or(defaults.quality);
                let scale = data
                    .get("scale")
                    .and_then(Value::as_f64)
                    .map(|s| s as f32)
                    .unwrap_or(defaults.scale);
                Ok(Self::Screenshot(CaptureOptions::new(quality, scale)))
            }
            EventKind::Touch => match (int("x"), int("y")) {
                (Some(x), Some(y)) => Ok(Self::Touch { x, y }),
                _ => Err(DeviceError::InvalidEvent("missing coordinates".into())),
            },
            EventKind::Swipe => match (int("x1"), int("y1"), int("x2"), int("y2")) {
                (Some(x1), Some(y1), Some(x2), Some(y2)) => {
                    let duration = data
                        .get("duration")
                        .and_then(Value::as_f64)
                        .filter(|secs| secs.is_finite() && *secs >= 0.0)
                        .map(|secs| Duration::from_secs_f64(secs.min(60.0)))
                        .unwrap_or(DEFAULT_SWIPE_DURATION);
                    Ok(Self::swipe(x1, y1, x2, y2, duration))
                }
                _ => Err(DeviceError::InvalidEvent("missing coordinates".into())),
            },
            EventKind::Input => Ok(Self::Input {
                text: data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            EventKind::Keyevent => match data.get("key").and_then(Value::as_str) {
                Some(key) if !key.is_empty() => Ok(Self::key(key)),
                _ => Err(DeviceError::InvalidEvent("missing key".into())),
            },
        }
    }
}

/// Map browser key names to agent key names. Unknown names are lowercased.
pub fn android_key_name(key: &str) -> String {
    let mapped = match key {
        "Backspace" => "del",
        "Delete" => "forward_del",
        "Escape" => "back",
        "ArrowUp" => "dpad_up",
        "ArrowDown" => "dpad_down",
        "ArrowLeft" => "dpad_left",
        "ArrowRight" => "dpad_right",
        other => return other.to_lowercase(),
    };
    mapped.to_string()
}

/// Successful event output.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Ack,
    Frame { bytes: Payload, cache: CacheStatus },
}

/// Outcome of one dispatched event. Never raised; inspect [`status`](Self::status).
#[derive(Debug, Clone, PartialEq)]
pub struct EventResult {
    pub kind: EventKind,
    pub outcome: Result<EventPayload, DeviceError>,
}

impl EventResult {
    pub fn ok(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            outcome: Ok(payload),
        }
    }

    pub fn error(kind: EventKind, err: DeviceError) -> Self {
        Self {
            kind,
            outcome: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn status(&self) -> &'static str {
        if self.is_ok() {
            "ok"
        } else {
            "error"
        }
    }

    pub fn error_ref(&self) -> Option<&DeviceError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<EventPayload, DeviceError> {
        self.outcome
    }

    /// Socket reply: `{status, type, ...payload}`. Frames are base64 JPEG.
    pub fn to_message(&self) -> Value {
        match &self.outcome {
            Ok(EventPayload::Ack) => json!({
                "status": "ok",
                "type": self.kind.as_str(),
            }),
            Ok(EventPayload::Frame { bytes, cache }) => json!({
                "status": "ok",
                "type": self.kind.as_str(),
                "encoding": "base64",
                "data": BASE64.encode(bytes),
                "cache": cache.as_str(),
                "timestamp": timestamp(),
            }),
            Err(err) => error_message(self.kind.as_str(), err),
        }
    }
}

/// Error reply for a message of type `kind`.
pub fn error_message(kind: &str, err: &DeviceError) -> Value {
    json!({
        "status": "error",
        "type": kind,
        "error": err.kind(),
        "message": err.to_string(),
    })
}

/// Wall-clock seconds with millisecond precision.
pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_kind_parse() {
        assert_eq!("keyevent".parse::<EventKind>().unwrap(), EventKind::Keyevent);
        assert_eq!(
            "fling".parse::<EventKind>().unwrap_err(),
            DeviceError::Unrecognized("fling".into())
        );
    }

    #[test]
    fn test_key_names() {
        assert_eq!(android_key_name("Backspace"), "del");
        assert_eq!(android_key_name("ArrowLeft"), "dpad_left");
        assert_eq!(android_key_name("Escape"), "back");
        assert_eq!(android_key_name("HOME"), "home");
        assert_eq!(android_key_name("WAKEUP"), "wakeup");
        assert_eq!(android_key_name("Enter"), "enter");
        assert_eq!(android_key_name("VOLUME_UP"), "volume_up");
    }

    #[test]
    fn test_touch_requires_coordinates() {
        let err = DeviceEvent::from_message("touch", &json!({"x": 10})).unwrap_err();
        assert_eq!(err, DeviceError::InvalidEvent("missing coordinates".into()));
        assert_eq!(
            DeviceEvent::from_message("touch", &json!({"x": 10, "y": 20.7})).unwrap(),
            DeviceEvent::Touch { x: 10, y: 20 }
        );
    }

    #[test]
    fn test_swipe_duration_clamped() {
        let long = DeviceEvent::from_message(
            "swipe",
            &json!({"x1": 0, "y1": 0, "x2": 100, "y2": 100, "duration": 9.0}),
        )
        .unwrap();
        assert!(matches!(long, DeviceEvent::Swipe { duration, .. } if duration == MAX_SWIPE_DURATION));

        let default =
            DeviceEvent::from_message("swipe", &json!({"x1": 0, "y1": 0, "x2": 1, "y2": 1})).unwrap();
        assert!(
            matches!(default, DeviceEvent::Swipe { duration, .. } if duration == DEFAULT_SWIPE_DURATION)
        );

        let short = DeviceEvent::swipe(0, 0, 1, 1, Duration::from_millis(1));
        assert!(matches!(short, DeviceEvent::Swipe { duration, .. } if duration == MIN_SWIPE_DURATION));
    }

    #[test]
    fn test_frame_message_is_base64() {
        let result = EventResult::ok(
            EventKind::Screenshot,
            EventPayload::Frame {
                bytes: Arc::from(&b"\xFF\xD8jpeg"[..]),
                cache: CacheStatus::Dedup,
            },
        );
        let msg = result.to_message();
        assert_eq!(msg["status"], "ok");
        assert_eq!(msg["type"], "screenshot");
        assert_eq!(msg["encoding"], "base64");
        assert_eq!(msg["cache"], "DEDUP");
        let decoded = BASE64.decode(msg["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, b"\xFF\xD8jpeg");
    }

    #[test]
    fn test_error_message_shape() {
        let result = EventResult::error(EventKind::Touch, DeviceError::NotFound("D".into()));
        assert_eq!(result.status(), "error");
        let msg = result.to_message();
        assert_eq!(msg["type"], "touch");
        assert_eq!(msg["error"], "not_found");
    }
}
