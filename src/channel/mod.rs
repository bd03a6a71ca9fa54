//! Device channels, event dispatch and streaming sessions.

mod dispatcher;
mod event;
mod pool;
mod session;

pub use dispatcher::EventDispatcher;
pub use event::{
    android_key_name, DeviceEvent, EventKind, EventPayload, EventResult, DEFAULT_SWIPE_DURATION,
    MAX_SWIPE_DURATION, MIN_SWIPE_DURATION,
};
pub use pool::{ChannelConfig, ChannelHandle, ChannelPool, EventRecord};
pub use session::{
    SessionConfig, SessionSink, SessionState, StreamingSession, SCREENSHOT_TOPIC,
};
