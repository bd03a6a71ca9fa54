//! Streaming sessions: one per client socket.
//!
//! A session moves `Idle -> Active -> Closed`. While active it answers
//! `subscribe`/`unsubscribe`/`heartbeat` control messages and dispatches any
//! other message as a single device event. Subscribing to `screenshot`
//! starts a push task that captures frames on an interval until the topic is
//! unsubscribed or the session closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use super::event::{error_message, timestamp, DeviceEvent};
use crate::agent::CaptureOptions;
use crate::error::DeviceError;
use crate::telemetry::{self, DeviceSpan};

pub const SCREENSHOT_TOPIC: &str = "screenshot";

/// Ceiling applied to subscription intervals.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Outbound half of a client socket.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Send one text frame. An error means the socket is gone.
    async fn send_text(&self, text: String) -> Result<(), DeviceError>;
}

#[async_trait]
impl SessionSink for mpsc::Sender<String> {
    async fn send_text(&self, text: String) -> Result<(), DeviceError> {
        self.send(text)
            .await
            .map_err(|_| DeviceError::Cancelled("socket closed".into()))
    }
}

#[async_trait]
impl SessionSink for mpsc::UnboundedSender<String> {
    async fn send_text(&self, text: String) -> Result<(), DeviceError> {
        self.send(text)
            .map_err(|_| DeviceError::Cancelled("socket closed".into()))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Floor applied to subscription intervals.
    pub min_interval: Duration,
    /// Interval used when `subscribe` carries none.
    pub default_interval: Duration,
    /// Capture parameters used when `subscribe` carries none.
    pub stream_options: CaptureOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(30),
            default_interval: Duration::from_millis(50),
            stream_options: CaptureOptions::new(50, 1.0),
        }
    }
}

impl SessionConfig {
    /// Saturate a client-supplied interval in milliseconds. Negative and
    /// fractional values are accepted; non-finite ones mean "unspecified".
    pub fn clamp_interval(&self, requested: Option<f64>) -> Duration {
        requested
            .filter(|ms| ms.is_finite())
            .map(|ms| Duration::from_millis(ms.max(0.0) as u64))
            .unwrap_or(self.default_interval)
            .clamp(self.min_interval, MAX_INTERVAL.max(self.min_interval))
    }

    /// Capture options for a subscription, saturated into the supported range.
    pub fn capture_options(&self, quality: Option<f64>, scale: Option<f64>) -> CaptureOptions {
        let defaults = self.stream_options;
        let quality = quality
            .filter(|q| q.is_finite())
            .map_or(defaults.quality, |q| q.round() as u8);
        let scale = scale.map_or(defaults.scale, |s| s as f32);
        CaptureOptions::new(quality, scale).clamped()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

/// Inbound socket message.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    interval: Option<f64>,
    #[serde(default)]
    quality: Option<f64>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    data: Value,
}

struct PushTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Subscription {
    interval: Duration,
    push: Option<PushTask>,
}

/// Serializes writes and drops them once the relevant token is cancelled.
struct Outbox {
    sink: Arc<dyn SessionSink>,
    gate: tokio::sync::Mutex<()>,
}

impl Outbox {
    /// Returns `Ok(false)` if the write was suppressed by cancellation.
    async fn send(&self, token: &CancellationToken, message: Value) -> Result<bool, DeviceError> {
        let _gate = self.gate.lock().await;
        if token.is_cancelled() {
            return Ok(false);
        }
        self.sink.send_text(message.to_string()).await?;
        Ok(true)
    }

    /// Wait until no write is in progress.
    async fn quiesce(&self) {
        drop(self.gate.lock().await);
    }
}

pub struct StreamingSession {
    id: Uuid,
    device_id: String,
    config: SessionConfig,
    dispatcher: Arc<EventDispatcher>,
    outbox: Arc<Outbox>,
    state: Mutex<SessionState>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    cancel: CancellationToken,
}

impl StreamingSession {
    pub fn new(
        device_id: impl Into<String>,
        sink: Arc<dyn SessionSink>,
        dispatcher: Arc<EventDispatcher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            config,
            dispatcher,
            outbox: Arc::new(Outbox {
                sink,
                gate: tokio::sync::Mutex::new(()),
            }),
            state: Mutex::new(SessionState::Idle),
            subscriptions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Whether a push task is running for `topic`.
    pub fn is_streaming(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .get(topic)
            .and_then(|s| s.push.as_ref())
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// `Idle -> Active`. Returns `false` from any other state.
    pub fn open(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Idle {
            return false;
        }
        *state = SessionState::Active;
        tracing::info!(session_id = %self.id, device_id = %self.device_id, "streaming session opened");
        true
    }

    /// Open the session and process `inbound` until it ends, errors, or a
    /// write fails. The session is closed on return.
    pub async fn drive<S, E>(&self, inbound: S)
    where
        S: Stream<Item = Result<String, E>> + Send,
        E: fmt::Display,
    {
        let span = DeviceSpan::session(&self.id.to_string(), &self.device_id);
        async {
            self.open();
            futures::pin_mut!(inbound);
            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    next = inbound.next() => next,
                };
                match next {
                    Some(Ok(text)) => {
                        if let Err(e) = self.handle_message(&text).await {
                            tracing::debug!(error = %e, "socket write failed");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "socket read failed");
                        break;
                    }
                    None => break,
                }
            }
            self.close().await;
        }
        .instrument(span)
        .await
    }

    /// Handle one inbound text frame. `Err` only when the socket is gone.
    pub async fn handle_message(&self, text: &str) -> Result<(), DeviceError> {
        if self.state() != SessionState::Active {
            return Ok(());
        }

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                let err = DeviceError::InvalidEvent(format!("malformed message: {e}"));
                return self.reply(error_message("unknown", &err)).await;
            }
        };

        let reply = match message.kind.as_str() {
            "subscribe" => self.subscribe(&message),
            "unsubscribe" => {
                let topic = message.target.as_deref().unwrap_or(SCREENSHOT_TOPIC);
                self.unsubscribe(topic).await;
                json!({"status": "ok", "type": "unsubscribed", "target": topic})
            }
            "heartbeat" => json!({"status": "ok", "type": "heartbeat", "timestamp": timestamp()}),
            other => match DeviceEvent::from_message(other, &message.data) {
                Ok(event) => self.dispatcher.process(&self.device_id, event).await.to_message(),
                Err(err) => error_message(other, &err),
            },
        };
        self.reply(reply).await
    }

    async fn reply(&self, message: Value) -> Result<(), DeviceError> {
        self.outbox.send(&self.cancel, message).await.map(|_| ())
    }

    fn subscribe(&self, message: &ClientMessage) -> Value {
        let topic = message
            .target
            .clone()
            .unwrap_or_else(|| SCREENSHOT_TOPIC.to_string());
        let requested = self.config.clamp_interval(message.interval);

        let mut subscriptions = self.subscriptions.lock();
        let subscription = subscriptions.entry(topic.clone()).or_insert(Subscription {
            interval: requested,
            push: None,
        });

        let running = subscription
            .push
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished());
        if topic == SCREENSHOT_TOPIC && !running {
            let options = self.config.capture_options(message.quality, message.scale);
            subscription.interval = requested;
            subscription.push = Some(self.spawn_push(options, requested));
        }

        json!({
            "status": "ok",
            "type": "subscribed",
            "target": topic,
            "interval": subscription.interval.as_millis() as u64,
        })
    }

    /// Stop the push task for `topic` and drop the subscription.
    ///
    /// On return no further frames for that topic will be written.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.subscriptions.lock().remove(topic);
        let Some(subscription) = removed else {
            return false;
        };
        if let Some(push) = subscription.push {
            push.token.cancel();
            self.outbox.quiesce().await;
            tracing::debug!(session_id = %self.id, topic, "push task cancelled");
        }
        true
    }

    fn spawn_push(&self, options: CaptureOptions, interval: Duration) -> PushTask {
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let session_token = self.cancel.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let outbox = Arc::clone(&self.outbox);
        let device_id = self.device_id.clone();
        let session_id = self.id;

        let handle = tokio::spawn(
            async move {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "push task started");
                while !task_token.is_cancelled() {
                    let started = Instant::now();
                    // Let an in-flight capture finish; its result is dropped if cancelled meanwhile.
                    let result = dispatcher
                        .process(&device_id, DeviceEvent::Screenshot(options))
                        .await;
                    if task_token.is_cancelled() {
                        break;
                    }

                    telemetry::record_stream_frame(result.is_ok());
                    if let Some(err) = result.error_ref() {
                        tracing::warn!(error = %err, "stream frame failed");
                    }
                    match outbox.send(&task_token, result.to_message()).await {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "stream write failed, closing session");
                            session_token.cancel();
                            break;
                        }
                    }

                    let wait = interval.saturating_sub(started.elapsed());
                    tokio::select! {
                        _ = task_token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                tracing::debug!("push task stopped");
            }
            .instrument(tracing::debug_span!("push_task", session_id = %session_id, topic = SCREENSHOT_TOPIC)),
        );

        PushTask { token, handle }
    }

    /// `-> Closed`. Cancels every push task; no writes happen after this returns.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        self.cancel.cancel();
        let subscriptions: Vec<Subscription> =
            self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        self.outbox.quiesce().await;

        let tasks = subscriptions.iter().filter(|s| s.push.is_some()).count();
        tracing::info!(session_id = %self.id, device_id = %self.device_id, push_tasks = tasks, "streaming session closed");
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
