//! Routes typed events to device operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use super::event::{DeviceEvent, EventPayload, EventResult};
use super::pool::{ChannelHandle, ChannelPool};
use crate::agent::CaptureOptions;
use crate::error::DeviceError;
use crate::scheduler::{CacheKey, CacheStatus, Payload, ResultCache, WorkerPool};
use crate::telemetry::{self, DeviceSpan, SpanExt};

/// Resolves channels and runs events against their devices.
///
/// Agent calls run on the worker pool. A device-level failure marks the
/// connection unhealthy so the next event rebuilds it. Failures are
/// returned inside the [`EventResult`], never raised.
pub struct EventDispatcher {
    channels: Arc<ChannelPool>,
    workers: Arc<WorkerPool>,
    cache: Arc<ResultCache>,
    frame_ttl: Duration,
}

impl EventDispatcher {
    pub fn new(
        channels: Arc<ChannelPool>,
        workers: Arc<WorkerPool>,
        cache: Arc<ResultCache>,
        frame_ttl: Duration,
    ) -> Self {
        Self {
            channels,
            workers,
            cache,
            frame_ttl,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.channels
    }

    pub async fn process(&self, device_id: &str, event: DeviceEvent) -> EventResult {
        let kind = event.kind();
        let span = DeviceSpan::new(kind.as_str(), device_id);
        let started = Instant::now();

        let result = self
            .process_inner(device_id, event)
            .instrument(span.clone())
            .await;

        let latency = started.elapsed();
        span.record("latency_ms", latency.as_millis() as u64);
        span.record_result(&result);
        if let Ok(EventPayload::Frame { cache, .. }) = &result {
            span.record("cache", cache.as_str());
        }
        telemetry::record_operation(kind.as_str(), latency, result.is_ok());

        EventResult {
            kind,
            outcome: result,
        }
    }

    async fn process_inner(
        &self,
        device_id: &str,
        event: DeviceEvent,
    ) -> Result<EventPayload, DeviceError> {
        if let DeviceEvent::Input { text } = &event {
            if text.is_empty() {
                return Ok(EventPayload::Ack);
            }
        }

        let kind = event.kind();
        let channel = self
            .channels
            .acquire(device_id)
            .await?
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;

        let result = self.run(&channel, event).await;

        if let Err(e) = &result {
            if e.is_device_fault() {
                let registry = self.channels.registry();
                registry
                    .mark_unhealthy(device_id, channel.connection.generation())
                    .await;
                self.cache.invalidate_device(device_id);
            }
        }
        self.channels.record(device_id, kind, result.is_ok());
        result
    }

    async fn run(&self, channel: &ChannelHandle, event: DeviceEvent) -> Result<EventPayload, DeviceError> {
        let agent = channel.connection.agent();
        match event {
            DeviceEvent::Screenshot(options) => {
                let (bytes, cache) = self.capture(channel, options.clamped()).await?;
                Ok(EventPayload::Frame { bytes, cache })
            }
            DeviceEvent::Touch { x, y } => {
                self.workers.run(move || agent.tap(x, y)).await?;
                Ok(EventPayload::Ack)
            }
            DeviceEvent::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration,
            } => {
                self.workers
                    .run(move || agent.swipe(x1, y1, x2, y2, duration))
                    .await?;
                Ok(EventPayload::Ack)
            }
            DeviceEvent::Input { text } => {
                self.workers.run(move || agent.send_text(&text)).await?;
                Ok(EventPayload::Ack)
            }
            DeviceEvent::Key { key } => {
                self.workers.run(move || agent.press_key(&key)).await?;
                Ok(EventPayload::Ack)
            }
        }
    }

    async fn capture(
        &self,
        channel: &ChannelHandle,
        options: CaptureOptions,
    ) -> Result<(Payload, CacheStatus), DeviceError> {
        let key = CacheKey::screenshot(&channel.device_id, &options);
        let agent = channel.connection.agent();
        let workers = &self.workers;
        self.cache
            .get_or_compute(key, self.frame_ttl, async move {
                let frame = workers.run(move || agent.capture_frame(&options)).await?;
                Ok(Payload::from(frame))
            })
            .await
    }
}
