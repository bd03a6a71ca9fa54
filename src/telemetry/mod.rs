//! Structured logging, span helpers and metrics for the device-access core.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_batch_flush, record_cache_lookup, record_operation,
    record_registry_event, record_registry_size, record_stream_frame, record_worker_queue_depth,
    record_worker_task,
};
pub use spans::{DeviceSpan, SpanExt};
