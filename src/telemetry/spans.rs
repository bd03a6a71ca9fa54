//! Span helpers for device operations.

use tracing::{info_span, Span};

/// Extension trait for recording outcomes on spans.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for device operation spans.
pub struct DeviceSpan;

impl DeviceSpan {
    /// Span with `op` and `device_id` set; `status`, `error.message`,
    /// `cache` and `latency_ms` are filled in later.
    pub fn new(op: &'static str, device_id: &str) -> Span {
        info_span!(
            "device_op",
            op = op,
            device_id = %device_id,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            cache = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }

    /// Span covering one streaming session.
    pub fn session(session_id: &str, device_id: &str) -> Span {
        info_span!(
            "streaming_session",
            session_id = %session_id,
            device_id = %device_id,
        )
    }
}
