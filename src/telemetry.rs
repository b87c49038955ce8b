//! Telemetry utilities for event timing and tracing spans.

use std::time::Instant;

/// Guard for timing client event handling and recording metrics.
///
/// Records event latency when dropped.
pub struct EventTimer {
    event: &'static str,
    start: Instant,
}

impl EventTimer {
    /// Start timing an event.
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            start: Instant::now(),
        }
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_event(self.event, duration);
    }
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for a client connection.
    pub fn connection(handle: &str, addr: &str, transport: &str) -> Span {
        info_span!("connection", handle = %handle, addr = %addr, transport = %transport)
    }

    /// Span for one shared-store maintenance task.
    pub fn store_task(task: &'static str, instance: &str) -> Span {
        info_span!("store", task = task, instance = %instance)
    }
}
