//! Prometheus metrics collection for rendezvousd.
//!
//! Tracks connections, the waiting slot, pairings and client event
//! throughput. Exposed over HTTP by [`crate::http`].
//!
//! - `rendezvous_event_total{event}` - Client events processed by type
//! - `rendezvous_event_duration_seconds{event}` - Event latency histogram
//! - `rendezvous_sessions_ended_total{reason}` - Pairings dissolved, by reason
//! - `rendezvous_waiting` - Sessions currently waiting (this instance)

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Pairings formed, split by whether both sides live on this instance.
pub static PAIRINGS_FORMED: OnceLock<IntCounterVec> = OnceLock::new();

/// Pairings dissolved, by departure reason.
pub static SESSIONS_ENDED: OnceLock<IntCounterVec> = OnceLock::new();

/// Searches cancelled by the client.
pub static SEARCHES_CANCELLED: OnceLock<IntCounter> = OnceLock::new();

/// Claim/occupy rounds lost to another party.
pub static CLAIM_CONTENTION: OnceLock<IntCounter> = OnceLock::new();

/// Waiting entries discarded because their session was gone.
pub static STALE_ENTRIES: OnceLock<IntCounter> = OnceLock::new();

/// Orphaned waiting entries reaped from the shared store.
pub static ENTRIES_REAPED: OnceLock<IntCounter> = OnceLock::new();

/// Notices received from other broker instances.
pub static REMOTE_NOTICES: OnceLock<IntCounterVec> = OnceLock::new();

/// Frames dropped because a client outbox was full.
pub static FRAMES_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// Rate limit hits (connection and message flood protection).
pub static RATE_LIMITED: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Sessions attached to this instance.
pub static CONNECTED_CLIENTS: OnceLock<IntGauge> = OnceLock::new();

/// Sessions of this instance currently in the waiting slot.
pub static WAITING: OnceLock<IntGauge> = OnceLock::new();

/// Pairings this instance takes part in.
pub static ACTIVE_PAIRINGS: OnceLock<IntGauge> = OnceLock::new();

// ========================================================================
// Event Metrics
// ========================================================================

/// Client events processed by type.
pub static EVENT_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();

/// Client event processing latency by type.
pub static EVENT_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Client event errors by type and error code.
pub static EVENT_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    register!(PAIRINGS_FORMED, IntCounterVec::new(Opts::new("rendezvous_pairings_total", "Pairings formed"), &["scope"]));
    register!(SESSIONS_ENDED, IntCounterVec::new(Opts::new("rendezvous_sessions_ended_total", "Pairings dissolved by reason"), &["reason"]));
    register!(SEARCHES_CANCELLED, IntCounter::new("rendezvous_searches_cancelled_total", "Searches cancelled by clients"));
    register!(CLAIM_CONTENTION, IntCounter::new("rendezvous_claim_contention_total", "Claim/occupy rounds lost to another party"));
    register!(STALE_ENTRIES, IntCounter::new("rendezvous_stale_entries_total", "Waiting entries discarded after their session left"));
    register!(ENTRIES_REAPED, IntCounter::new("rendezvous_entries_reaped_total", "Orphaned waiting entries reaped"));
    register!(REMOTE_NOTICES, IntCounterVec::new(Opts::new("rendezvous_remote_notices_total", "Notices received from other instances"), &["kind"]));
    register!(FRAMES_DROPPED, IntCounter::new("rendezvous_frames_dropped_total", "Frames dropped due to a full outbox"));
    register!(RATE_LIMITED, IntCounterVec::new(Opts::new("rendezvous_rate_limited_total", "Rate limit hits"), &["kind"]));

    register!(CONNECTED_CLIENTS, IntGauge::new("rendezvous_connected_clients", "Sessions attached to this instance"));
    register!(WAITING, IntGauge::new("rendezvous_waiting", "Sessions waiting for a partner"));
    register!(ACTIVE_PAIRINGS, IntGauge::new("rendezvous_active_pairings", "Pairings in progress"));

    register!(EVENT_COUNTER, IntCounterVec::new(Opts::new("rendezvous_event_total", "Client events processed by type"), &["event"]));
    register!(EVENT_LATENCY, HistogramVec::new(
        HistogramOpts::new("rendezvous_event_duration_seconds", "Client event latency by type")
            .buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["event"]));
    register!(EVENT_ERRORS, IntCounterVec::new(Opts::new("rendezvous_event_errors_total", "Client event errors by type"), &["event", "error"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for metric updates
// ============================================================================

#[inline]
fn inc(metric: &OnceLock<IntCounter>) {
    if let Some(c) = metric.get() {
        c.inc();
    }
}

#[inline]
fn inc_label(metric: &OnceLock<IntCounterVec>, label: &str) {
    if let Some(c) = metric.get() {
        c.with_label_values(&[label]).inc();
    }
}

/// Record a client event with latency.
#[inline]
pub fn record_event(event: &str, duration_secs: f64) {
    inc_label(&EVENT_COUNTER, event);
    if let Some(h) = EVENT_LATENCY.get() {
        h.with_label_values(&[event]).observe(duration_secs);
    }
}

/// Record a client event error.
#[inline]
pub fn record_event_error(event: &str, error: &str) {
    if let Some(c) = EVENT_ERRORS.get() {
        c.with_label_values(&[event, error]).inc();
    }
}

#[inline]
pub fn record_pairing(cross_instance: bool) {
    inc_label(&PAIRINGS_FORMED, if cross_instance { "cross_instance" } else { "local" });
}

#[inline]
pub fn record_session_ended(reason: &str) {
    inc_label(&SESSIONS_ENDED, reason);
}

#[inline]
pub fn record_search_cancelled() {
    inc(&SEARCHES_CANCELLED);
}

#[inline]
pub fn record_claim_contention() {
    inc(&CLAIM_CONTENTION);
}

#[inline]
pub fn record_stale_entry() {
    inc(&STALE_ENTRIES);
}

#[inline]
pub fn record_reaped(count: u64) {
    if let Some(c) = ENTRIES_REAPED.get() {
        c.inc_by(count);
    }
}

#[inline]
pub fn record_remote_notice(kind: &str) {
    inc_label(&REMOTE_NOTICES, kind);
}

#[inline]
pub fn record_dropped_frame() {
    inc(&FRAMES_DROPPED);
}

#[inline]
pub fn record_rate_limited(kind: &str) {
    inc_label(&RATE_LIMITED, kind);
}

/// Update the broker gauges from a lifecycle snapshot.
#[inline]
pub fn set_broker_gauges(sessions: usize, waiting: usize, pairings: usize) {
    if let Some(g) = CONNECTED_CLIENTS.get() {
        g.set(sessions as i64);
    }
    if let Some(g) = WAITING.get() {
        g.set(waiting as i64);
    }
    if let Some(g) = ACTIVE_PAIRINGS.get() {
        g.set(pairings as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        init();

        record_event("find_partner", 0.001);
        record_pairing(false);
        set_broker_gauges(2, 0, 1);

        let output = gather_metrics();
        assert!(output.contains("rendezvous_event_total"));
        assert!(output.contains("rendezvous_pairings_total"));
        assert!(output.contains("rendezvous_active_pairings 1"));
    }
}
