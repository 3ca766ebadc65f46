//! Forwarding counters, exposed on `/metrics` through the Prometheus exporter.

use metrics::{Counter, Gauge, counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const EVENTS_FORWARDED_TOTAL: &str = "event_forwarder_events_forwarded_total";
pub const EVENTS_DEDUPLICATED_TOTAL: &str = "event_forwarder_events_deduplicated_total";
pub const EVENTS_VANISHED_TOTAL: &str = "event_forwarder_events_vanished_total";
pub const DELIVERY_RETRIES_TOTAL: &str = "event_forwarder_delivery_retries_total";
pub const DROPPED_PERMANENT_TOTAL: &str = "event_forwarder_dropped_permanent_total";
pub const DROPPED_RETRY_EXHAUSTED_TOTAL: &str = "event_forwarder_dropped_retry_exhausted_total";
pub const DELIVERY_FAILURES_TOTAL: &str = "event_forwarder_delivery_failures_total";
pub const RECONCILE_ERRORS_TOTAL: &str = "event_forwarder_reconcile_errors_total";
pub const DEDUP_ENTRIES: &str = "event_forwarder_dedup_entries";

/// Counters for the forwarding pipeline.
///
/// Each instance owns its own recorder, so nothing is installed globally and
/// parallel tests do not share series.
pub struct ForwardingStats {
    handle: PrometheusHandle,
    forwarded: Counter,
    deduplicated: Counter,
    vanished: Counter,
    retries_scheduled: Counter,
    dropped_permanent: Counter,
    dropped_retry_exhausted: Counter,
    delivery_failures: Counter,
    reconcile_errors: Counter,
    dedup_entries: Gauge,
}

impl Default for ForwardingStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardingStats {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!(EVENTS_FORWARDED_TOTAL, "Events delivered to the push gateway.");
            describe_counter!(
                EVENTS_DEDUPLICATED_TOTAL,
                "Events skipped because their occurrence was already forwarded or dropped."
            );
            describe_counter!(EVENTS_VANISHED_TOTAL, "Events deleted before they could be processed.");
            describe_counter!(
                DELIVERY_RETRIES_TOTAL,
                "Requeues scheduled after a transient delivery failure."
            );
            describe_counter!(
                DROPPED_PERMANENT_TOTAL,
                "Events dropped after a permanent delivery failure."
            );
            describe_counter!(
                DROPPED_RETRY_EXHAUSTED_TOTAL,
                "Events dropped after exhausting the retry budget."
            );
            describe_counter!(DELIVERY_FAILURES_TOTAL, "Failed push attempts.");
            describe_counter!(RECONCILE_ERRORS_TOTAL, "Reconciles that ended in an error.");
            describe_gauge!(DEDUP_ENTRIES, "Entries held by the dedup cache.");

            Self {
                handle,
                forwarded: counter!(EVENTS_FORWARDED_TOTAL),
                deduplicated: counter!(EVENTS_DEDUPLICATED_TOTAL),
                vanished: counter!(EVENTS_VANISHED_TOTAL),
                retries_scheduled: counter!(DELIVERY_RETRIES_TOTAL),
                dropped_permanent: counter!(DROPPED_PERMANENT_TOTAL),
                dropped_retry_exhausted: counter!(DROPPED_RETRY_EXHAUSTED_TOTAL),
                delivery_failures: counter!(DELIVERY_FAILURES_TOTAL),
                reconcile_errors: counter!(RECONCILE_ERRORS_TOTAL),
                dedup_entries: gauge!(DEDUP_ENTRIES),
            }
        })
    }

    pub fn record_forwarded(&self) {
        self.forwarded.increment(1);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.increment(1);
    }

    pub fn record_vanished(&self) {
        self.vanished.increment(1);
    }

    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.increment(1);
    }

    pub fn record_dropped_permanent(&self) {
        self.dropped_permanent.increment(1);
    }

    pub fn record_dropped_retry_exhausted(&self) {
        self.dropped_retry_exhausted.increment(1);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.increment(1);
    }

    pub fn record_reconcile_error(&self) {
        self.reconcile_errors.increment(1);
    }

    /// Prometheus text exposition of every series, with the dedup gauge
    /// set to `dedup_entries` first.
    pub fn render(&self, dedup_entries: usize) -> String {
        self.dedup_entries.set(dedup_entries as f64);
        self.handle.render()
    }
}
