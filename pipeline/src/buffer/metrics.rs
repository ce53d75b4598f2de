//! Metrics for the [Engine](super::Engine).

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [Engine](super::Engine).
#[derive(Default)]
pub(super) struct Metrics {
    /// Elements admitted.
    pub writes: Counter,
    /// Batches served.
    pub reads: Counter,
    /// Writers currently deferred on capacity.
    pub parked_writes: Gauge,
    /// Readers currently waiting for elements.
    pub parked_reads: Gauge,
    /// Batches returned to the unread state after a cancelled delivery.
    pub rewinds: Counter,
}

impl Metrics {
    /// Create and register metrics with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("writes", "Elements admitted", metrics.writes.clone());
        context.register("reads", "Batches served", metrics.reads.clone());
        context.register(
            "parked_writes",
            "Writers currently deferred on capacity",
            metrics.parked_writes.clone(),
        );
        context.register(
            "parked_reads",
            "Readers currently waiting for elements",
            metrics.parked_reads.clone(),
        );
        context.register(
            "rewinds",
            "Batches returned to the unread state after a cancelled delivery",
            metrics.rewinds.clone(),
        );
        metrics
    }
}
