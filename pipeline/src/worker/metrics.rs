//! Metrics for [Worker](super::Worker).

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::counter::Counter;

/// Metrics for [Worker](super::Worker).
#[derive(Default)]
pub(super) struct Metrics {
    /// Elements consumed from the queue.
    pub consumed: Counter,
    /// Elements that completed the compute step.
    pub filtered: Counter,
    /// Non-empty batches processed.
    pub batches: Counter,
    /// Batches that carried a flush.
    pub flushes: Counter,
    /// Fatal compute failures.
    pub failures: Counter,
}

impl Metrics {
    /// Create and register metrics with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "consumed",
            "Elements consumed from the queue",
            metrics.consumed.clone(),
        );
        context.register(
            "filtered",
            "Elements that completed the compute step",
            metrics.filtered.clone(),
        );
        context.register("batches", "Non-empty batches processed", metrics.batches.clone());
        context.register("flushes", "Batches that carried a flush", metrics.flushes.clone());
        context.register("failures", "Fatal compute failures", metrics.failures.clone());
        metrics
    }
}
