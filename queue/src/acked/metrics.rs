//! Metrics for [super::Queue].

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [super::Queue].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Elements written but not yet read.
    pub unread: Gauge,
    /// Elements read but not yet acknowledged.
    pub unacked: Gauge,
    /// Elements acknowledged but not yet reclaimed.
    pub acked: Gauge,
    /// Bytes held by live pages.
    pub bytes: Gauge,
    /// Live pages.
    pub pages: Gauge,
    /// Checkpoint snapshots persisted.
    pub checkpoints: Counter,
    /// Pages reclaimed after full acknowledgement.
    pub reclaimed: Counter,
}

impl Metrics {
    /// Create and register metrics with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "unread",
            "Elements written but not yet read",
            metrics.unread.clone(),
        );
        context.register(
            "unacked",
            "Elements read but not yet acknowledged",
            metrics.unacked.clone(),
        );
        context.register(
            "acked",
            "Elements acknowledged but not yet reclaimed",
            metrics.acked.clone(),
        );
        context.register("bytes", "Bytes held by live pages", metrics.bytes.clone());
        context.register("pages", "Live pages", metrics.pages.clone());
        context.register(
            "checkpoints",
            "Checkpoint snapshots persisted",
            metrics.checkpoints.clone(),
        );
        context.register(
            "reclaimed",
            "Pages reclaimed after full acknowledgement",
            metrics.reclaimed.clone(),
        );
        metrics
    }
}
