use crate::{buffer::Reader, Batch, Error, ReadClient};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics};
use prometheus_client::metrics::counter::Counter;
use std::time::Duration;
use tracing::trace;

/// [ReadClient] over a durable buffer: closing a batch acknowledges it.
pub struct AckedReadClient<E: Clock + Metrics, V> {
    context: E,
    reader: Reader<V>,

    /// Maximum elements per batch.
    limit: usize,

    /// How long a read waits before yielding "no batch".
    poll: Duration,

    batches: Counter,
    timeouts: Counter,
    filtered: Counter,
    output: Counter,
}

impl<E: Clock + Metrics, V> AckedReadClient<E, V> {
    pub fn new(context: E, reader: Reader<V>, limit: usize, poll: Duration) -> Self {
        let batches = Counter::default();
        let timeouts = Counter::default();
        let filtered = Counter::default();
        let output = Counter::default();
        context.register("batches", "Batches delivered", batches.clone());
        context.register("timeouts", "Reads that expired empty", timeouts.clone());
        context.register("filtered", "Elements through the filter stage", filtered.clone());
        context.register("output", "Elements through the output stage", output.clone());
        Self {
            context,
            reader,
            limit,
            poll,
            batches,
            timeouts,
            filtered,
            output,
        }
    }
}

impl<E: Clock + Metrics, V: Send + 'static> ReadClient for AckedReadClient<E, V> {
    type Element = V;

    async fn read_batch(&mut self) -> Result<Option<Batch<V>>, Error> {
        // Dropping the read on expiry cancels it: the engine returns any
        // batch served in the race to the unread state.
        let sleep = self.context.sleep(self.poll);
        let read = self.reader.read_batch(self.limit);
        select! {
            result = read => {
                result.map(|batch| batch.map(Batch::from))
            },
            _ = sleep => {
                self.timeouts.inc();
                Ok(None)
            },
        }
    }

    async fn is_empty(&mut self) -> Result<bool, Error> {
        self.reader.is_empty().await
    }

    fn start_metrics(&mut self, batch: &Batch<V>) {
        if !batch.is_empty() {
            self.batches.inc();
        }
    }

    fn add_filtered_metrics(&mut self, count: u64) {
        self.filtered.inc_by(count);
    }

    fn add_output_metrics(&mut self, count: u64) {
        self.output.inc_by(count);
    }

    async fn close_batch(&mut self, batch: Batch<V>) -> Result<(), Error> {
        let Some((first_seq, last_seq)) = batch.ack_range() else {
            return Ok(());
        };
        trace!(first_seq, last_seq, "closing batch");
        self.reader.ack(first_seq, last_seq).await
    }
}
