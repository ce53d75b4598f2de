use crate::{Batch, Error, ReadClient, WriteClient};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics};
use conduit_queue::batch;
use prometheus_client::metrics::counter::Counter;
use std::time::Duration;

/// [ReadClient] over the in-memory batch queue: closing a batch is a no-op.
pub struct MemoryReadClient<E: Clock + Metrics, V> {
    context: E,
    queue: batch::Queue<V>,

    /// How long a read waits before yielding "no batch".
    poll: Duration,

    batches: Counter,
    filtered: Counter,
    output: Counter,
}

impl<E: Clock + Metrics, V> MemoryReadClient<E, V> {
    pub fn new(context: E, queue: batch::Queue<V>, poll: Duration) -> Self {
        let batches = Counter::default();
        let filtered = Counter::default();
        let output = Counter::default();
        context.register("batches", "Batches delivered", batches.clone());
        context.register("filtered", "Elements through the filter stage", filtered.clone());
        context.register("output", "Elements through the output stage", output.clone());
        Self {
            context,
            queue,
            poll,
            batches,
            filtered,
            output,
        }
    }
}

impl<E: Clock + Metrics, V: Send + 'static> ReadClient for MemoryReadClient<E, V> {
    type Element = V;

    async fn read_batch(&mut self) -> Result<Option<Batch<V>>, Error> {
        let sleep = self.context.sleep(self.poll);
        let wait = self.queue.wait_batch();
        let items = select! {
            items = wait => {
                items
            },
            _ = sleep => {
                None
            },
        };
        Ok(items.map(Batch::from_items))
    }

    async fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.queue.is_empty())
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

    async fn close_batch(&mut self, _batch: Batch<V>) -> Result<(), Error> {
        // Nothing to acknowledge: delivery out of the buffer is final
        Ok(())
    }
}

/// [WriteClient] over the in-memory batch queue.
///
/// The returned "sequence number" is a per-handle ordinal, not a durable
/// global sequence: the in-memory queue tracks no identity beyond buffer
/// position.
pub struct MemoryWriteClient<V> {
    queue: batch::Queue<V>,
    next: u64,
}

impl<V> Clone for MemoryWriteClient<V> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            next: 0,
        }
    }
}

impl<V> MemoryWriteClient<V> {
    pub fn new(queue: batch::Queue<V>) -> Self {
        Self { queue, next: 0 }
    }
}

impl<V: Send + 'static> WriteClient for MemoryWriteClient<V> {
    type Element = V;

    async fn write(&mut self, element: V) -> Result<u64, Error> {
        self.queue.write(element).await?;
        let ordinal = self.next;
        self.next += 1;
        Ok(ordinal)
    }
}
