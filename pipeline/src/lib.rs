//! Producer/consumer coordination for durable event pipelines.
//!
//! `conduit-queue` provides the queue state machines; this crate wires them
//! into a running pipeline:
//!
//! - [buffer::Engine]: an actor that owns a durable queue and serves many
//!   concurrent producers and a consumer through a mailbox, deferring write
//!   completions while the queue is at capacity (backpressure as suspended
//!   futures rather than blocked threads).
//! - [worker::Worker]: the consumer loop. Repeatedly reads a batch through a
//!   [ReadClient], drives the compute boundary ([Processor]), acknowledges
//!   the batch, and implements the flush/drain/shutdown protocol.
//! - [client]: read/write client adapters over both queue flavors, giving
//!   the worker one contract whether or not durability is in play.
//!
//! The compute boundary is deliberately opaque: a [Processor] is resolved
//! once when a worker is built and is invoked with `(elements, flush,
//! shutdown)`. Whatever compiles pipelines into executable graphs lives
//! behind that trait.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use conduit_pipeline::{client::{MemoryReadClient, MemoryWriteClient}, mocks, worker, WriteClient};
//! use conduit_queue::batch;
//! use std::time::Duration;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // A bounded in-memory queue between producers and the worker
//!     let queue = batch::Queue::new(128);
//!     let mut producer = MemoryWriteClient::new(queue.clone());
//!     producer.write(b"event".to_vec()).await.unwrap();
//!
//!     // Drive the consumer until shutdown
//!     let (mut controls, signals) = worker::signals();
//!     let client = MemoryReadClient::new(
//!         context.with_label("client"),
//!         queue,
//!         Duration::from_millis(50),
//!     );
//!     let processor = mocks::Processor::new();
//!     let worker = worker::Worker::new(
//!         context.with_label("worker"),
//!         client,
//!         processor.clone(),
//!         signals,
//!         worker::Config { drain: true, preserve_order: false },
//!     );
//!     let handle = worker.start();
//!     controls.shutdown();
//!     handle.await.unwrap().unwrap();
//!     assert_eq!(processor.calls().first().unwrap().elements.len(), 1);
//! });
//! ```

use std::future::Future;
use thiserror::Error;

pub mod buffer;
pub mod client;
pub mod mocks;
pub mod worker;

/// Errors that can occur when driving a pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue error: {0}")]
    Queue(#[from] conduit_queue::acked::Error),
    #[error("memory queue error: {0}")]
    Memory(#[from] conduit_queue::batch::Error),
    /// The component behind a handle has shut down (or an operation was
    /// attempted after `close`).
    #[error("closed")]
    Closed,
    /// The compute boundary failed. Fatal to the owning worker.
    #[error("processor failed: {0}")]
    Processor(String),
}

/// An ordered group of elements delivered to the worker in one read.
///
/// Batches from a durable queue carry the sequence range to acknowledge on
/// close; in-memory batches carry none.
#[derive(Debug)]
pub struct Batch<V> {
    ack: Option<(u64, u64)>,
    items: Vec<V>,
}

impl<V> Batch<V> {
    /// An empty batch (used for the worker's terminal flush pass).
    pub fn empty() -> Self {
        Self {
            ack: None,
            items: Vec::new(),
        }
    }

    /// A batch over in-memory elements with nothing to acknowledge.
    pub fn from_items(items: Vec<V>) -> Self {
        Self { ack: None, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Elements in delivery order.
    pub fn items(&self) -> &[V] {
        &self.items
    }

    /// The sequence range to acknowledge when this batch is closed, if any.
    pub fn ack_range(&self) -> Option<(u64, u64)> {
        self.ack
    }
}

impl<V> From<conduit_queue::acked::Batch<V>> for Batch<V> {
    fn from(batch: conduit_queue::acked::Batch<V>) -> Self {
        let ack = Some((batch.first_seq(), batch.last_seq()));
        let items = batch.into_items().into_iter().map(|(_, v)| v).collect();
        Self { ack, items }
    }
}

/// The read side of a queue, as consumed by [worker::Worker].
///
/// One contract for both queue flavors: the worker neither knows nor cares
/// whether acknowledgement is meaningful underneath.
pub trait ReadClient: Send + 'static {
    type Element: Send + 'static;

    /// Take the next batch, waiting up to an implementation-defined poll
    /// interval. `None` is a legitimate empty-poll outcome, not an error.
    fn read_batch(
        &mut self,
    ) -> impl Future<Output = Result<Option<Batch<Self::Element>>, Error>> + Send;

    /// A fresh empty batch (for the terminal flush pass).
    fn new_batch(&self) -> Batch<Self::Element> {
        Batch::empty()
    }

    /// Whether the queue has nothing left to read.
    fn is_empty(&mut self) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Called when the worker starts processing a batch.
    fn start_metrics(&mut self, batch: &Batch<Self::Element>);

    /// Record elements that passed the filter stage.
    fn add_filtered_metrics(&mut self, count: u64);

    /// Record elements that reached outputs.
    fn add_output_metrics(&mut self, count: u64);

    /// Finish a batch. For durable queues this acknowledges it, permitting
    /// page reclamation and unblocking producers waiting on capacity.
    fn close_batch(
        &mut self,
        batch: Batch<Self::Element>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// The write side of a queue, as held by producers.
pub trait WriteClient: Send + 'static {
    type Element: Send + 'static;

    /// Buffer an element, waiting while the queue is at capacity. Returns
    /// the element's sequence number.
    fn write(
        &mut self,
        element: Self::Element,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// The compute boundary: the compiled pipeline executor driven by a worker.
///
/// Resolved once at pipeline-build time, never re-dispatched per element. A
/// returned error is fatal to the owning worker: there is no internal retry,
/// since retrying could silently drop or duplicate in-flight batches.
pub trait Processor: Send + 'static {
    type Element: Send + 'static;

    /// Run the pipeline's compute step over `elements`.
    ///
    /// `flush` asks downstream stages to emit buffered intermediate state;
    /// `shutdown` marks the final invocation before the worker stops.
    fn process(
        &mut self,
        elements: &[Self::Element],
        flush: bool,
        shutdown: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
