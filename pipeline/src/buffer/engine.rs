use super::{ingress::Message, metrics, Config, Reader, Writer};
use crate::Error;
use commonware_codec::Codec;
use commonware_macros::select;
use commonware_runtime::{Handle, Metrics, Spawner, Storage};
use conduit_queue::acked::Queue;
use futures::{channel::mpsc, channel::oneshot, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Actor that owns a durable queue and serves concurrent producers and a
/// consumer through a mailbox.
///
/// Backpressure is implemented by deferral: a write received while the queue
/// is at capacity is parked, and the producer's future does not resolve
/// until acknowledgements free room. Reads are parked symmetrically until
/// unread elements exist, so a consumer can bound its wait with a clock and
/// simply drop the request on timeout; a batch served to a dropped request
/// is returned to the unread state.
pub struct Engine<E: Storage + Metrics + Spawner, V: Codec> {
    context: E,
    queue: Queue<E, V>,
    mailbox: mpsc::Receiver<Message<V>>,

    /// Writes deferred on capacity, in arrival order.
    pending_writes: VecDeque<(V, oneshot::Sender<Result<u64, Error>>)>,

    /// Reads waiting for elements, in arrival order.
    #[allow(clippy::type_complexity)]
    pending_reads: VecDeque<(
        usize,
        oneshot::Sender<Result<Option<conduit_queue::acked::Batch<V>>, Error>>,
    )>,

    metrics: metrics::Metrics,
}

impl<E: Storage + Metrics + Spawner, V: Codec + Send + 'static> Engine<E, V> {
    /// Open the underlying queue and create the engine with its producer and
    /// consumer handles.
    pub async fn init(
        context: E,
        cfg: Config<V::Cfg>,
    ) -> Result<(Self, Writer<V>, Reader<V>), Error> {
        let queue = Queue::init(context.with_label("queue"), cfg.queue).await?;
        let metrics = metrics::Metrics::init(&context);
        let (sender, mailbox) = mpsc::channel(cfg.mailbox_size);
        Ok((
            Self {
                context,
                queue,
                mailbox,
                pending_writes: VecDeque::new(),
                pending_reads: VecDeque::new(),
                metrics,
            },
            Writer::new(sender.clone()),
            Reader::new(sender),
        ))
    }

    /// Start serving requests.
    pub fn start(self) -> Handle<Result<(), Error>> {
        let context = self.context.clone();
        context.spawn(|_| self.run())
    }

    async fn run(mut self) -> Result<(), Error> {
        let mut shutdown = self.context.stopped();
        let mut close_responder = None;
        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    break;
                },
                message = self.mailbox.next() => {
                    let Some(message) = message else {
                        debug!("all handles dropped");
                        break;
                    };
                    match message {
                        Message::Write { element, responder } => {
                            self.handle_write(element, responder).await;
                        }
                        Message::ReadBatch { limit, responder } => {
                            self.handle_read(limit, responder).await;
                        }
                        Message::Ack { first_seq, last_seq, responder } => {
                            trace!(first_seq, last_seq, "mailbox: ack");
                            let result = self.queue.ack(first_seq, last_seq).await;
                            let _ = responder.send(result.map_err(Error::Queue));
                        }
                        Message::IsEmpty { responder } => {
                            let _ = responder.send(self.queue.is_empty());
                        }
                        Message::IsFullyAcked { responder } => {
                            let _ = responder.send(self.queue.is_fully_acked());
                        }
                        Message::Sync { responder } => {
                            let result = self.queue.sync().await;
                            let _ = responder.send(result.map_err(Error::Queue));
                        }
                        Message::Close { responder } => {
                            debug!("close requested");
                            close_responder = Some(responder);
                            break;
                        }
                    }
                    self.service().await;
                },
            }
        }

        // Anything still parked will never be served
        for (_, responder) in self.pending_writes.drain(..) {
            let _ = responder.send(Err(Error::Closed));
        }
        for (_, responder) in self.pending_reads.drain(..) {
            let _ = responder.send(Err(Error::Closed));
        }

        let result = self.queue.close().await.map_err(Error::Queue);
        match close_responder {
            Some(responder) => {
                let _ = responder.send(result);
                Ok(())
            }
            None => result,
        }
    }

    async fn handle_write(&mut self, element: V, responder: oneshot::Sender<Result<u64, Error>>) {
        // Preserve arrival order: defer behind any already-parked writes
        if self.queue.is_full() || !self.pending_writes.is_empty() {
            trace!("mailbox: write parked");
            self.pending_writes.push_back((element, responder));
            return;
        }
        let result = self.queue.write(element).await.map_err(Error::Queue);
        if result.is_ok() {
            self.metrics.writes.inc();
        }
        let _ = responder.send(result);
    }

    async fn handle_read(
        &mut self,
        limit: usize,
        responder: oneshot::Sender<Result<Option<conduit_queue::acked::Batch<V>>, Error>>,
    ) {
        if self.queue.is_empty() || !self.pending_reads.is_empty() {
            trace!("mailbox: read parked");
            self.pending_reads.push_back((limit, responder));
            return;
        }
        self.serve_read(limit, responder).await;
    }

    async fn serve_read(
        &mut self,
        limit: usize,
        responder: oneshot::Sender<Result<Option<conduit_queue::acked::Batch<V>>, Error>>,
    ) {
        match self.queue.read_batch(limit).await {
            Ok(Some(batch)) => {
                let first_seq = batch.first_seq();
                self.metrics.reads.inc();
                if responder.send(Ok(Some(batch))).is_err() {
                    // The requester gave up (e.g. timed out) before delivery:
                    // nothing was observed, so nothing may be lost
                    self.queue.rewind_read(first_seq);
                    self.metrics.rewinds.inc();
                }
            }
            Ok(None) => {
                let _ = responder.send(Ok(None));
            }
            Err(err) => {
                let _ = responder.send(Err(Error::Queue(err)));
            }
        }
    }

    /// Serve parked requests until no further progress is possible.
    ///
    /// Admitted writes can satisfy parked reads and acknowledgements can
    /// admit parked writes, so the two queues are drained to a fixpoint.
    async fn service(&mut self) {
        loop {
            let mut progress = false;
            while !self.pending_reads.is_empty() && !self.queue.is_empty() {
                let (limit, responder) = self.pending_reads.pop_front().unwrap();
                if responder.is_canceled() {
                    continue;
                }
                self.serve_read(limit, responder).await;
                progress = true;
            }
            while !self.queue.is_full() {
                let Some((element, responder)) = self.pending_writes.pop_front() else {
                    break;
                };
                if responder.is_canceled() {
                    // Abandoned before admission: per the cancellation
                    // contract, nothing is written
                    continue;
                }
                let result = self.queue.write(element).await.map_err(Error::Queue);
                if result.is_ok() {
                    self.metrics.writes.inc();
                }
                let _ = responder.send(result);
                progress = true;
            }
            if !progress {
                break;
            }
        }
        self.metrics
            .parked_writes
            .set(self.pending_writes.len() as i64);
        self.metrics
            .parked_reads
            .set(self.pending_reads.len() as i64);
    }
}
