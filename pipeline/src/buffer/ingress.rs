use crate::Error;
use conduit_queue::acked::Batch;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the [Engine](super::Engine).
pub(super) enum Message<V> {
    /// Buffer an element. The responder resolves once the element is
    /// admitted, which may be deferred until acknowledgements free
    /// capacity.
    Write {
        element: V,
        responder: oneshot::Sender<Result<u64, Error>>,
    },

    /// Take the next unread batch. The responder resolves as soon as unread
    /// elements exist; dropping it (e.g. on timeout) cancels the request
    /// without losing elements.
    ReadBatch {
        limit: usize,
        responder: oneshot::Sender<Result<Option<Batch<V>>, Error>>,
    },

    /// Acknowledge a sequence range.
    Ack {
        first_seq: u64,
        last_seq: u64,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Whether nothing is left to read.
    IsEmpty { responder: oneshot::Sender<bool> },

    /// Whether every written element has been acknowledged.
    IsFullyAcked { responder: oneshot::Sender<bool> },

    /// Persist all outstanding state.
    Sync {
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Persist and shut the queue down. Subsequent operations fail with
    /// [Error::Closed].
    Close {
        responder: oneshot::Sender<Result<(), Error>>,
    },
}

/// Producer handle for the [Engine](super::Engine). Cloneable; one per
/// producer.
pub struct Writer<V> {
    sender: mpsc::Sender<Message<V>>,
}

impl<V> Clone for Writer<V> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<V> Writer<V> {
    pub(super) fn new(sender: mpsc::Sender<Message<V>>) -> Self {
        Self { sender }
    }

    /// Buffer an element, waiting while the queue is at capacity.
    ///
    /// The returned future resolves with the element's sequence number once
    /// the element is durably appended. Dropping the future before it
    /// resolves abandons the write.
    pub async fn write(&mut self, element: V) -> Result<u64, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Write { element, responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}

impl<V: Send + 'static> crate::WriteClient for Writer<V> {
    type Element = V;

    async fn write(&mut self, element: V) -> Result<u64, Error> {
        Writer::write(self, element).await
    }
}

/// Consumer handle for the [Engine](super::Engine).
pub struct Reader<V> {
    sender: mpsc::Sender<Message<V>>,
}

impl<V> Clone for Reader<V> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<V> Reader<V> {
    pub(super) fn new(sender: mpsc::Sender<Message<V>>) -> Self {
        Self { sender }
    }

    /// Take up to `limit` unread elements, waiting until some exist.
    ///
    /// Callers bound the wait with their clock and treat expiry as "no
    /// batch": dropping the future cancels the request, and any batch that
    /// was already served to it is returned to the unread state.
    pub async fn read_batch(&mut self, limit: usize) -> Result<Option<Batch<V>>, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::ReadBatch { limit, responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Acknowledge every sequence number in `[first_seq, last_seq]`.
    pub async fn ack(&mut self, first_seq: u64, last_seq: u64) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Ack {
                first_seq,
                last_seq,
                responder,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Whether nothing is left to read.
    pub async fn is_empty(&mut self) -> Result<bool, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::IsEmpty { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }

    /// Whether every written element has been acknowledged.
    pub async fn is_fully_acked(&mut self) -> Result<bool, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::IsFullyAcked { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)
    }

    /// Persist all outstanding state.
    pub async fn sync(&mut self) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Sync { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }

    /// Persist outstanding state and shut the queue down.
    pub async fn close(&mut self) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Close { responder })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}
