//! A bounded, batch-oriented in-memory queue with no persistence or
//! acknowledgement.
//!
//! Elements accumulate in a single batch-in-progress; readers atomically
//! swap the whole buffer for a fresh one instead of dequeuing element by
//! element, giving consumers a contiguous batch view with no per-element
//! overhead.
//!
//! Two details of the write path matter for latency and backpressure:
//!
//! - **Empty-buffer shortcut**: a write into an empty buffer is admitted
//!   immediately and wakes waiting readers, prioritizing first-element
//!   latency over full-batch accumulation.
//! - **Bounded**: once the buffer holds `limit` elements, writers wait until
//!   a reader swaps the buffer out.
//!
//! Waiting is future-based: the not-full/not-empty conditions are waker
//! lists rather than condition variables. Dropping a pending [Write] or
//! [WaitBatch] future is the cancellation path and never corrupts buffered
//! state (a cancelled write writes nothing). Callers wanting a bounded wait
//! compose [Queue::wait_batch] with a clock timeout and treat expiry as "no
//! batch".
//!
//! # Example
//!
//! ```rust
//! use conduit_queue::batch::Queue;
//!
//! futures::executor::block_on(async move {
//!     let queue = Queue::new(128);
//!     queue.write(1u64).await.unwrap();
//!     queue.write(2u64).await.unwrap();
//!     let batch = queue.non_block_read_batch().unwrap();
//!     assert_eq!(batch, vec![1, 2]);
//!     assert!(queue.non_block_read_batch().is_none());
//! });
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};
use thiserror::Error;

/// Errors that can occur when interacting with the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("closed")]
    Closed,
}

struct Inner<E> {
    /// The batch-in-progress.
    batch: Vec<E>,

    /// Maximum elements buffered before writers wait.
    limit: usize,

    closed: bool,

    /// Readers waiting for the buffer to become non-empty.
    not_empty: Vec<Waker>,

    /// Writers waiting for the buffer to be swapped out.
    not_full: Vec<Waker>,
}

impl<E> Inner<E> {
    fn is_full(&self) -> bool {
        self.batch.len() >= self.limit
    }

    /// Swap the buffer for a fresh one and wake waiting writers.
    fn swap(&mut self) -> Vec<E> {
        let batch = std::mem::take(&mut self.batch);
        for waker in self.not_full.drain(..) {
            waker.wake();
        }
        batch
    }

    fn register(list: &mut Vec<Waker>, waker: &Waker) {
        if !list.iter().any(|existing| existing.will_wake(waker)) {
            list.push(waker.clone());
        }
    }
}

/// A bounded blocking buffer between fast producers and a batch-oriented
/// consumer.
///
/// Cloning is cheap; all clones share the same buffer.
pub struct Queue<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Clone for Queue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Queue<E> {
    /// Create a queue buffering at most `limit` elements.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "limit must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                batch: Vec::new(),
                limit,
                closed: false,
                not_empty: Vec::new(),
                not_full: Vec::new(),
            })),
        }
    }

    /// Append an element to the batch-in-progress.
    ///
    /// Resolves immediately when the buffer is empty (waking waiting
    /// readers) or below the limit; otherwise waits for a reader to swap the
    /// buffer out. Cancelling the wait (dropping the future) writes nothing.
    pub fn write(&self, element: E) -> Write<E> {
        Write {
            queue: self.clone(),
            element: Some(element),
        }
    }

    /// Return the current buffer if it holds anything, replacing it with a
    /// fresh one. Never waits; returns `None` when nothing is buffered.
    pub fn non_block_read_batch(&self) -> Option<Vec<E>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.batch.is_empty() {
            return None;
        }
        Some(inner.swap())
    }

    /// Wait until the buffer is non-empty, then swap and return it.
    ///
    /// Returns `None` only once the queue is closed and drained. Callers
    /// wanting the timeout form bound this future with their clock and
    /// treat expiry as "no batch".
    pub fn wait_batch(&self) -> WaitBatch<E> {
        WaitBatch {
            queue: self.clone(),
        }
    }

    /// Whether the buffer is empty right now.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().batch.is_empty()
    }

    /// Whether the buffer is at its limit right now.
    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().is_full()
    }

    /// Close the queue: subsequent writes fail, waiting readers drain
    /// whatever is buffered and then observe the close.
    ///
    /// There is no persisted state to flush; this exists for interface
    /// symmetry with the durable queue.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        for waker in inner.not_empty.drain(..) {
            waker.wake();
        }
        for waker in inner.not_full.drain(..) {
            waker.wake();
        }
    }
}

/// Future returned by [Queue::write].
pub struct Write<E> {
    queue: Queue<E>,
    element: Option<E>,
}

impl<E> Unpin for Write<E> {}

impl<E> Future for Write<E> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.queue.inner.lock().unwrap();
        if inner.closed {
            return Poll::Ready(Err(Error::Closed));
        }

        // Empty-buffer shortcut: admit immediately and wake readers
        if inner.batch.is_empty() {
            inner.batch.push(this.element.take().expect("polled after ready"));
            for waker in inner.not_empty.drain(..) {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }

        if inner.is_full() {
            Inner::<E>::register(&mut inner.not_full, cx.waker());
            return Poll::Pending;
        }

        inner.batch.push(this.element.take().expect("polled after ready"));
        Poll::Ready(Ok(()))
    }
}

/// Future returned by [Queue::wait_batch].
pub struct WaitBatch<E> {
    queue: Queue<E>,
}

impl<E> Unpin for WaitBatch<E> {}

impl<E> Future for WaitBatch<E> {
    type Output = Option<Vec<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.queue.inner.lock().unwrap();
        if !inner.batch.is_empty() {
            return Poll::Ready(Some(inner.swap()));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        Inner::<E>::register(&mut inner.not_empty, cx.waker());
        Poll::Pending
    }
}
