//! A durable, page-structured, checkpointed queue with explicit
//! acknowledgement.
//!
//! Elements are serialized into append-only pages (one [commonware_runtime::Blob]
//! per page) and tracked by a strictly-increasing sequence number assigned at
//! write time. Consumers read ordered batches and acknowledge them once
//! processed; acknowledgement state is persisted as periodic checkpoint
//! snapshots, and pages whose elements are all acknowledged are deleted.
//!
//! # Durability Contract
//!
//! Delivery is at-least-once. Page data is synced before any checkpoint that
//! describes it, so a checkpoint can trail page contents but never lead
//! them. After a crash:
//!
//! - every durably-written element not covered by a checkpointed
//!   acknowledgement is redelivered;
//! - acknowledgements made after the last checkpoint are forgotten (their
//!   elements are redelivered);
//! - acknowledged elements covered by a checkpoint are never redelivered.
//!
//! Consumers must therefore be prepared to observe a bounded window of
//! duplicates after recovery. The window is controlled by the checkpoint
//! cadence ([Config::checkpoint_acks]).
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use commonware_utils::{NZU32, NZU64};
//! use conduit_queue::acked::{Config, Queue};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let mut queue = Queue::<_, Vec<u8>>::init(context, Config {
//!         partition: "events".to_string(),
//!         checkpoint_partition: "events_checkpoints".to_string(),
//!         page_capacity: NZU32!(1 << 20),
//!         max_bytes: 1 << 30,
//!         max_unread: 4096,
//!         checkpoint_acks: NZU64!(1024),
//!         compression: None,
//!         codec_config: ((0..).into(), ()),
//!     }).await.unwrap();
//!
//!     // Write, read, acknowledge
//!     queue.write(b"event".to_vec()).await.unwrap();
//!     let batch = queue.read_batch(128).await.unwrap().unwrap();
//!     queue.ack(batch.first_seq(), batch.last_seq()).await.unwrap();
//!
//!     // Make everything durable and release storage
//!     queue.close().await.unwrap();
//! });
//! ```

mod checkpoint;
mod metrics;
mod page;
mod ranges;
mod storage;

pub use storage::{Batch, Queue};

use commonware_runtime::Error as RError;
use std::num::{NonZeroU32, NonZeroU64};
use thiserror::Error;

/// Errors that can occur when interacting with the queue.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] RError),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("invalid blob name: {0}")]
    InvalidBlobName(String),
    #[error("missing page: {0}")]
    MissingPage(u64),
    #[error("sequence gap at page {0}: expected {1}, found {2}")]
    SequenceGap(u64, u64, u64),
    #[error("checksum mismatch: stored {0}, computed {1}")]
    ChecksumMismatch(u32, u32),
    #[error("unknown sequence: {0}")]
    UnknownSequence(u64),
    #[error("unknown ack range: [{0}, {1}]")]
    UnknownAckRange(u64, u64),
    #[error("element too large: {0} > {1}")]
    ElementTooLarge(usize, usize),
    #[error("compression failed")]
    CompressionFailed,
    #[error("decompression failed")]
    DecompressionFailed,
}

/// Configuration for [Queue].
#[derive(Clone)]
pub struct Config<C> {
    /// The storage partition for page blobs.
    pub partition: String,

    /// The storage partition for checkpoint blobs.
    pub checkpoint_partition: String,

    /// Maximum byte size of each page.
    ///
    /// Entries never span pages, so an encoded element (plus 16 bytes of
    /// framing) must fit in an empty page. Once set, this value should not
    /// be changed across restarts.
    pub page_capacity: NonZeroU32,

    /// Capacity bound on bytes held by live pages.
    pub max_bytes: u64,

    /// Capacity bound on elements not yet acknowledged (unread plus in
    /// flight).
    pub max_unread: u64,

    /// Persist a checkpoint snapshot every this many acknowledgements.
    ///
    /// Lower values shrink the redelivery window after a crash at the cost
    /// of more frequent snapshot writes. Snapshots are also persisted on
    /// page rolls, page reclamation, `sync`, and `close`.
    pub checkpoint_acks: NonZeroU64,

    /// Optional zstd compression level for stored elements.
    pub compression: Option<u8>,

    /// Codec configuration for encoding/decoding elements.
    pub codec_config: C,
}
