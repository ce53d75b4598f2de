//! Durable queue implementation.

use super::{
    checkpoint::{CheckpointStore, PageCheckpoint},
    metrics,
    page::PageStore,
    ranges::SeqRanges,
    Config, Error,
};
use commonware_codec::Codec;
use commonware_runtime::{Metrics, Storage};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};
use zstd::{bulk::compress, decode_all};

/// In-memory acknowledgement state for one page.
struct AckState {
    /// All sequence numbers in the page below this are acknowledged.
    first_unacked: u64,

    /// Acknowledged sequence numbers at or above `first_unacked`.
    above: SeqRanges,
}

/// An ordered, read-only view over unread elements, spanning one or more
/// pages. The unit of acknowledgement.
#[derive(Debug)]
pub struct Batch<V> {
    first_seq: u64,
    last_seq: u64,
    items: Vec<(u64, V)>,
}

impl<V> Batch<V> {
    /// First sequence number covered by this batch.
    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    /// Last sequence number covered by this batch (inclusive).
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over `(sequence, element)` pairs in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &(u64, V)> {
        self.items.iter()
    }

    /// Consume the batch, yielding its `(sequence, element)` pairs.
    pub fn into_items(self) -> Vec<(u64, V)> {
        self.items
    }
}

/// A durable, crash-recoverable, capacity-bounded queue with explicit
/// acknowledgement.
///
/// Elements are appended to page blobs and survive crashes. Readers take
/// ordered batches and acknowledge them after processing; acknowledgement
/// state is persisted as periodic checkpoints. Pages whose elements are all
/// acknowledged are reclaimed.
///
/// # Delivery Semantics
///
/// - **Write**: appends the element to the head page and returns its
///   sequence number. Data is durable once the next checkpoint (or `sync`)
///   completes; a crash may redeliver recent writes but never invents acks.
/// - **Read**: returns unread elements in sequence order and marks them in
///   flight. Nothing is removed from storage by reading.
/// - **Ack**: marks a sequence range processed. Acknowledgements are
///   idempotent; re-acking a range is a no-op.
///
/// # Crash Recovery
///
/// On restart, pages are repaired (truncating torn or corrupt tails) and the
/// newest valid checkpoint snapshot is loaded. Every durably-written element
/// not covered by a checkpointed acknowledgement is redelivered, so
/// consumers observe at-least-once delivery and must tolerate duplicates.
///
/// # Capacity
///
/// Capacity is tracked on two axes: bytes held by live pages (`max_bytes`)
/// and elements not yet acknowledged (`max_unread`). Both are released only
/// by acknowledgement (which reclaims pages), never by reading. The queue
/// itself never blocks; callers gate writes on [Queue::is_full].
pub struct Queue<E: Storage + Metrics, V: Codec> {
    pages: PageStore<E>,
    checkpoints: CheckpointStore<E>,

    /// Per-page acknowledgement state, keyed by page number.
    acks: BTreeMap<u64, AckState>,

    /// Sequence number assigned to the next write.
    next_seq: u64,

    /// Next sequence number to consider for reading.
    ///
    /// Invariant: every unacknowledged sequence below `read_seq` is in
    /// flight (read but not acked).
    read_seq: u64,

    unread: u64,
    unacked: u64,
    acked: u64,

    max_bytes: u64,
    max_unread: u64,
    checkpoint_acks: u64,
    acks_since_checkpoint: u64,

    compression: Option<u8>,
    codec_config: V::Cfg,

    metrics: metrics::Metrics,
}

impl<E: Storage + Metrics, V: Codec> Queue<E, V> {
    /// Open a queue from storage.
    ///
    /// On first initialization, creates an empty queue. On restart, repairs
    /// pages, loads the newest valid checkpoint snapshot, and positions the
    /// read cursor at the first unacknowledged element (at-least-once
    /// redelivery).
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreadable or a page is
    /// missing from the middle of the queue.
    pub async fn init(context: E, cfg: Config<V::Cfg>) -> Result<Self, Error> {
        let metrics = metrics::Metrics::init(&context);

        let pages = PageStore::init(
            context.with_label("pages"),
            cfg.partition,
            cfg.page_capacity.get(),
        )
        .await?;
        let checkpoints =
            CheckpointStore::init(context.with_label("checkpoints"), cfg.checkpoint_partition)
                .await?;

        // Reconstruct acknowledgement state, trusting repaired page contents
        // over any checkpoint claims that exceed them.
        let mut acks = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut read_seq = None;
        let mut unread = 0u64;
        let mut acked = 0u64;
        for (number, page) in pages.iter() {
            if page.count() == 0 {
                continue;
            }
            let end = page.end_seq();
            let (first_unacked, above) = match checkpoints.get(number) {
                Some(record) => {
                    if record.first_unacked > end || record.count > page.count() {
                        warn!(
                            page = number,
                            checkpointed = record.count,
                            recovered = page.count(),
                            "checkpoint ahead of page contents: clamping"
                        );
                    }
                    let first_unacked = record.first_unacked.clamp(page.first_seq, end);
                    let mut above = record.acked_above.clone();
                    above.prune_below(first_unacked);
                    if end > 0 {
                        above.prune_above(end - 1);
                    }
                    (first_unacked, above)
                }
                None => (page.first_seq, SeqRanges::new()),
            };

            let acked_in_page = (first_unacked - page.first_seq) + above.count();
            unread += page.count() - acked_in_page;
            acked += acked_in_page;
            if first_unacked < end && read_seq.is_none() {
                read_seq = Some(first_unacked);
            }
            next_seq = end;
            acks.insert(
                number,
                AckState {
                    first_unacked,
                    above,
                },
            );
        }
        let read_seq = read_seq.unwrap_or(next_seq);

        debug!(
            next_seq,
            read_seq,
            unread,
            acked,
            pages = pages.len(),
            "queue initialized"
        );

        let queue = Self {
            pages,
            checkpoints,
            acks,
            next_seq,
            read_seq,
            unread,
            unacked: 0,
            acked,
            max_bytes: cfg.max_bytes,
            max_unread: cfg.max_unread,
            checkpoint_acks: cfg.checkpoint_acks.get(),
            acks_since_checkpoint: 0,
            compression: cfg.compression,
            codec_config: cfg.codec_config,
            metrics,
        };
        queue.update_metrics();
        Ok(queue)
    }

    /// Append an element, returning its sequence number.
    ///
    /// The element lands in the head page, rolling to a new page when the
    /// head is full (entries never span pages). The queue never blocks:
    /// callers enforcing backpressure gate on [Queue::is_full].
    ///
    /// # Errors
    ///
    /// Returns [Error::ElementTooLarge] if the encoded element cannot fit in
    /// an empty page, or an error if the storage operation fails.
    pub async fn write(&mut self, element: V) -> Result<u64, Error> {
        let data = if let Some(level) = self.compression {
            let encoded = element.encode();
            compress(&encoded, level as i32).map_err(|_| Error::CompressionFailed)?
        } else {
            let mut buf = Vec::with_capacity(element.encode_size());
            element.write(&mut buf);
            buf
        };

        let seq = self.next_seq;
        let prior_head = self.pages.head_number();
        let page = self.pages.append(seq, &data).await?;
        self.acks.entry(page).or_insert(AckState {
            first_unacked: seq,
            above: SeqRanges::new(),
        });
        self.next_seq += 1;
        self.unread += 1;

        // A page roll retires the prior head; checkpoint so its final extent
        // is durable before new data piles up behind it.
        if page != prior_head {
            self.checkpoint().await?;
        }

        trace!(seq, page, "wrote element");
        self.update_metrics();
        Ok(seq)
    }

    /// Read up to `limit` unread elements as a single batch, marking them in
    /// flight. Returns `None` when nothing is unread.
    ///
    /// Elements are returned in sequence order, skipping any that were
    /// acknowledged before being read (possible after crash recovery).
    pub async fn read_batch(&mut self, limit: usize) -> Result<Option<Batch<V>>, Error> {
        if limit == 0 || self.unread == 0 {
            return Ok(None);
        }

        let mut items = Vec::with_capacity(limit.min(self.unread as usize));
        let mut seq = self.read_seq;
        while items.len() < limit && seq < self.next_seq {
            if self.is_acked(seq) {
                seq += 1;
                continue;
            }
            let page = self.pages.locate(seq).ok_or(Error::UnknownSequence(seq))?;
            let data = self.pages.read(page, seq).await?;
            let element = if self.compression.is_some() {
                let decompressed =
                    decode_all(data.as_slice()).map_err(|_| Error::DecompressionFailed)?;
                V::decode_cfg(decompressed.as_slice(), &self.codec_config)?
            } else {
                V::decode_cfg(data.as_slice(), &self.codec_config)?
            };
            items.push((seq, element));
            seq += 1;
        }
        if items.is_empty() {
            return Ok(None);
        }

        let read = items.len() as u64;
        self.read_seq = seq;
        self.unread -= read;
        self.unacked += read;

        let batch = Batch {
            first_seq: items.first().unwrap().0,
            last_seq: items.last().unwrap().0,
            items,
        };
        trace!(
            first_seq = batch.first_seq,
            last_seq = batch.last_seq,
            len = batch.len(),
            "read batch"
        );
        self.update_metrics();
        Ok(Some(batch))
    }

    /// Return in-flight elements at `seq` and above to the unread state.
    ///
    /// Used when a delivered batch never reached its consumer (e.g. the
    /// read timed out in flight); the elements will be redelivered by the
    /// next read.
    pub fn rewind_read(&mut self, seq: u64) {
        if seq >= self.read_seq {
            return;
        }
        let mut moved = 0u64;
        for s in seq..self.read_seq {
            if !self.is_acked(s) {
                moved += 1;
            }
        }
        debug!(from = self.read_seq, to = seq, moved, "rewound read cursor");
        self.read_seq = seq;
        self.unread += moved;
        self.unacked -= moved;
        self.update_metrics();
    }

    /// Acknowledge every sequence number in `[first_seq, last_seq]`.
    ///
    /// Acknowledgement is idempotent: already-acked sequence numbers (and
    /// ranges acked twice) are skipped. Pages whose elements are all
    /// acknowledged are reclaimed, and a checkpoint is persisted every
    /// `checkpoint_acks` acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns [Error::UnknownAckRange] if the range covers sequence numbers
    /// that were never written.
    pub async fn ack(&mut self, first_seq: u64, last_seq: u64) -> Result<(), Error> {
        if first_seq > last_seq || last_seq >= self.next_seq {
            return Err(Error::UnknownAckRange(first_seq, last_seq));
        }

        let mut newly = 0u64;
        for seq in first_seq..=last_seq {
            // A sequence without a live page was reclaimed (already acked)
            let Some(page) = self.pages.locate(seq) else {
                continue;
            };
            let state = self.acks.get_mut(&page).expect("page missing ack state");
            if seq < state.first_unacked || state.above.contains(seq) {
                continue;
            }
            if seq == state.first_unacked {
                state.first_unacked = state.above.advance(seq + 1);
            } else {
                state.above.insert(seq);
            }
            if seq >= self.read_seq {
                // Acked before ever being read
                self.unread -= 1;
            } else {
                self.unacked -= 1;
            }
            self.acked += 1;
            newly += 1;
        }
        trace!(first_seq, last_seq, newly, "acked range");

        // Reclaim fully-acknowledged non-head pages
        let head = self.pages.head_number();
        let reclaimable: Vec<(u64, u64)> = self
            .pages
            .iter()
            .filter(|&(number, page)| {
                number != head
                    && page.count() > 0
                    && self.acks[&number].first_unacked >= page.end_seq()
            })
            .map(|(number, page)| (number, page.count()))
            .collect();
        let reclaimed = !reclaimable.is_empty();
        for (number, count) in reclaimable {
            self.pages.remove(number).await?;
            self.acks.remove(&number);
            self.checkpoints.remove(number);
            self.acked -= count;
            self.metrics.reclaimed.inc();
            debug!(page = number, "reclaimed page");
        }

        self.acks_since_checkpoint += newly;
        if reclaimed || self.acks_since_checkpoint >= self.checkpoint_acks {
            self.checkpoint().await?;
        }
        self.update_metrics();
        Ok(())
    }

    /// Persist page data and then the checkpoint snapshot describing it.
    ///
    /// Ordering is write-ahead: data is synced before the snapshot, so a
    /// checkpoint can lag page contents but never lead them.
    pub async fn checkpoint(&mut self) -> Result<(), Error> {
        self.pages.sync_head().await?;
        for (number, page) in self.pages.iter() {
            if page.count() == 0 {
                continue;
            }
            let state = &self.acks[&number];
            self.checkpoints.put(PageCheckpoint {
                page: number,
                first_seq: page.first_seq,
                count: page.count(),
                write_offset: page.size,
                first_unacked: state.first_unacked,
                acked_above: state.above.clone(),
            });
        }
        self.checkpoints.sync().await?;
        self.acks_since_checkpoint = 0;
        self.metrics.checkpoints.inc();
        Ok(())
    }

    /// Durably persist all outstanding state.
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.checkpoint().await
    }

    /// Persist outstanding state and release storage handles.
    ///
    /// Data written and acknowledged before the call survives restarts;
    /// anything after the final checkpoint would be redelivered.
    pub async fn close(mut self) -> Result<(), Error> {
        self.checkpoint().await?;
        debug!("queue closed");
        Ok(())
    }

    /// Remove all backing storage.
    pub async fn destroy(self) -> Result<(), Error> {
        self.pages.destroy().await?;
        self.checkpoints.destroy().await
    }

    fn is_acked(&self, seq: u64) -> bool {
        let Some(page) = self.pages.locate(seq) else {
            return false;
        };
        let Some(state) = self.acks.get(&page) else {
            return false;
        };
        seq < state.first_unacked || state.above.contains(seq)
    }

    /// Whether a capacity bound is reached.
    ///
    /// Both axes are released only by acknowledgement: bytes shrink when
    /// fully-acked pages are reclaimed, and the element bound counts unread
    /// plus in-flight elements.
    pub fn is_full(&self) -> bool {
        self.pages.bytes() >= self.max_bytes || self.unread + self.unacked >= self.max_unread
    }

    /// Whether there is nothing left to read.
    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    /// Whether every written element has been acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.unread == 0 && self.unacked == 0
    }

    /// Elements written but not yet read.
    pub const fn unread(&self) -> u64 {
        self.unread
    }

    /// Elements read but not yet acknowledged.
    pub const fn unacked(&self) -> u64 {
        self.unacked
    }

    /// Elements acknowledged but not yet reclaimed.
    pub const fn acked(&self) -> u64 {
        self.acked
    }

    /// Total number of elements ever written. The next write receives this
    /// sequence number.
    pub const fn size(&self) -> u64 {
        self.next_seq
    }

    /// Bytes held by live pages.
    pub fn bytes(&self) -> u64 {
        self.pages.bytes()
    }

    fn update_metrics(&self) {
        self.metrics.unread.set(self.unread as i64);
        self.metrics.unacked.set(self.unacked as i64);
        self.metrics.acked.set(self.acked as i64);
        self.metrics.bytes.set(self.pages.bytes() as i64);
        self.metrics.pages.set(self.pages.len() as i64);
    }
}
