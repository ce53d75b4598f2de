//! Durable acknowledgement checkpoints.
//!
//! One [PageCheckpoint] record per live page is persisted as a single
//! snapshot:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+----...----+---+---+---+---+
//! |         Version (u64)         |  Count (u32)  |  Records  |  CRC32 (u32)  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+----...----+---+---+---+---+
//! ```
//!
//! # Atomic Updates
//!
//! Two blobs ("left" and "right") are alternated: each snapshot is written
//! in full to the older blob and synced before it becomes current. A torn
//! write can therefore never destroy the previous good snapshot: on open,
//! both blobs are verified and the valid one with the highest version wins.
//!
//! # Write-Ahead Ordering
//!
//! Callers must sync page data before syncing the snapshot that describes
//! it. A checkpoint may lag page contents (extra entries are redelivered
//! after a crash) but must never lead them.

use super::{ranges::SeqRanges, Error};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_runtime::{Blob, Error as RError, Metrics, Storage};
use prometheus_client::metrics::counter::Counter;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const BLOB_NAMES: [&[u8]; 2] = [b"left", b"right"];

/// Version (u64) + record count (u32).
const SNAPSHOT_HEADER: usize = 12;

/// CRC32.
const SNAPSHOT_TRAILER: usize = 4;

/// Durable per-page acknowledgement state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageCheckpoint {
    /// Page number this record describes.
    pub page: u64,

    /// Sequence number of the first entry in the page.
    pub first_seq: u64,

    /// Number of entries written to the page at checkpoint time.
    pub count: u64,

    /// Byte size of the page at checkpoint time.
    pub write_offset: u64,

    /// All sequence numbers below this are acknowledged.
    pub first_unacked: u64,

    /// Acknowledged sequence numbers at or above `first_unacked`.
    pub acked_above: SeqRanges,
}

impl EncodeSize for PageCheckpoint {
    fn encode_size(&self) -> usize {
        5 * 8 + self.acked_above.encode_size()
    }
}

impl Write for PageCheckpoint {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.page);
        buf.put_u64(self.first_seq);
        buf.put_u64(self.count);
        buf.put_u64(self.write_offset);
        buf.put_u64(self.first_unacked);
        self.acked_above.write(buf);
    }
}

impl Read for PageCheckpoint {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        if buf.remaining() < 5 * 8 {
            return Err(CodecError::EndOfBuffer);
        }
        Ok(Self {
            page: buf.get_u64(),
            first_seq: buf.get_u64(),
            count: buf.get_u64(),
            write_offset: buf.get_u64(),
            first_unacked: buf.get_u64(),
            acked_above: SeqRanges::read(buf)?,
        })
    }
}

/// Metrics for [CheckpointStore].
#[derive(Default)]
struct StoreMetrics {
    /// Number of snapshots persisted.
    syncs: Counter,
}

impl StoreMetrics {
    fn init<E: Metrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register("syncs", "Number of snapshots persisted", metrics.syncs.clone());
        metrics
    }
}

/// The checkpoint store: an in-memory map of page records with atomic
/// snapshot persistence.
pub(crate) struct CheckpointStore<E: Storage + Metrics> {
    context: E,
    partition: String,

    /// Which blob receives the next snapshot (the older of the two).
    cursor: usize,
    blobs: [E::Blob; 2],
    version: u64,

    records: BTreeMap<u64, PageCheckpoint>,
    dirty: bool,

    metrics: StoreMetrics,
}

impl<E: Storage + Metrics> CheckpointStore<E> {
    /// Open the store, recovering the newest valid snapshot.
    ///
    /// A corrupt or torn snapshot in one blob falls back to the other; if
    /// both are invalid the store starts empty (every durably-written
    /// element will be treated as unacknowledged).
    pub async fn init(context: E, partition: String) -> Result<Self, Error> {
        let (left, left_len) = context.open(&partition, BLOB_NAMES[0]).await?;
        let (right, right_len) = context.open(&partition, BLOB_NAMES[1]).await?;

        let left_snapshot = Self::verify(&left, left_len, 0).await?;
        let right_snapshot = Self::verify(&right, right_len, 1).await?;

        // The valid snapshot with the highest version wins; the next write
        // goes to the other blob.
        let (cursor, version, records) = match (left_snapshot, right_snapshot) {
            (Some((lv, lr)), Some((rv, _))) if lv >= rv => (1, lv, lr),
            (Some(_), Some((rv, rr))) => (0, rv, rr),
            (Some((lv, lr)), None) => (1, lv, lr),
            (None, Some((rv, rr))) => (0, rv, rr),
            (None, None) => (0, 0, BTreeMap::new()),
        };
        debug!(version, records = records.len(), "checkpoints loaded");

        let metrics = StoreMetrics::init(&context);
        Ok(Self {
            context,
            partition,
            cursor,
            blobs: [left, right],
            version,
            records,
            dirty: false,
            metrics,
        })
    }

    /// Parse and verify one snapshot blob.
    async fn verify(
        blob: &E::Blob,
        len: u64,
        which: usize,
    ) -> Result<Option<(u64, BTreeMap<u64, PageCheckpoint>)>, Error> {
        if len == 0 {
            return Ok(None);
        }
        if (len as usize) < SNAPSHOT_HEADER + SNAPSHOT_TRAILER {
            warn!(blob = which, len, "snapshot too short: ignoring");
            return Ok(None);
        }
        let buf = blob.read_at(vec![0u8; len as usize], 0).await?;
        let buf = buf.as_ref();

        let stored = u32::from_be_bytes(buf[buf.len() - SNAPSHOT_TRAILER..].try_into().unwrap());
        let computed = crc32fast::hash(&buf[..buf.len() - SNAPSHOT_TRAILER]);
        if stored != computed {
            warn!(
                blob = which,
                stored, computed, "snapshot checksum mismatch: ignoring"
            );
            return Ok(None);
        }

        let mut cursor = &buf[..buf.len() - SNAPSHOT_TRAILER];
        let version = cursor.get_u64();
        let count = cursor.get_u32();
        let mut records = BTreeMap::new();
        for _ in 0..count {
            let record = match PageCheckpoint::read(&mut cursor) {
                Ok(record) => record,
                Err(err) => {
                    warn!(blob = which, ?err, "snapshot record invalid: ignoring");
                    return Ok(None);
                }
            };
            records.insert(record.page, record);
        }
        Ok(Some((version, records)))
    }

    pub fn get(&self, page: u64) -> Option<&PageCheckpoint> {
        self.records.get(&page)
    }

    pub fn put(&mut self, record: PageCheckpoint) {
        self.records.insert(record.page, record);
        self.dirty = true;
    }

    pub fn remove(&mut self, page: u64) {
        if self.records.remove(&page).is_some() {
            self.dirty = true;
        }
    }

    /// Persist the current records as a new snapshot, if anything changed.
    pub async fn sync(&mut self) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }

        self.version += 1;
        let mut buf = Vec::with_capacity(
            SNAPSHOT_HEADER
                + SNAPSHOT_TRAILER
                + self
                    .records
                    .values()
                    .map(|record| record.encode_size())
                    .sum::<usize>(),
        );
        buf.put_u64(self.version);
        buf.put_u32(self.records.len() as u32);
        for record in self.records.values() {
            record.write(&mut buf);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        // Overwrite the older blob, trim any stale tail, then sync before
        // flipping the cursor so the previous snapshot stays intact until
        // this one is durable.
        let blob = &self.blobs[self.cursor];
        let len = buf.len() as u64;
        blob.write_at(buf, 0).await?;
        blob.resize(len).await?;
        blob.sync().await?;
        self.cursor = 1 - self.cursor;
        self.dirty = false;
        self.metrics.syncs.inc();
        Ok(())
    }

    /// Persist outstanding state and release the blobs.
    pub async fn close(mut self) -> Result<(), Error> {
        self.sync().await
    }

    /// Remove all blobs in the partition.
    pub async fn destroy(self) -> Result<(), Error> {
        drop(self.blobs);
        match self.context.remove(&self.partition, None).await {
            Ok(()) | Err(RError::PartitionMissing(_)) => Ok(()),
            Err(err) => Err(Error::Runtime(err)),
        }
    }
}
