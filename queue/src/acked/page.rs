//! Page storage for the durable queue.
//!
//! Each page is a single append-only [Blob] named by its page number
//! (big-endian `u64`) within a caller-provided partition. Entries are framed
//! as:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+----...----+---+---+---+---+
//! |        Sequence (u64)         | Length (u32)  |    Data   |  CRC32 (u32)  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+----...----+---+---+---+---+
//! ```
//!
//! The CRC covers `Data` only; `Sequence` is validated against the entry's
//! position in the page. Entries never span pages: a write that would
//! overflow the page's byte capacity rolls to a new page first.
//!
//! # Repair
//!
//! Like a WAL, the first invalid entry encountered during recovery is
//! considered the new end of the page: the blob is truncated to the last
//! valid entry and everything before it is preserved. A missing page between
//! two surviving pages cannot be repaired and fails recovery.

use super::Error;
use commonware_runtime::{Blob, Error as RError, Metrics, Storage};
use commonware_utils::hex;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Bytes preceding entry data: sequence (u64) + length (u32).
pub(crate) const ENTRY_HEADER: usize = 12;

/// Bytes following entry data: CRC32.
pub(crate) const ENTRY_TRAILER: usize = 4;

/// Total framing overhead per entry.
pub(crate) const ENTRY_OVERHEAD: usize = ENTRY_HEADER + ENTRY_TRAILER;

/// A single page: one blob plus in-memory bookkeeping for random reads.
pub(crate) struct Page<B: Blob> {
    pub blob: B,

    /// Current write offset (byte size of valid entries).
    pub size: u64,

    /// Sequence number of the first entry in this page.
    ///
    /// Meaningless until the page holds at least one entry (a freshly rolled
    /// page is assigned its first sequence on the next append).
    pub first_seq: u64,

    /// Byte offset of each entry. `offsets.len()` is the entry count.
    pub offsets: Vec<u64>,

    /// Whether the blob has writes that have not been synced.
    pub dirty: bool,
}

impl<B: Blob> Page<B> {
    pub fn count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// One past the last sequence number held by this page.
    pub fn end_seq(&self) -> u64 {
        self.first_seq + self.count()
    }
}

/// All pages of one queue, keyed by page number.
///
/// Invariants:
/// - Page numbers are consecutive and without gaps.
/// - There is always at least one page (the head) after initialization.
/// - Only the head page is ever written.
pub(crate) struct PageStore<E: Storage + Metrics> {
    context: E,
    partition: String,
    capacity: u32,
    pages: BTreeMap<u64, Page<E::Blob>>,
}

impl<E: Storage + Metrics> PageStore<E> {
    /// Open all pages in `partition`, repairing trailing corruption, and
    /// ensure a writable head page exists.
    pub async fn init(context: E, partition: String, capacity: u32) -> Result<Self, Error> {
        let mut pages = BTreeMap::new();
        let stored = match context.scan(&partition).await {
            Ok(blobs) => blobs,
            Err(RError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(Error::Runtime(err)),
        };
        for name in stored {
            let (blob, len) = context.open(&partition, &name).await?;
            let number = match name.try_into() {
                Ok(name) => u64::from_be_bytes(name),
                Err(name) => return Err(Error::InvalidBlobName(hex(&name))),
            };
            let page = Self::recover(number, blob, len).await?;
            debug!(
                page = number,
                entries = page.count(),
                bytes = page.size,
                "recovered page"
            );
            pages.insert(number, page);
        }

        // A gap in page numbering means a page was lost; entries after it
        // cannot be assigned sequence numbers safely.
        let mut iter = pages.keys();
        if let Some(&first) = iter.next() {
            let mut previous = first;
            for &number in iter {
                if number != previous + 1 {
                    return Err(Error::MissingPage(previous + 1));
                }
                previous = number;
            }
        }

        // Validate sequence continuity across pages. An empty intermediate
        // page is only legal as the head (rolled but never written).
        let mut expected: Option<u64> = None;
        for (&number, page) in &pages {
            if page.count() == 0 {
                continue;
            }
            if let Some(expected) = expected {
                if page.first_seq != expected {
                    return Err(Error::SequenceGap(number, expected, page.first_seq));
                }
            }
            expected = Some(page.end_seq());
        }

        if pages.is_empty() {
            debug!("no pages found");
            let (blob, _) = context.open(&partition, &0u64.to_be_bytes()).await?;
            pages.insert(
                0,
                Page {
                    blob,
                    size: 0,
                    first_seq: 0,
                    offsets: Vec::new(),
                    dirty: false,
                },
            );
        }

        Ok(Self {
            context,
            partition,
            capacity,
            pages,
        })
    }

    /// Walk a page blob, validating entries and truncating at the first
    /// invalid one.
    async fn recover(number: u64, blob: E::Blob, len: u64) -> Result<Page<E::Blob>, Error> {
        let mut first_seq = 0u64;
        let mut offsets = Vec::new();
        let mut valid = 0u64;

        if len > 0 {
            let buf = blob.read_at(vec![0u8; len as usize], 0).await?;
            let buf = buf.as_ref();
            let mut offset = 0usize;
            loop {
                let remaining = buf.len() - offset;
                if remaining == 0 {
                    break;
                }
                if remaining < ENTRY_OVERHEAD {
                    warn!(
                        page = number,
                        bad_offset = offset,
                        "partial entry header: truncating"
                    );
                    break;
                }
                let seq = u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap());
                let data_len =
                    u32::from_be_bytes(buf[offset + 8..offset + 12].try_into().unwrap()) as usize;
                let entry_len = ENTRY_OVERHEAD + data_len;
                if remaining < entry_len {
                    warn!(
                        page = number,
                        bad_offset = offset,
                        "incomplete entry at end: truncating"
                    );
                    break;
                }
                let data = &buf[offset + ENTRY_HEADER..offset + ENTRY_HEADER + data_len];
                let stored = u32::from_be_bytes(
                    buf[offset + entry_len - ENTRY_TRAILER..offset + entry_len]
                        .try_into()
                        .unwrap(),
                );
                if crc32fast::hash(data) != stored {
                    warn!(
                        page = number,
                        bad_offset = offset,
                        "checksum mismatch: truncating"
                    );
                    break;
                }
                if offsets.is_empty() {
                    first_seq = seq;
                } else if seq != first_seq + offsets.len() as u64 {
                    warn!(
                        page = number,
                        bad_offset = offset,
                        seq,
                        "sequence discontinuity: truncating"
                    );
                    break;
                }
                offsets.push(offset as u64);
                offset += entry_len;
                valid = offset as u64;
            }
        }

        if valid < len {
            blob.resize(valid).await?;
            blob.sync().await?;
        }

        Ok(Page {
            blob,
            size: valid,
            first_seq,
            offsets,
            dirty: false,
        })
    }

    /// Append an entry for `seq`, rolling to a new page if the head would
    /// overflow. Returns the page number written to.
    pub async fn append(&mut self, seq: u64, data: &[u8]) -> Result<u64, Error> {
        let entry_len = ENTRY_OVERHEAD + data.len();
        if entry_len as u64 > self.capacity as u64 {
            return Err(Error::ElementTooLarge(entry_len, self.capacity as usize));
        }

        // Roll to a new page if the entry does not fit
        let head = *self.pages.keys().last().expect("no pages");
        let head = if self.head().size + entry_len as u64 > self.capacity as u64 {
            // Data in the retired page is synced before it becomes immutable
            self.sync_head().await?;
            let next = head + 1;
            let (blob, _) = self
                .context
                .open(&self.partition, &next.to_be_bytes())
                .await?;
            debug!(page = next, "rolled to new page");
            self.pages.insert(
                next,
                Page {
                    blob,
                    size: 0,
                    first_seq: seq,
                    offsets: Vec::new(),
                    dirty: false,
                },
            );
            next
        } else {
            head
        };

        let page = self.pages.get_mut(&head).expect("head missing");
        if page.offsets.is_empty() {
            page.first_seq = seq;
        }
        debug_assert_eq!(page.end_seq(), seq);

        let mut buf = Vec::with_capacity(entry_len);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&crc32fast::hash(data).to_be_bytes());

        let offset = page.size;
        page.blob.write_at(buf, offset).await?;
        page.offsets.push(offset);
        page.size += entry_len as u64;
        page.dirty = true;
        trace!(page = head, seq, offset, "appended entry");
        Ok(head)
    }

    /// Read and verify the entry holding `seq` from `page`.
    pub async fn read(&self, number: u64, seq: u64) -> Result<Vec<u8>, Error> {
        let page = self.pages.get(&number).ok_or(Error::MissingPage(number))?;
        if seq < page.first_seq || seq >= page.end_seq() {
            return Err(Error::UnknownSequence(seq));
        }
        let index = (seq - page.first_seq) as usize;
        let offset = page.offsets[index];
        let end = page
            .offsets
            .get(index + 1)
            .copied()
            .unwrap_or(page.size);
        let len = (end - offset) as usize;

        let buf = page.blob.read_at(vec![0u8; len], offset).await?;
        let buf = buf.as_ref();
        let stored_seq = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let data = &buf[ENTRY_HEADER..len - ENTRY_TRAILER];
        let stored = u32::from_be_bytes(buf[len - ENTRY_TRAILER..].try_into().unwrap());
        let computed = crc32fast::hash(data);
        if computed != stored {
            return Err(Error::ChecksumMismatch(stored, computed));
        }
        if stored_seq != seq {
            return Err(Error::UnknownSequence(seq));
        }
        Ok(data.to_vec())
    }

    /// Locate the page holding `seq`, if any.
    pub fn locate(&self, seq: u64) -> Option<u64> {
        self.pages
            .iter()
            .find(|(_, page)| page.count() > 0 && seq >= page.first_seq && seq < page.end_seq())
            .map(|(&number, _)| number)
    }

    /// Remove a fully-processed page and its backing blob.
    ///
    /// The head page is never removed.
    pub async fn remove(&mut self, number: u64) -> Result<(), Error> {
        assert_ne!(number, self.head_number(), "cannot remove head page");
        let page = self.pages.remove(&number).ok_or(Error::MissingPage(number))?;
        drop(page);
        self.context
            .remove(&self.partition, Some(&number.to_be_bytes()))
            .await?;
        debug!(page = number, "removed page");
        Ok(())
    }

    /// Sync the head page if it has unsynced writes.
    pub async fn sync_head(&mut self) -> Result<(), Error> {
        let head = self.head_number();
        let page = self.pages.get_mut(&head).expect("head missing");
        if page.dirty {
            page.blob.sync().await?;
            page.dirty = false;
        }
        Ok(())
    }

    pub fn head_number(&self) -> u64 {
        *self.pages.keys().last().expect("no pages")
    }

    fn head(&self) -> &Page<E::Blob> {
        self.pages.get(&self.head_number()).expect("head missing")
    }

    pub fn get(&self, number: u64) -> Option<&Page<E::Blob>> {
        self.pages.get(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Page<E::Blob>)> {
        self.pages.iter().map(|(&number, page)| (number, page))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Total bytes across all live pages.
    pub fn bytes(&self) -> u64 {
        self.pages.values().map(|page| page.size).sum()
    }

    /// Remove every blob in the partition.
    pub async fn destroy(self) -> Result<(), Error> {
        drop(self.pages);
        match self.context.remove(&self.partition, None).await {
            Ok(()) | Err(RError::PartitionMissing(_)) => Ok(()),
            Err(err) => Err(Error::Runtime(err)),
        }
    }
}
