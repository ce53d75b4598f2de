//! Range-set tracking of acknowledged sequence numbers.

use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use std::collections::BTreeMap;

/// A compact set of acknowledged sequence numbers, stored as disjoint
/// inclusive ranges.
///
/// Used to track acknowledgements that arrive above a page's ack floor.
/// Contiguous acknowledgements are coalesced so memory stays proportional to
/// the number of gaps, not the number of acknowledged elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SeqRanges {
    /// Maps range start to inclusive range end.
    ///
    /// Invariant: ranges are disjoint and non-adjacent (adjacent ranges are
    /// merged on insert).
    ranges: BTreeMap<u64, u64>,
}

impl SeqRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `seq` is in the set.
    pub fn contains(&self, seq: u64) -> bool {
        match self.ranges.range(..=seq).next_back() {
            Some((_, &end)) => seq <= end,
            None => false,
        }
    }

    /// Insert a single sequence number, merging with adjacent ranges.
    ///
    /// Returns false if `seq` was already present.
    pub fn insert(&mut self, seq: u64) -> bool {
        // Check the range at or before seq
        let mut merged_start = None;
        if let Some((&start, &end)) = self.ranges.range(..=seq).next_back() {
            if seq <= end {
                return false;
            }
            if end + 1 == seq {
                merged_start = Some(start);
            }
        }

        // Extend the preceding range or start a new one
        let start = match merged_start {
            Some(start) => {
                *self.ranges.get_mut(&start).unwrap() = seq;
                start
            }
            None => {
                self.ranges.insert(seq, seq);
                seq
            }
        };

        // Merge with the following range if adjacent
        if let Some((&next_start, &next_end)) = self.ranges.range(seq + 1..).next() {
            if next_start == seq + 1 {
                self.ranges.remove(&next_start);
                *self.ranges.get_mut(&start).unwrap() = next_end;
            }
        }
        true
    }

    /// Advance `floor` over any leading range that begins at or below it,
    /// consuming consumed ranges from the set.
    ///
    /// Returns the new floor (the first sequence number not in the set at or
    /// above the given floor).
    pub fn advance(&mut self, mut floor: u64) -> u64 {
        while let Some((&start, &end)) = self.ranges.iter().next() {
            if start > floor {
                break;
            }
            if end >= floor {
                floor = end + 1;
            }
            self.ranges.remove(&start);
        }
        floor
    }

    /// Drop all sequence numbers strictly below `seq`.
    pub fn prune_below(&mut self, seq: u64) {
        let mut truncated = None;
        self.ranges.retain(|&start, &mut end| {
            if end < seq {
                return false;
            }
            if start < seq {
                truncated = Some(end);
                return false;
            }
            true
        });
        if let Some(end) = truncated {
            self.ranges.insert(seq, end);
        }
    }

    /// Drop all sequence numbers strictly above `seq`.
    pub fn prune_above(&mut self, seq: u64) {
        let mut truncated = None;
        self.ranges.retain(|&start, &mut end| {
            if start > seq {
                return false;
            }
            if end > seq {
                truncated = Some(start);
            }
            true
        });
        if let Some(start) = truncated {
            self.ranges.insert(start, seq);
        }
    }

    /// Total count of sequence numbers in the set.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(|(&s, &e)| e - s + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over (start, end) inclusive ranges in order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }
}

impl FromIterator<(u64, u64)> for SeqRanges {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut ranges = Self::new();
        for (start, end) in iter {
            for seq in start..=end {
                ranges.insert(seq);
            }
        }
        ranges
    }
}

impl EncodeSize for SeqRanges {
    fn encode_size(&self) -> usize {
        let mut size = UInt(self.ranges.len() as u32).encode_size();
        for (start, end) in self.iter() {
            size += UInt(start).encode_size() + UInt(end - start).encode_size();
        }
        size
    }
}

impl Write for SeqRanges {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.ranges.len() as u32).write(buf);
        for (start, end) in self.iter() {
            UInt(start).write(buf);
            // Store the width so short ranges encode in few bytes
            UInt(end - start).write(buf);
        }
    }
}

impl Read for SeqRanges {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let count = UInt::<u32>::read(buf)?.0 as usize;
        let mut ranges = BTreeMap::new();
        let mut previous: Option<u64> = None;
        for _ in 0..count {
            let start = UInt::<u64>::read(buf)?.0;
            let width = UInt::<u64>::read(buf)?.0;
            let end = start.checked_add(width).ok_or(CodecError::Invalid(
                "queue::acked::SeqRanges",
                "range end overflow",
            ))?;
            // Enforce the disjoint, ordered invariant on untrusted input
            if let Some(previous) = previous {
                if start <= previous + 1 {
                    return Err(CodecError::Invalid(
                        "queue::acked::SeqRanges",
                        "ranges not disjoint",
                    ));
                }
            }
            previous = Some(end);
            ranges.insert(start, end);
        }
        Ok(Self { ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use test_case::test_case;

    #[test]
    fn test_insert_and_contains() {
        let mut ranges = SeqRanges::new();
        assert!(!ranges.contains(5));
        assert!(ranges.insert(5));
        assert!(ranges.contains(5));
        assert!(!ranges.insert(5));
        assert_eq!(ranges.count(), 1);
    }

    #[test]
    fn test_coalescing() {
        let mut ranges = SeqRanges::new();
        ranges.insert(1);
        ranges.insert(3);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(1, 1), (3, 3)]);

        // Filling the gap merges all three
        ranges.insert(2);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(1, 3)]);

        // Adjacent on either side extends
        ranges.insert(0);
        ranges.insert(4);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(0, 4)]);
        assert_eq!(ranges.count(), 5);
    }

    #[test_case(0, 0; "floor below all ranges")]
    #[test_case(5, 8; "floor at range start")]
    #[test_case(7, 8; "floor inside range")]
    #[test_case(9, 9; "floor above range")]
    fn test_advance(floor: u64, expected: u64) {
        let mut ranges = SeqRanges::new();
        for seq in 5..8 {
            ranges.insert(seq);
        }
        assert_eq!(ranges.advance(floor), expected);
    }

    #[test]
    fn test_advance_consumes_chain() {
        let mut ranges = SeqRanges::new();
        for seq in [3u64, 4, 5, 7, 8] {
            ranges.insert(seq);
        }
        // 3..=5 is consumed, 6 is the gap, 7..=8 remains
        assert_eq!(ranges.advance(3), 6);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(7, 8)]);
    }

    #[test]
    fn test_prune() {
        let mut ranges = SeqRanges::new();
        for seq in [1u64, 2, 3, 10, 11, 12] {
            ranges.insert(seq);
        }
        ranges.prune_below(3);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(3, 3), (10, 12)]);
        ranges.prune_above(10);
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(3, 3), (10, 10)]);
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut ranges = SeqRanges::new();
        for seq in [0u64, 1, 5, 6, 7, 100] {
            ranges.insert(seq);
        }
        let encoded = ranges.encode();
        let decoded = SeqRanges::decode(encoded.as_ref()).unwrap();
        assert_eq!(ranges, decoded);
    }

    #[test]
    fn test_codec_rejects_overlapping() {
        let mut ranges = SeqRanges::new();
        ranges.insert(5);
        let mut buf = Vec::new();
        // Hand-encode two overlapping ranges
        UInt(2u32).write(&mut buf);
        UInt(0u64).write(&mut buf);
        UInt(5u64).write(&mut buf);
        UInt(3u64).write(&mut buf);
        UInt(1u64).write(&mut buf);
        assert!(SeqRanges::decode(buf.as_ref()).is_err());
    }
}
