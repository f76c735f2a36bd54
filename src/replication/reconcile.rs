//! Interval reconciliation
//!
//! Peers may resend overlapping or padded ranges. `trim` keeps only the
//! bytes that fall inside the still-needed set, drops duplicates within the
//! same payload, and returns them in ascending offset order.
//!
//! Holes inside a round's window are reported by `zero_fill` as ranges;
//! they are never materialised as zero buffers.

use std::collections::BTreeMap;

use super::errors::{RecoveryError, RecoveryResult};
use super::interval::{ByteRange, IntervalSet};

/// Useful portion of a received payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimmedData {
    /// Ranges kept, normalised
    pub ranges: IntervalSet,
    /// Bytes for `ranges`, concatenated in ascending offset order
    pub data: Vec<u8>,
}

impl TrimmedData {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate `(offset, bytes)` per contiguous range.
    pub fn extents(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        let mut pos = 0usize;
        self.ranges.iter().map(move |(s, e)| {
            let len = (e - s) as usize;
            let chunk = &self.data[pos..pos + len];
            pos += len;
            (s, chunk)
        })
    }
}

/// Intersect `received` with `needed` and extract the matching bytes.
///
/// `data` is the concatenation of `received` in the order given. A payload
/// whose byte count does not match its ranges is rejected.
pub fn trim(
    needed: &IntervalSet,
    received: &[ByteRange],
    data: &[u8],
) -> RecoveryResult<TrimmedData> {
    let declared = received
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add(r.len))
        .ok_or_else(|| RecoveryError::malformed("payload ranges overflow"))?;
    if declared != data.len() as u64 {
        return Err(RecoveryError::malformed(format!(
            "payload declares {} bytes but carries {}",
            declared,
            data.len()
        )));
    }

    let mut taken = IntervalSet::new();
    let mut chunks: BTreeMap<u64, &[u8]> = BTreeMap::new();
    let mut pos = 0usize;

    for r in received {
        let useful = IntervalSet::from_range(r.offset, r.len)
            .intersection(needed)
            .subtract(&taken);
        for (s, e) in useful.iter() {
            let from = pos + (s - r.offset) as usize;
            let to = pos + (e - r.offset) as usize;
            chunks.insert(s, &data[from..to]);
        }
        taken.union_with(&useful);
        pos += r.len as usize;
    }

    let mut out = Vec::with_capacity(taken.size() as usize);
    for chunk in chunks.values() {
        out.extend_from_slice(chunk);
    }

    Ok(TrimmedData {
        ranges: taken,
        data: out,
    })
}

/// Needed ranges inside `[from, to)` that the round did not carry.
///
/// The supplier only sends allocated extents, so anything it skipped
/// inside the window it covered is a hole.
pub fn zero_fill(needed: &IntervalSet, from: u64, to: u64, included: &IntervalSet) -> IntervalSet {
    needed.window(from, to).subtract(included)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_trim_drops_bytes_outside_needed() {
        let needed = IntervalSet::from_range(10, 10);
        let data = bytes(30, 0);
        let out = trim(&needed, &[ByteRange::new(0, 30)], &data).unwrap();

        assert_eq!(out.ranges, IntervalSet::from_range(10, 10));
        assert_eq!(out.data, data[10..20].to_vec());
    }

    #[test]
    fn test_trim_handles_overlap_and_disorder() {
        let needed = IntervalSet::from_range(0, 20);
        let source = bytes(20, 7);
        let mut data = source[10..20].to_vec();
        data.extend_from_slice(&source[0..15]);
        let received = [ByteRange::new(10, 10), ByteRange::new(0, 15)];

        let out = trim(&needed, &received, &data).unwrap();
        assert_eq!(out.ranges, IntervalSet::from_range(0, 20));
        assert_eq!(out.data, source);
    }

    #[test]
    fn test_trim_result_is_subset_of_needed_and_received() {
        let mut needed = IntervalSet::from_range(0, 8);
        needed.insert(16, 8);
        let received = [ByteRange::new(4, 16)];
        let out = trim(&needed, &received, &bytes(16, 0)).unwrap();

        let inter = needed.intersection(&IntervalSet::from_ranges(&received));
        assert!(inter.contains_set(&out.ranges));
        assert_eq!(out.data.len() as u64, out.ranges.size());
    }

    #[test]
    fn test_retrim_after_apply_is_empty() {
        let needed = IntervalSet::from_range(0, 16);
        let received = [ByteRange::new(0, 16)];
        let data = bytes(16, 1);

        let first = trim(&needed, &received, &data).unwrap();
        let remaining = needed.subtract(&first.ranges);
        let second = trim(&remaining, &received, &data).unwrap();
        assert!(second.is_empty());
        assert!(second.data.is_empty());
    }

    #[test]
    fn test_trim_rejects_short_payload() {
        let needed = IntervalSet::from_range(0, 16);
        let result = trim(&needed, &[ByteRange::new(0, 16)], &bytes(8, 0));
        assert!(result.is_err());
    }

    #[test]
    fn test_extents_split_per_range() {
        let mut needed = IntervalSet::from_range(0, 4);
        needed.insert(8, 4);
        let out = trim(&needed, &[ByteRange::new(0, 12)], &bytes(12, 0)).unwrap();
        let extents: Vec<_> = out.extents().map(|(o, b)| (o, b.to_vec())).collect();
        assert_eq!(extents, vec![(0, vec![0, 1, 2, 3]), (8, vec![8, 9, 10, 11])]);
    }

    #[test]
    fn test_zero_fill_reports_holes_only() {
        let needed = IntervalSet::from_range(0, 100);
        let included = IntervalSet::from_range(10, 20);
        let zeros = zero_fill(&needed, 0, 50, &included);

        let mut expected = IntervalSet::from_range(0, 10);
        expected.insert(30, 20);
        assert_eq!(zeros, expected);
    }
}
