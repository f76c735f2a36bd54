//! Byte-range sets
//!
//! `IntervalSet` holds sorted, disjoint, non-adjacent half-open ranges
//! `[start, end)`. Every mutation re-normalises, so two sets covering the
//! same bytes always compare equal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One contiguous range as it appears on the wire.
///
/// Unlike `IntervalSet` members, wire ranges may overlap and arrive in any
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

/// Set of byte offsets stored as merged ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet {
    /// start -> exclusive end
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding `[offset, offset + len)`.
    pub fn from_range(offset: u64, len: u64) -> Self {
        let mut set = Self::new();
        set.insert(offset, len);
        set
    }

    /// Every addressable offset; used when the object size is not yet known.
    pub fn unbounded() -> Self {
        Self::from_range(0, u64::MAX)
    }

    /// Build from wire ranges, merging overlaps.
    pub fn from_ranges(ranges: &[ByteRange]) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(r.offset, r.len);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total bytes covered.
    pub fn size(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, (s, e)| acc.saturating_add(e - s))
    }

    /// Exclusive end of the highest range.
    pub fn range_end(&self) -> Option<u64> {
        self.ranges.values().next_back().copied()
    }

    /// Iterate `(start, end)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(s, e)| (*s, *e))
    }

    /// Ranges as wire ranges.
    pub fn to_ranges(&self) -> Vec<ByteRange> {
        self.iter().map(|(s, e)| ByteRange::new(s, e - s)).collect()
    }

    /// Add `[offset, offset + len)`, merging with neighbours.
    pub fn insert(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset.saturating_add(len);

        // Absorb a predecessor that touches or overlaps.
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        // Absorb successors starting inside or right at the end.
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(start..=end)
            .map(|(s, e)| (*s, *e))
            .collect();
        for (s, e) in absorbed {
            end = end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
    }

    /// Add every range of `other`.
    pub fn union_with(&mut self, other: &IntervalSet) {
        for (s, e) in other.iter() {
            self.insert(s, e - s);
        }
    }

    /// Bytes present in both sets.
    pub fn intersection(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        let a: Vec<(u64, u64)> = self.iter().collect();
        let b: Vec<(u64, u64)> = other.iter().collect();
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            let start = a[i].0.max(b[j].0);
            let end = a[i].1.min(b[j].1);
            if start < end {
                out.ranges.insert(start, end);
            }
            if a[i].1 < b[j].1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        out
    }

    /// Bytes of `self` not present in `other`.
    pub fn subtract(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for (s, e) in self.iter() {
            let mut cursor = s;
            for (os, oe) in other.ranges.range(..e).map(|(a, b)| (*a, *b)) {
                if oe <= cursor {
                    continue;
                }
                if os > cursor {
                    out.ranges.insert(cursor, os.min(e));
                }
                cursor = cursor.max(oe);
                if cursor >= e {
                    break;
                }
            }
            if cursor < e {
                out.ranges.insert(cursor, e);
            }
        }
        out
    }

    /// Whether every byte of `other` is in `self`.
    pub fn contains_set(&self, other: &IntervalSet) -> bool {
        other.subtract(self).is_empty()
    }

    /// Whether `[offset, offset + len)` is fully covered.
    pub fn contains_range(&self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        match self.ranges.range(..=offset).next_back() {
            Some((_, &e)) => e >= offset.saturating_add(len),
            None => false,
        }
    }

    /// Restrict to `[0, size)`.
    pub fn clipped(&self, size: u64) -> IntervalSet {
        self.intersection(&IntervalSet::from_range(0, size))
    }

    /// Restrict to `[from, to)`.
    pub fn window(&self, from: u64, to: u64) -> IntervalSet {
        if to <= from {
            return IntervalSet::new();
        }
        self.intersection(&IntervalSet::from_range(from, to - from))
    }

    /// The first `max_len` bytes of this set at or after `offset`.
    pub fn span_of(&self, offset: u64, max_len: u64) -> IntervalSet {
        let mut out = IntervalSet::new();
        let mut remaining = max_len;
        for (s, e) in self.iter() {
            if remaining == 0 {
                break;
            }
            if e <= offset {
                continue;
            }
            let start = s.max(offset);
            let take = (e - start).min(remaining);
            out.ranges.insert(start, start + take);
            remaining -= take;
        }
        out
    }
}
