//! Core recovery identities
//!
//! - `ObjectKey`: stable identity of one logical object inside a shard
//! - `VersionStamp`: (epoch, counter) total order over object mutations
//! - `Epoch`: membership generation of the shard
//! - `ShardId`: one member of the replica set
//!
//! These are pure types. Ordering is derived and lexicographic.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::interval::IntervalSet;

/// Membership generation number.
///
/// Every per-object recovery record is scoped to exactly one epoch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Epoch(u64);

impl Epoch {
    /// Creates an epoch with the given value.
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The epoch following this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Identity of one member of the shard's replica set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ShardId(u32);

impl ShardId {
    #[inline]
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard.{}", self.0)
    }
}

/// Logical object identity within a shard.
///
/// Used as the key of every per-object recovery record. A key is never
/// reused for a different logical object.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace the object lives in (may be empty)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key in the default namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Total-order version marker for object mutations.
///
/// Comparison is lexicographic on (epoch, counter); the field order below
/// is what the derived `Ord` relies on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub epoch: u64,
    pub counter: u64,
}

impl VersionStamp {
    pub fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.counter)
    }
}

/// What a shard is missing for one object, as reported by the membership
/// authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    /// Version the shard must reach
    pub need: VersionStamp,
    /// Version the shard currently holds, if any
    pub have: Option<VersionStamp>,
    /// Byte ranges that differ; `None` means the whole object
    pub dirty_data: Option<IntervalSet>,
    /// Whether the omap differs
    pub omap_dirty: bool,
}

impl MissingItem {
    /// The shard lacks the object entirely (or must rewrite all of it).
    pub fn whole(need: VersionStamp) -> Self {
        Self {
            need,
            have: None,
            dirty_data: None,
            omap_dirty: true,
        }
    }

    /// The shard holds `have`; only `dirty_data` and optionally omap differ.
    pub fn partial(
        need: VersionStamp,
        have: VersionStamp,
        dirty_data: IntervalSet,
        omap_dirty: bool,
    ) -> Self {
        Self {
            need,
            have: Some(have),
            dirty_data: Some(dirty_data),
            omap_dirty,
        }
    }
}

/// Immutable-once-built description of one object's recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub object: ObjectKey,
    /// Version being recovered to
    pub version: VersionStamp,
    /// Object size in bytes; `None` until the supplier reports it
    pub size: Option<u64>,
    /// Byte ranges that must be copied
    pub copy_subset: IntervalSet,
    /// Whether the omap must be copied
    pub copy_omap: bool,
    /// Tombstone recovery
    pub is_delete: bool,
    /// Target does not hold a usable copy; object is (re)created
    pub creating: bool,
}

impl RecoveryInfo {
    /// Build the recovery description for a target described by `missing`.
    ///
    /// `size` is the supplier's object size when known.
    pub fn for_missing(object: ObjectKey, missing: &MissingItem, size: Option<u64>) -> Self {
        let creating = missing.have.is_none() || missing.dirty_data.is_none();
        let copy_subset = match (&missing.dirty_data, size) {
            (Some(dirty), Some(size)) => dirty.clipped(size),
            (Some(dirty), None) => dirty.clone(),
            (None, Some(size)) => IntervalSet::from_range(0, size),
            (None, None) => IntervalSet::unbounded(),
        };
        Self {
            object,
            version: missing.need,
            size,
            copy_subset,
            copy_omap: creating || missing.omap_dirty,
            is_delete: false,
            creating,
        }
    }

    /// Tombstone recovery for `object` at `version`.
    pub fn tombstone(object: ObjectKey, version: VersionStamp) -> Self {
        Self {
            object,
            version,
            size: None,
            copy_subset: IntervalSet::new(),
            copy_omap: false,
            is_delete: true,
            creating: false,
        }
    }

    /// Fix the object size, clipping `copy_subset` to it.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self.copy_subset = self.copy_subset.clipped(size);
        self
    }
}

/// Per-object transfer statistics, folded into metrics on completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub bytes: u64,
    pub omap_keys: u64,
    pub rounds: u64,
}

impl RecoveryStats {
    pub fn add(&mut self, other: &RecoveryStats) {
        self.bytes += other.bytes;
        self.omap_keys += other.omap_keys;
        self.rounds += other.rounds;
    }
}
