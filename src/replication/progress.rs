//! Progress cursor
//!
//! Tracks how far one object's data and omap transfer has advanced in one
//! direction. Cursors only move forward; a recovery that must go back
//! starts over with `ProgressCursor::initial`.
//!
//! Completeness is derived from range coverage, never from round counts
//! or from a peer's claim.

use serde::{Deserialize, Serialize};

use super::interval::IntervalSet;

/// Position in the omap key space.
///
/// Variant order matters: `Start < After(_) < End`, and `After` compares
/// by key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OmapCursor {
    /// Nothing transferred yet
    Start,
    /// Every key up to and including this one transferred
    After(String),
    /// End marker reached
    End,
}

impl OmapCursor {
    /// Key after which the next read starts, if any.
    pub fn resume_after(&self) -> Option<&str> {
        match self {
            OmapCursor::After(key) => Some(key.as_str()),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, OmapCursor::End)
    }
}

/// Transfer progress for one object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCursor {
    /// Data offset reached so far
    pub data_recovered_to: u64,
    /// Omap key cursor
    pub omap: OmapCursor,
    /// No round has completed yet
    pub first: bool,
    pub data_complete: bool,
    pub omap_complete: bool,
}

impl ProgressCursor {
    /// Cursor for a fresh recovery. An omap that need not be copied starts
    /// at its end marker.
    pub fn initial(copy_omap: bool) -> Self {
        let omap = if copy_omap {
            OmapCursor::Start
        } else {
            OmapCursor::End
        };
        Self {
            data_recovered_to: 0,
            omap_complete: omap.is_end(),
            omap,
            first: true,
            data_complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.data_complete && self.omap_complete
    }
}

/// What a round delivered, as seen by whoever merges it.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedProgress<'a> {
    /// Ranges that must be copied in total
    pub copy_subset: &'a IntervalSet,
    /// Union of all ranges accounted for so far, holes included
    pub covered: &'a IntervalSet,
    /// Offset the round reached
    pub data_recovered_to: u64,
    /// Omap cursor the round reached
    pub omap: &'a OmapCursor,
}

/// Fold a round into the previous cursor.
pub fn merge(previous: &ProgressCursor, received: &ReceivedProgress<'_>) -> ProgressCursor {
    let omap = previous.omap.clone().max(received.omap.clone());
    ProgressCursor {
        data_recovered_to: previous.data_recovered_to.max(received.data_recovered_to),
        omap_complete: omap.is_end(),
        omap,
        first: false,
        data_complete: previous.data_complete
            || received.covered.contains_set(received.copy_subset),
    }
}
