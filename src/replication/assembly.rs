//! Object assembly on the receiving side
//!
//! Both a pulling shard and a replica receiving pushes fold incoming rounds
//! into a single transaction that is only submitted, through the
//! persistence gate, once the cursor reports completion.
//!
//! - Bytes outside the still-needed set are dropped
//! - Holes inside a round's window become zero ops
//! - The first round resets the target (remove/touch when creating,
//!   truncate, omap clear, attrs)
//! - Applying the same round twice changes nothing

use std::collections::BTreeMap;

use super::errors::{RecoveryError, RecoveryResult};
use super::interval::IntervalSet;
use super::messages::PushPayload;
use super::progress::{merge, OmapCursor, ProgressCursor, ReceivedProgress};
use super::reconcile::{trim, zero_fill};
use super::store::Transaction;
use super::types::{RecoveryInfo, RecoveryStats};

/// Completed assembly, ready for the gate.
#[derive(Debug)]
pub struct AssembledObject {
    pub info: RecoveryInfo,
    pub transaction: Transaction,
    pub stats: RecoveryStats,
}

/// Accumulates rounds of one object.
#[derive(Debug)]
pub struct Assembly {
    /// Recovery description; `size` and `version` settle on the first round
    info: RecoveryInfo,

    /// Progress merged so far
    cursor: ProgressCursor,

    /// Needed ranges accounted for, written or zero-filled
    covered: IntervalSet,

    /// Pending transaction
    transaction: Transaction,

    stats: RecoveryStats,
}

impl Assembly {
    pub fn new(info: RecoveryInfo, transaction: Transaction) -> Self {
        Self {
            cursor: ProgressCursor::initial(info.copy_omap),
            info,
            covered: IntervalSet::new(),
            transaction,
            stats: RecoveryStats::default(),
        }
    }

    pub fn info(&self) -> &RecoveryInfo {
        &self.info
    }

    pub fn cursor(&self) -> &ProgressCursor {
        &self.cursor
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.cursor.is_complete()
    }

    /// Needed ranges not yet accounted for.
    pub fn remaining(&self) -> IntervalSet {
        self.info.copy_subset.subtract(&self.covered)
    }

    /// Fold one round into the pending transaction.
    pub fn apply(&mut self, payload: &PushPayload) -> RecoveryResult<&ProgressCursor> {
        if payload.object != self.info.object {
            return Err(RecoveryError::malformed(format!(
                "push for {} delivered to assembly of {}",
                payload.object, self.info.object
            )));
        }
        let size = payload.info.size.ok_or_else(|| {
            RecoveryError::malformed(format!("push for {} carries no size", payload.object))
        })?;

        let first = self.cursor.first;
        if first {
            self.settle(payload, size)?;
        } else if payload.info.version != self.info.version || Some(size) != self.info.size {
            return Err(RecoveryError::malformed(format!(
                "push for {} changed version or size mid-recovery",
                payload.object
            )));
        }

        let remaining = self.remaining();
        let trimmed = trim(&remaining, &payload.data_included, &payload.data)?;

        let from = self.cursor.data_recovered_to;
        let to = payload.after.data_recovered_to;
        let holes = zero_fill(&remaining, from, to, &trimmed.ranges);

        let fresh: BTreeMap<String, Vec<u8>> = payload
            .omap_entries
            .iter()
            .filter(|(key, _)| OmapCursor::After((*key).clone()) > self.cursor.omap)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if first {
            self.reset_target(payload, size);
        }
        for (offset, bytes) in trimmed.extents() {
            self.transaction.write(offset, bytes.to_vec());
        }
        for (start, end) in holes.iter() {
            self.transaction.zero(start, end - start);
        }
        self.stats.bytes += trimmed.data.len() as u64;
        self.stats.omap_keys += fresh.len() as u64;
        self.stats.rounds += 1;
        self.transaction.write_omap(fresh);

        self.covered.union_with(&trimmed.ranges);
        self.covered.union_with(&holes);

        self.cursor = merge(
            &self.cursor,
            &ReceivedProgress {
                copy_subset: &self.info.copy_subset,
                covered: &self.covered,
                data_recovered_to: to,
                omap: &payload.after.omap,
            },
        );

        Ok(&self.cursor)
    }

    /// Hand over the transaction once every needed range and omap key has
    /// arrived.
    pub fn finish(self) -> RecoveryResult<AssembledObject> {
        if !self.cursor.is_complete() {
            return Err(RecoveryError::illegal_transition(format!(
                "assembly of {} finished before completion",
                self.info.object
            )));
        }
        let mut transaction = self.transaction;
        transaction.set_version(self.info.version);
        Ok(AssembledObject {
            info: self.info,
            transaction,
            stats: self.stats,
        })
    }

    /// Adopt the supplier's version and size from the first round.
    fn settle(&mut self, payload: &PushPayload, size: u64) -> RecoveryResult<()> {
        if payload.info.version < self.info.version {
            return Err(RecoveryError::malformed(format!(
                "supplier holds {} at {}, {} is needed",
                payload.object, payload.info.version, self.info.version
            )));
        }
        if let Some(expected) = self.info.size {
            if expected != size {
                return Err(RecoveryError::malformed(format!(
                    "push for {} reports size {}, expected {}",
                    payload.object, size, expected
                )));
            }
        }
        let mut info = self.info.clone().with_size(size);
        info.version = payload.info.version;
        self.info = info;
        Ok(())
    }

    fn reset_target(&mut self, payload: &PushPayload, size: u64) {
        let tx = &mut self.transaction;
        if self.info.creating {
            tx.remove();
            tx.touch();
        } else if self.info.copy_omap {
            tx.clear_omap();
        }
        tx.truncate(size);
        if self.info.copy_omap {
            if let Some(header) = &payload.omap_header {
                tx.set_omap_header(header.clone());
            }
        }
        if let Some(attrs) = &payload.attrs {
            tx.set_attrs(attrs.clone());
        }
    }
}
