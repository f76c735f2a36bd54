//! Persistence gate
//!
//! Recovery spans many asynchronous rounds; the membership epoch may
//! advance underneath it. The gate is the single checkpoint where recovered
//! state reaches the store: it commits only if the epoch the recovery
//! started in is still current, and never installs a version older than
//! the one the store already holds.
//!
//! The epoch check and the store submission run under the read side of an
//! `EpochFence`; epoch changes take the write side, so no change can land
//! between check and submit.

use std::sync::{RwLock, RwLockReadGuard};

use super::errors::{RecoveryError, RecoveryResult};
use super::membership::Membership;
use super::store::{ObjectStore, StoreError, Transaction};
use super::types::{Epoch, RecoveryInfo};
use crate::observability::{log_event, Event};

/// Outcome of a gated commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Transaction applied, missing status cleared
    Committed,
    /// Epoch moved on; transaction discarded
    StaleEpoch,
    /// Store already holds a newer version; transaction discarded
    Superseded,
}

impl GateOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Serialises epoch changes against gated commits.
#[derive(Debug)]
pub struct EpochFence {
    epoch: RwLock<Epoch>,
}

impl EpochFence {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch: RwLock::new(epoch),
        }
    }

    pub fn current(&self) -> Epoch {
        *self.hold()
    }

    /// Publish a new epoch. Blocks until in-flight commits finish.
    pub fn advance(&self, epoch: Epoch) {
        let mut guard = self
            .epoch
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = epoch;
    }

    fn hold(&self) -> RwLockReadGuard<'_, Epoch> {
        self.epoch
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Epoch-guarded finalisation of recovered state.
pub struct PersistenceGate<'a> {
    store: &'a dyn ObjectStore,
    membership: &'a dyn Membership,
    fence: &'a EpochFence,
}

impl<'a> PersistenceGate<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        membership: &'a dyn Membership,
        fence: &'a EpochFence,
    ) -> Self {
        Self {
            store,
            membership,
            fence,
        }
    }

    /// Commit `tx` for `info` if `epoch_at_start` is still current.
    ///
    /// A tombstone (`is_delete`) is refused the same way as data when the
    /// store holds a newer version.
    pub fn commit(
        &self,
        info: &RecoveryInfo,
        is_delete: bool,
        epoch_at_start: Epoch,
        tx: Transaction,
    ) -> RecoveryResult<GateOutcome> {
        let object = &info.object;
        let fenced = self.fence.hold();
        let current = self.membership.current_epoch();

        if epoch_at_start != *fenced || epoch_at_start != current {
            log_event(
                Event::CommitStale,
                &[
                    ("object", &object.to_string()),
                    ("started", &epoch_at_start.to_string()),
                    ("current", &current.max(*fenced).to_string()),
                ],
            );
            return Ok(GateOutcome::StaleEpoch);
        }

        if let Some(meta) = self.store.stat(object)? {
            if meta.version > info.version {
                log_event(
                    Event::CommitSuperseded,
                    &[
                        ("object", &object.to_string()),
                        ("held", &meta.version.to_string()),
                        ("recovered", &info.version.to_string()),
                    ],
                );
                return Ok(GateOutcome::Superseded);
            }
        }

        if let Err(e) = self.store.submit(tx) {
            log_event(
                Event::CommitFailed,
                &[("object", &object.to_string()), ("error", &e.to_string())],
            );
            return Err(match e {
                StoreError::Failed(obj, msg) => RecoveryError::StoreCommitFailed(obj, msg),
                other => RecoveryError::StoreCommitFailed(object.clone(), other.to_string()),
            });
        }

        let local = self.membership.local_shard();
        self.membership.mark_recovered(local, object, info.version);
        if is_delete {
            log_event(
                Event::DeleteApplied,
                &[("object", &object.to_string()), ("version", &info.version.to_string())],
            );
        }
        drop(fenced);

        Ok(GateOutcome::Committed)
    }
}
