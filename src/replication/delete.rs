//! Delete propagation
//!
//! Replicates a tombstone to every shard that still holds the object. No
//! data body is transferred; the record only tracks which shards have yet
//! to acknowledge.

use std::collections::BTreeSet;

use super::errors::{RecoveryError, RecoveryResult};
use super::messages::{DeleteReply, DeleteRequest, MessageBody};
use super::op::{OpContext, OpStep, Outgoing, RecoveryOp};
use super::types::{Epoch, ObjectKey, ShardId, VersionStamp};

/// Delete propagation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    /// Waiting for acknowledgments
    Pending,
    /// Every target acknowledged
    Complete,
    /// Torn down by an epoch change
    Aborted,
}

/// Outcome of consuming a delete reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    /// Shards still pending
    Pending(usize),
    Complete,
    /// Reply from a shard not pending
    Ignored,
}

/// Tombstone replication for one object.
#[derive(Debug)]
pub struct DeletePropagation {
    object: ObjectKey,
    version: VersionStamp,
    epoch: Epoch,
    pending: BTreeSet<ShardId>,
    state: DeleteState,
}

impl DeletePropagation {
    /// Track the tombstone of `object` at `version` towards `targets`.
    pub fn new(
        object: ObjectKey,
        version: VersionStamp,
        targets: BTreeSet<ShardId>,
        epoch: Epoch,
    ) -> Self {
        let state = if targets.is_empty() {
            DeleteState::Complete
        } else {
            DeleteState::Pending
        };
        Self {
            object,
            version,
            epoch,
            pending: targets,
            state,
        }
    }

    pub fn state(&self) -> DeleteState {
        self.state
    }

    pub fn version(&self) -> VersionStamp {
        self.version
    }

    /// Shards that have not acknowledged yet.
    pub fn pending(&self) -> &BTreeSet<ShardId> {
        &self.pending
    }

    /// One request per pending shard.
    pub fn requests(&self) -> Vec<(ShardId, DeleteRequest)> {
        self.pending
            .iter()
            .map(|shard| (*shard, self.request()))
            .collect()
    }

    pub fn on_delete_reply(&mut self, from: ShardId, reply: &DeleteReply) -> DeleteStep {
        if self.state != DeleteState::Pending
            || reply.object != self.object
            || !self.pending.remove(&from)
        {
            return DeleteStep::Ignored;
        }
        if self.pending.is_empty() {
            self.state = DeleteState::Complete;
            DeleteStep::Complete
        } else {
            DeleteStep::Pending(self.pending.len())
        }
    }

    pub fn abort(&mut self) {
        self.pending.clear();
        self.state = DeleteState::Aborted;
    }

    fn request(&self) -> DeleteRequest {
        DeleteRequest {
            object: self.object.clone(),
            version: self.version,
        }
    }
}

impl RecoveryOp for DeletePropagation {
    fn object(&self) -> &ObjectKey {
        &self.object
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            DeleteState::Pending => "pending",
            DeleteState::Complete => "complete",
            DeleteState::Aborted => "aborted",
        }
    }

    fn is_finished(&self) -> bool {
        self.state != DeleteState::Pending
    }

    fn initiate(&mut self, _ctx: &OpContext<'_>) -> RecoveryResult<Vec<Outgoing>> {
        Ok(self
            .requests()
            .into_iter()
            .map(|(shard, request)| (shard, MessageBody::Delete(request)))
            .collect())
    }

    fn handle_message(
        &mut self,
        _ctx: &OpContext<'_>,
        from: ShardId,
        body: &MessageBody,
    ) -> RecoveryResult<OpStep> {
        let MessageBody::DeleteReply(reply) = body else {
            return Err(RecoveryError::illegal_transition(format!(
                "delete of {} cannot consume {}",
                self.object,
                body.kind()
            )));
        };
        Ok(match self.on_delete_reply(from, reply) {
            DeleteStep::Pending(_) => OpStep::Send(Vec::new()),
            DeleteStep::Complete => OpStep::Complete,
            DeleteStep::Ignored => OpStep::Ignored,
        })
    }

    fn on_epoch_changed(&mut self, _epoch: Epoch) {
        self.abort();
    }

    fn outstanding_for(&self, peer: ShardId) -> Vec<MessageBody> {
        if self.state == DeleteState::Pending && self.pending.contains(&peer) {
            vec![MessageBody::Delete(self.request())]
        } else {
            Vec::new()
        }
    }
}
