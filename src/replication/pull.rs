//! Pull state machine
//!
//! Requesting side of a pull: one instance per object, at most one active
//! at a time (the dispatcher enforces this).
//!
//! ```text
//! Idle → Requested → AwaitingData ⟲ → ReadyToCommit → Committed
//!                           ↘ Aborted (epoch change, stale commit, supplier failure)
//! ```
//!
//! Received rounds accumulate into a transaction owned exclusively by the
//! machine; nothing reaches the store before the persistence gate.

use super::assembly::{AssembledObject, Assembly};
use super::errors::{RecoveryError, RecoveryResult};
use super::gate::{GateOutcome, PersistenceGate};
use super::messages::{MessageBody, PullRequest, PushPayload, RecoveryFailure};
use super::op::{OpContext, OpStep, Outgoing, RecoveryOp};
use super::store::Transaction;
use super::types::{Epoch, ObjectKey, RecoveryInfo, RecoveryStats, ShardId};

/// Pull lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    /// Created, no request issued
    Idle,

    /// Request being issued
    Requested,

    /// Waiting for the supplier's next round
    AwaitingData,

    /// All rounds received, transaction awaits the gate
    ReadyToCommit,

    /// Transaction applied
    Committed,

    /// Torn down; nothing was applied
    Aborted,
}

/// Outcome of consuming a push round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStep {
    /// Ask for the next round
    Continue(PullRequest),
    ReadyToCommit,
    /// Round did not match the outstanding request
    Ignored,
}

/// Requesting-side state for one object.
#[derive(Debug)]
pub struct PullStateMachine {
    object: ObjectKey,

    /// Supplier
    from: ShardId,

    /// Epoch the pull started in
    epoch: Epoch,

    state: PullState,

    /// Current round number
    round: u32,

    /// Present until committed or aborted
    assembly: Option<Assembly>,

    /// Last request sent, for resend after reconnect
    outstanding: Option<PullRequest>,

    stats: RecoveryStats,
}

impl PullStateMachine {
    /// New pull of `info` from `from`, accumulating into `transaction`.
    pub fn new(info: RecoveryInfo, from: ShardId, epoch: Epoch, transaction: Transaction) -> Self {
        Self {
            object: info.object.clone(),
            from,
            epoch,
            state: PullState::Idle,
            round: 0,
            assembly: Some(Assembly::new(info, transaction)),
            outstanding: None,
            stats: RecoveryStats::default(),
        }
    }

    pub fn state(&self) -> PullState {
        self.state
    }

    pub fn from(&self) -> ShardId {
        self.from
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn stats(&self) -> &RecoveryStats {
        self.assembly
            .as_ref()
            .map(|a| a.stats())
            .unwrap_or(&self.stats)
    }

    /// Last request sent, if a round is outstanding.
    pub fn outstanding(&self) -> Option<&PullRequest> {
        self.outstanding.as_ref()
    }

    /// Issue the first pull request.
    pub fn initiate(&mut self) -> RecoveryResult<PullRequest> {
        if self.state != PullState::Idle {
            return Err(RecoveryError::illegal_transition(format!(
                "pull of {} initiated in state {:?}",
                self.object, self.state
            )));
        }
        self.state = PullState::Requested;
        let request = self.next_request()?;
        self.state = PullState::AwaitingData;
        Ok(request)
    }

    /// Consume one round from the supplier.
    pub fn on_push_received(&mut self, payload: &PushPayload) -> RecoveryResult<PullStep> {
        if self.state != PullState::AwaitingData {
            return Err(RecoveryError::illegal_transition(format!(
                "push for {} received in state {:?}",
                self.object, self.state
            )));
        }
        if payload.round != self.round {
            return Ok(PullStep::Ignored);
        }

        let assembly = self.assembly_mut()?;
        let complete = assembly.apply(payload)?.is_complete();
        self.outstanding = None;

        if complete {
            self.state = PullState::ReadyToCommit;
            return Ok(PullStep::ReadyToCommit);
        }
        Ok(PullStep::Continue(self.next_request()?))
    }

    /// The supplier gave up on the outstanding round.
    ///
    /// Aborts and returns the supplier's error; a failure for another round
    /// is ignored.
    pub fn on_failure(&mut self, failure: &RecoveryFailure) -> RecoveryResult<PullStep> {
        if self.state != PullState::AwaitingData || failure.round != self.round {
            return Ok(PullStep::Ignored);
        }
        self.abort();
        Err(failure.to_error())
    }

    /// Finalise through the gate.
    ///
    /// A stale or superseded commit leaves the machine `Aborted`; a store
    /// failure aborts it and is returned.
    pub fn commit(&mut self, gate: &PersistenceGate<'_>) -> RecoveryResult<GateOutcome> {
        if self.state != PullState::ReadyToCommit {
            return Err(RecoveryError::illegal_transition(format!(
                "commit of {} in state {:?}",
                self.object, self.state
            )));
        }
        let assembly = self
            .assembly
            .take()
            .ok_or_else(|| RecoveryError::UnknownRecovery(self.object.clone()))?;
        let AssembledObject {
            info,
            transaction,
            stats,
        } = assembly.finish()?;
        self.stats = stats;

        match gate.commit(&info, false, self.epoch, transaction) {
            Ok(GateOutcome::Committed) => {
                self.state = PullState::Committed;
                Ok(GateOutcome::Committed)
            }
            Ok(other) => {
                self.state = PullState::Aborted;
                Ok(other)
            }
            Err(e) => {
                self.state = PullState::Aborted;
                Err(e)
            }
        }
    }

    /// Drop accumulated state without applying it.
    pub fn abort(&mut self) {
        self.assembly = None;
        self.outstanding = None;
        self.state = PullState::Aborted;
    }

    fn next_request(&mut self) -> RecoveryResult<PullRequest> {
        let round = self.round + 1;
        let assembly = self.assembly_mut()?;
        let info = assembly.info();
        let request = PullRequest {
            object: info.object.clone(),
            version: info.version,
            copy_subset: info.copy_subset.clone(),
            copy_omap: info.copy_omap,
            cursor: assembly.cursor().clone(),
            round,
        };
        self.round = round;
        self.outstanding = Some(request.clone());
        Ok(request)
    }

    fn assembly_mut(&mut self) -> RecoveryResult<&mut Assembly> {
        self.assembly
            .as_mut()
            .ok_or_else(|| RecoveryError::UnknownRecovery(self.object.clone()))
    }
}

impl RecoveryOp for PullStateMachine {
    fn object(&self) -> &ObjectKey {
        &self.object
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            PullState::Idle => "idle",
            PullState::Requested => "requested",
            PullState::AwaitingData => "awaiting_data",
            PullState::ReadyToCommit => "ready_to_commit",
            PullState::Committed => "committed",
            PullState::Aborted => "aborted",
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, PullState::Committed | PullState::Aborted)
    }

    fn initiate(&mut self, _ctx: &OpContext<'_>) -> RecoveryResult<Vec<Outgoing>> {
        let request = PullStateMachine::initiate(self)?;
        Ok(vec![(self.from, MessageBody::Pull(request))])
    }

    fn handle_message(
        &mut self,
        _ctx: &OpContext<'_>,
        from: ShardId,
        body: &MessageBody,
    ) -> RecoveryResult<OpStep> {
        if from != self.from {
            return Ok(OpStep::Ignored);
        }
        let step = match body {
            MessageBody::Push(payload) => self.on_push_received(payload)?,
            MessageBody::Failure(failure) => self.on_failure(failure)?,
            other => {
                return Err(RecoveryError::illegal_transition(format!(
                    "pull of {} cannot consume {}",
                    self.object,
                    other.kind()
                )))
            }
        };
        Ok(match step {
            PullStep::Continue(request) => OpStep::Send(vec![(self.from, MessageBody::Pull(request))]),
            PullStep::ReadyToCommit => OpStep::ReadyToCommit,
            PullStep::Ignored => OpStep::Ignored,
        })
    }

    fn on_epoch_changed(&mut self, _epoch: Epoch) {
        self.abort();
    }

    fn outstanding_for(&self, peer: ShardId) -> Vec<MessageBody> {
        match &self.outstanding {
            Some(request) if peer == self.from && self.state == PullState::AwaitingData => {
                vec![MessageBody::Pull(request.clone())]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::config::RecoveryConfig;
    use crate::replication::gate::EpochFence;
    use crate::replication::membership::StaticMembership;
    use crate::replication::push::build_push_payload;
    use crate::replication::store::{MemoryStore, ObjectStore};
    use crate::replication::types::{MissingItem, VersionStamp};

    fn key() -> ObjectKey {
        ObjectKey::new("pulled")
    }

    fn version() -> VersionStamp {
        VersionStamp::new(4, 1)
    }

    fn machine(missing: &MissingItem) -> PullStateMachine {
        let info = RecoveryInfo::for_missing(key(), missing, None);
        PullStateMachine::new(info, ShardId::new(1), Epoch::new(4), Transaction::new(key()))
    }

    /// Serve `request` from `source` the way a supplier would.
    fn serve(source: &MemoryStore, request: &PullRequest, max_bytes: u64) -> PushPayload {
        let mut info = RecoveryInfo::for_missing(key(), &MissingItem::whole(request.version), None);
        info.copy_subset = request.copy_subset.clone();
        info.copy_omap = request.copy_omap;
        let budget = RecoveryConfig::with_max_push_bytes(max_bytes).budget();
        build_push_payload(source, &info, &request.cursor, budget, request.round)
            .unwrap()
            .0
    }

    #[test]
    fn test_initiate_moves_to_awaiting_data() {
        let mut pull = machine(&MissingItem::whole(version()));
        let request = pull.initiate().unwrap();

        assert_eq!(pull.state(), PullState::AwaitingData);
        assert_eq!(request.round, 1);
        assert!(request.cursor.first);
        assert!(pull.outstanding().is_some());
    }

    #[test]
    fn test_initiate_twice_is_illegal() {
        let mut pull = machine(&MissingItem::whole(version()));
        pull.initiate().unwrap();
        assert!(matches!(
            pull.initiate(),
            Err(RecoveryError::IllegalTransition(_))
        ));
    }

    #[test]
    fn test_multi_round_pull_commits() {
        let source = MemoryStore::new();
        let data: Vec<u8> = (0..250u32).map(|b| b as u8).collect();
        source.put_object(key(), version(), data.clone());

        let mut pull = machine(&MissingItem::whole(version()));
        let mut request = pull.initiate().unwrap();
        loop {
            let payload = serve(&source, &request, 100);
            match pull.on_push_received(&payload).unwrap() {
                PullStep::Continue(next) => request = next,
                PullStep::ReadyToCommit => break,
                PullStep::Ignored => panic!("round mismatch"),
            }
        }
        assert_eq!(pull.round(), 3);

        let local = MemoryStore::new();
        let membership = StaticMembership::new([ShardId::new(0), ShardId::new(1)], Epoch::new(4));
        let fence = EpochFence::new(Epoch::new(4));
        let gate = PersistenceGate::new(&local, &membership, &fence);

        assert_eq!(pull.commit(&gate).unwrap(), GateOutcome::Committed);
        assert_eq!(pull.state(), PullState::Committed);
        assert_eq!(local.get(&key()).unwrap().data, data);
        assert_eq!(local.stat(&key()).unwrap().unwrap().version, version());
    }

    #[test]
    fn test_mismatched_round_is_ignored() {
        let source = MemoryStore::new();
        source.put_object(key(), version(), vec![1; 10]);

        let mut pull = machine(&MissingItem::whole(version()));
        let request = pull.initiate().unwrap();
        let mut payload = serve(&source, &request, 100);
        payload.round = 7;

        assert_eq!(pull.on_push_received(&payload).unwrap(), PullStep::Ignored);
        assert_eq!(pull.state(), PullState::AwaitingData);
    }

    #[test]
    fn test_stale_commit_aborts() {
        let source = MemoryStore::new();
        source.put_object(key(), version(), vec![1; 10]);

        let mut pull = machine(&MissingItem::whole(version()));
        let request = pull.initiate().unwrap();
        let payload = serve(&source, &request, 100);
        assert_eq!(pull.on_push_received(&payload).unwrap(), PullStep::ReadyToCommit);

        let local = MemoryStore::new();
        let membership = StaticMembership::new([ShardId::new(0)], Epoch::new(5));
        let fence = EpochFence::new(Epoch::new(5));
        let gate = PersistenceGate::new(&local, &membership, &fence);

        assert_eq!(pull.commit(&gate).unwrap(), GateOutcome::StaleEpoch);
        assert_eq!(pull.state(), PullState::Aborted);
        assert_eq!(local.submits(), 0);
    }

    #[test]
    fn test_push_after_abort_is_illegal() {
        let mut pull = machine(&MissingItem::whole(version()));
        let request = pull.initiate().unwrap();
        RecoveryOp::on_epoch_changed(&mut pull, Epoch::new(5));

        let source = MemoryStore::new();
        source.put_object(key(), version(), vec![1; 10]);
        let payload = serve(&source, &request, 100);
        assert!(pull.on_push_received(&payload).is_err());
        assert!(RecoveryOp::outstanding_for(&pull, ShardId::new(1)).is_empty());
    }

    #[test]
    fn test_supplier_failure_aborts_outstanding_round() {
        let mut pull = machine(&MissingItem::whole(version()));
        pull.initiate().unwrap();

        let other_round = RecoveryFailure::new(key(), 4, &RecoveryError::ObjectNotFound(key()));
        assert_eq!(pull.on_failure(&other_round).unwrap(), PullStep::Ignored);
        assert_eq!(pull.state(), PullState::AwaitingData);

        let failure = RecoveryFailure::new(
            key(),
            1,
            &RecoveryError::corrupted(&key(), "checksum mismatch"),
        );
        let store = MemoryStore::new();
        let ctx = OpContext {
            store: &store,
            budget: RecoveryConfig::default().budget(),
        };
        let body = MessageBody::Failure(failure);
        assert!(matches!(
            RecoveryOp::handle_message(&mut pull, &ctx, ShardId::new(1), &body),
            Err(RecoveryError::ObjectCorrupted(..))
        ));
        assert_eq!(pull.state(), PullState::Aborted);
        assert!(RecoveryOp::outstanding_for(&pull, ShardId::new(1)).is_empty());
    }

    #[test]
    fn test_zero_length_object_single_round() {
        let source = MemoryStore::new();
        source.put_object(key(), version(), Vec::new());

        let mut pull = machine(&MissingItem::whole(version()));
        let request = pull.initiate().unwrap();
        let payload = serve(&source, &request, 100);

        assert!(payload.data.is_empty());
        assert_eq!(pull.on_push_received(&payload).unwrap(), PullStep::ReadyToCommit);
    }
}
