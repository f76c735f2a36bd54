//! Push state machine
//!
//! Supplying side: one instance per (object, target shard). Each round
//! reads at most the configured budget of still-missing data and omap from
//! the local store and advances a tentative cursor; the target's reply
//! confirms it.
//!
//! ```text
//! Idle → AwaitingReply ⟲ → Complete
//!            ↘ Failed (local read failed, target gave up)   ↘ Aborted (epoch change)
//! ```
//!
//! A failed read is a hard failure for the pair and is never retried. A
//! target that cannot apply or commit a round answers with a failure
//! instead of a reply, which fails the pair the same way.
//!
//! The replica side of a push lives here too (`PushReceiver`).

use std::collections::BTreeMap;

use super::assembly::{AssembledObject, Assembly};
use super::config::RoundBudget;
use super::errors::{RecoveryError, RecoveryResult};
use super::gate::{GateOutcome, PersistenceGate};
use super::interval::ByteRange;
use super::messages::{MessageBody, PushPayload, PushReply, RecoveryFailure};
use super::op::{OpContext, OpStep, Outgoing, RecoveryOp};
use super::progress::{merge, OmapCursor, ProgressCursor, ReceivedProgress};
use super::store::{ObjectStore, Transaction};
use super::types::{Epoch, ObjectKey, RecoveryInfo, RecoveryStats, ShardId};

/// Build the round starting at `cursor`.
///
/// Omap entries are read first and share the byte budget with data; at
/// least one entry is sent per round so the omap always advances. An info
/// without a size is sized from the store.
pub fn build_push_payload(
    store: &dyn ObjectStore,
    info: &RecoveryInfo,
    cursor: &ProgressCursor,
    budget: RoundBudget,
    round: u32,
) -> RecoveryResult<(PushPayload, RecoveryStats)> {
    let object = &info.object;
    let meta = store
        .stat(object)?
        .ok_or_else(|| RecoveryError::ObjectNotFound(object.clone()))?;
    if meta.version < info.version {
        return Err(RecoveryError::corrupted(
            object,
            format!("holds {}, {} is needed", meta.version, info.version),
        ));
    }

    let mut info = match info.size {
        Some(_) => info.clone(),
        None => info.clone().with_size(meta.size),
    };
    info.version = meta.version;

    let mut available = budget.max_bytes;
    let mut omap_entries = BTreeMap::new();
    let mut omap_header = None;
    let mut attrs = None;
    let mut omap = cursor.omap.clone();

    if cursor.first {
        attrs = Some(store.attrs(object)?);
        if info.copy_omap {
            omap_header = Some(store.omap_header(object)?);
        }
    }

    if !cursor.omap_complete {
        let (entries, exhausted) =
            store.omap_entries(object, cursor.omap.resume_after(), budget.max_omap_entries)?;
        let mut truncated = false;
        for (key, value) in entries {
            let cost = (key.len() + value.len()) as u64;
            if !omap_entries.is_empty() && cost > available {
                truncated = true;
                break;
            }
            available = available.saturating_sub(cost);
            omap = OmapCursor::After(key.clone());
            omap_entries.insert(key, value);
        }
        if exhausted && !truncated {
            omap = OmapCursor::End;
        }
    }

    let mut data_included = Vec::new();
    let mut data = Vec::new();
    let mut recovered_to = cursor.data_recovered_to;

    if !cursor.data_complete && available > 0 {
        let window = info.copy_subset.span_of(cursor.data_recovered_to, available);
        if let Some(end) = window.range_end() {
            recovered_to = end;
        }
        let extents = store.extents(object, &window)?;
        for (start, end) in extents.iter() {
            let bytes = store.read(object, start, end - start)?;
            data_included.push(ByteRange::new(start, end - start));
            data.extend_from_slice(&bytes);
        }
    }

    let covered = info.copy_subset.window(0, recovered_to);
    let after = merge(
        cursor,
        &ReceivedProgress {
            copy_subset: &info.copy_subset,
            covered: &covered,
            data_recovered_to: recovered_to,
            omap: &omap,
        },
    );

    let stats = RecoveryStats {
        bytes: data.len() as u64,
        omap_keys: omap_entries.len() as u64,
        rounds: 1,
    };
    let payload = PushPayload {
        object: object.clone(),
        info,
        data_included,
        data,
        omap_header,
        omap_entries,
        attrs,
        before: cursor.clone(),
        complete: after.is_complete(),
        after,
        round,
    };
    Ok((payload, stats))
}

/// Push lifecycle for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// No round built yet
    Idle,

    /// A round is in flight
    AwaitingReply,

    /// Target confirmed the final round
    Complete,

    /// Local read failed or the target gave up; not retried
    Failed,

    /// Torn down by an epoch change
    Aborted,
}

/// Outcome of consuming a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStep {
    Next(PushPayload),
    Complete,
    Ignored,
}

/// Supplying-side state for one (object, target) pair.
#[derive(Debug)]
pub struct PushStateMachine {
    info: RecoveryInfo,

    target: ShardId,

    /// Epoch the push started in
    epoch: Epoch,

    state: PushState,

    /// Progress the target has confirmed
    confirmed: ProgressCursor,

    /// Progress of the round in flight
    tentative: Option<ProgressCursor>,

    round: u32,

    /// Round in flight, for resend after reconnect
    outstanding: Option<PushPayload>,

    stats: RecoveryStats,
}

impl PushStateMachine {
    pub fn new(info: RecoveryInfo, target: ShardId, epoch: Epoch) -> Self {
        Self {
            confirmed: ProgressCursor::initial(info.copy_omap),
            info,
            target,
            epoch,
            state: PushState::Idle,
            tentative: None,
            round: 0,
            outstanding: None,
            stats: RecoveryStats::default(),
        }
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    pub fn target(&self) -> ShardId {
        self.target
    }

    pub fn info(&self) -> &RecoveryInfo {
        &self.info
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn confirmed(&self) -> &ProgressCursor {
        &self.confirmed
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    pub fn outstanding(&self) -> Option<&PushPayload> {
        self.outstanding.as_ref()
    }

    /// Read the next round from the confirmed cursor.
    pub fn build_round(
        &mut self,
        store: &dyn ObjectStore,
        budget: RoundBudget,
    ) -> RecoveryResult<PushPayload> {
        if !matches!(self.state, PushState::Idle | PushState::AwaitingReply) || self.tentative.is_some()
        {
            return Err(RecoveryError::illegal_transition(format!(
                "push of {} to {} cannot build a round in state {:?}",
                self.info.object, self.target, self.state
            )));
        }

        let (payload, stats) =
            match build_push_payload(store, &self.info, &self.confirmed, budget, self.round + 1) {
                Ok(built) => built,
                Err(e) => {
                    self.state = PushState::Failed;
                    self.outstanding = None;
                    return Err(e);
                }
            };

        self.round = payload.round;
        self.info = payload.info.clone();
        self.stats.add(&stats);
        self.tentative = Some(payload.after.clone());
        self.outstanding = Some(payload.clone());
        self.state = PushState::AwaitingReply;
        Ok(payload)
    }

    /// Consume the target's reply to the round in flight.
    pub fn on_reply(
        &mut self,
        reply: &PushReply,
        store: &dyn ObjectStore,
        budget: RoundBudget,
    ) -> RecoveryResult<PushStep> {
        if self.state != PushState::AwaitingReply || reply.round != self.round {
            return Ok(PushStep::Ignored);
        }
        let Some(tentative) = self.tentative.take() else {
            return Ok(PushStep::Ignored);
        };
        self.confirmed = tentative;
        self.outstanding = None;

        if self.confirmed.is_complete() {
            self.state = PushState::Complete;
            return Ok(PushStep::Complete);
        }
        self.build_round(store, budget).map(PushStep::Next)
    }

    /// The target gave up on the round in flight.
    pub fn on_failure(&mut self, failure: &RecoveryFailure) -> RecoveryResult<PushStep> {
        if self.state != PushState::AwaitingReply || failure.round != self.round {
            return Ok(PushStep::Ignored);
        }
        self.tentative = None;
        self.outstanding = None;
        self.state = PushState::Failed;
        Err(failure.to_error())
    }

    pub fn abort(&mut self) {
        self.tentative = None;
        self.outstanding = None;
        self.state = PushState::Aborted;
    }
}

impl RecoveryOp for PushStateMachine {
    fn object(&self) -> &ObjectKey {
        &self.info.object
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            PushState::Idle => "idle",
            PushState::AwaitingReply => "awaiting_reply",
            PushState::Complete => "complete",
            PushState::Failed => "failed",
            PushState::Aborted => "aborted",
        }
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            PushState::Complete | PushState::Failed | PushState::Aborted
        )
    }

    fn initiate(&mut self, ctx: &OpContext<'_>) -> RecoveryResult<Vec<Outgoing>> {
        let payload = self.build_round(ctx.store, ctx.budget)?;
        Ok(vec![(self.target, MessageBody::Push(payload))])
    }

    fn handle_message(
        &mut self,
        ctx: &OpContext<'_>,
        from: ShardId,
        body: &MessageBody,
    ) -> RecoveryResult<OpStep> {
        if from != self.target {
            return Ok(OpStep::Ignored);
        }
        let step = match body {
            MessageBody::PushReply(reply) => self.on_reply(reply, ctx.store, ctx.budget)?,
            MessageBody::Failure(failure) => self.on_failure(failure)?,
            other => {
                return Err(RecoveryError::illegal_transition(format!(
                    "push of {} cannot consume {}",
                    self.info.object,
                    other.kind()
                )))
            }
        };
        Ok(match step {
            PushStep::Next(payload) => OpStep::Send(vec![(self.target, MessageBody::Push(payload))]),
            PushStep::Complete => OpStep::Complete,
            PushStep::Ignored => OpStep::Ignored,
        })
    }

    fn on_epoch_changed(&mut self, _epoch: Epoch) {
        self.abort();
    }

    fn outstanding_for(&self, peer: ShardId) -> Vec<MessageBody> {
        match &self.outstanding {
            Some(payload) if peer == self.target => vec![MessageBody::Push(payload.clone())],
            _ => Vec::new(),
        }
    }
}

/// Outcome of a replica consuming a push round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStep {
    /// Acknowledge the round
    Reply(PushReply),
    /// Final round received; commit, then acknowledge
    ReadyToCommit,
}

/// Replica-side accumulation of pushed rounds for one object.
#[derive(Debug)]
pub struct PushReceiver {
    from: ShardId,
    epoch: Epoch,
    round: u32,
    assembly: Option<Assembly>,
}

impl PushReceiver {
    /// Start receiving from the first round of `from`'s push.
    pub fn new(from: ShardId, epoch: Epoch, first: &PushPayload, transaction: Transaction) -> Self {
        Self {
            from,
            epoch,
            round: 0,
            assembly: Some(Assembly::new(first.info.clone(), transaction)),
        }
    }

    pub fn from(&self) -> ShardId {
        self.from
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn on_push(&mut self, payload: &PushPayload) -> RecoveryResult<ReceiveStep> {
        if payload.round <= self.round {
            // Resent round; acknowledge again without reapplying.
            return self.reply(payload.round).map(ReceiveStep::Reply);
        }
        if payload.round != self.round + 1 {
            return Err(RecoveryError::malformed(format!(
                "push for {} skipped from round {} to {}",
                payload.object, self.round, payload.round
            )));
        }
        let assembly = self
            .assembly
            .as_mut()
            .ok_or_else(|| RecoveryError::UnknownRecovery(payload.object.clone()))?;
        let complete = assembly.apply(payload)?.is_complete();
        self.round = payload.round;

        if complete {
            Ok(ReceiveStep::ReadyToCommit)
        } else {
            self.reply(self.round).map(ReceiveStep::Reply)
        }
    }

    /// Commit through the gate; the returned reply acknowledges the final
    /// round and is only meaningful when committed.
    pub fn commit(
        &mut self,
        gate: &PersistenceGate<'_>,
    ) -> RecoveryResult<(GateOutcome, PushReply, RecoveryStats)> {
        let assembly = self
            .assembly
            .take()
            .ok_or_else(|| RecoveryError::illegal_transition("push receiver already committed"))?;
        let cursor = assembly.cursor().clone();
        let AssembledObject {
            info,
            transaction,
            stats,
        } = assembly.finish()?;
        let outcome = gate.commit(&info, false, self.epoch, transaction)?;
        let reply = PushReply {
            object: info.object,
            complete: cursor.is_complete(),
            cursor,
            round: self.round,
        };
        Ok((outcome, reply, stats))
    }

    fn reply(&self, round: u32) -> RecoveryResult<PushReply> {
        let assembly = self
            .assembly
            .as_ref()
            .ok_or_else(|| RecoveryError::illegal_transition("push receiver already committed"))?;
        Ok(PushReply {
            object: assembly.info().object.clone(),
            cursor: assembly.cursor().clone(),
            complete: assembly.is_complete(),
            round,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::config::RecoveryConfig;
    use crate::replication::gate::EpochFence;
    use crate::replication::membership::StaticMembership;
    use crate::replication::store::MemoryStore;
    use crate::replication::types::{MissingItem, VersionStamp};

    const MIB: u64 = 1024 * 1024;

    fn key() -> ObjectKey {
        ObjectKey::new("pushed")
    }

    fn version() -> VersionStamp {
        VersionStamp::new(2, 9)
    }

    fn push_for(store: &MemoryStore, missing: &MissingItem) -> PushStateMachine {
        let size = store.stat(&key()).unwrap().map(|m| m.size);
        let info = RecoveryInfo::for_missing(key(), missing, size);
        PushStateMachine::new(info, ShardId::new(2), Epoch::new(2))
    }

    fn ack(payload: &PushPayload) -> PushReply {
        PushReply {
            object: payload.object.clone(),
            cursor: payload.after.clone(),
            complete: payload.complete,
            round: payload.round,
        }
    }

    #[test]
    fn test_ten_mib_in_three_rounds() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![7; (10 * MIB) as usize]);
        let budget = RecoveryConfig::with_max_push_bytes(4 * MIB).budget();

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let mut payload = push.build_round(&store, budget).unwrap();
        let mut sizes = vec![payload.data_len()];
        loop {
            match push.on_reply(&ack(&payload), &store, budget).unwrap() {
                PushStep::Next(next) => {
                    sizes.push(next.data_len());
                    payload = next;
                }
                PushStep::Complete => break,
                PushStep::Ignored => panic!("reply ignored"),
            }
        }

        assert_eq!(sizes, vec![4 * MIB, 4 * MIB, 2 * MIB]);
        assert!(payload.complete);
        assert_eq!(push.state(), PushState::Complete);
        assert_eq!(push.stats().rounds, 3);
    }

    #[test]
    fn test_first_round_carries_attrs_and_header() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![1; 10]);
        store.update(&key(), |obj| {
            obj.omap_header = b"hdr".to_vec();
            obj.attrs.insert("owner".into(), b"a".to_vec());
        });
        let budget = RecoveryConfig::default().budget();

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let payload = push.build_round(&store, budget).unwrap();

        assert_eq!(payload.omap_header, Some(b"hdr".to_vec()));
        assert!(payload.attrs.unwrap().contains_key("owner"));
        assert!(payload.complete);
    }

    #[test]
    fn test_omap_shares_budget_with_data() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![1; 100]);
        store.update(&key(), |obj| {
            for i in 0..10 {
                obj.omap.insert(format!("k{}", i), vec![0; 18]);
            }
        });
        let budget = RecoveryConfig::with_max_push_bytes(100).budget();

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let first = push.build_round(&store, budget).unwrap();

        // 5 entries of 20 bytes exhaust the budget; no data this round.
        assert_eq!(first.omap_entries.len(), 5);
        assert!(first.data.is_empty());
        assert_eq!(first.after.omap, OmapCursor::After("k4".into()));
        assert!(!first.complete);

        let PushStep::Next(second) = push.on_reply(&ack(&first), &store, budget).unwrap() else {
            panic!("expected another round");
        };
        assert_eq!(second.omap_entries.keys().next().map(String::as_str), Some("k5"));
    }

    #[test]
    fn test_partial_recovery_sends_only_dirty_ranges() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), (0..100u8).collect());
        let dirty = crate::replication::interval::IntervalSet::from_range(40, 10);
        let missing = MissingItem::partial(version(), VersionStamp::new(2, 1), dirty, false);

        let mut push = push_for(&store, &missing);
        let payload = push.build_round(&store, RecoveryConfig::default().budget()).unwrap();

        assert_eq!(payload.data_included, vec![ByteRange::new(40, 10)]);
        assert_eq!(payload.data, (40..50u8).collect::<Vec<_>>());
        assert!(payload.omap_entries.is_empty());
        assert!(payload.complete);
    }

    #[test]
    fn test_corrupted_source_fails_hard() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![1; 10]);
        store.corrupt(&key());

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let result = push.build_round(&store, RecoveryConfig::default().budget());

        assert!(matches!(result, Err(RecoveryError::ObjectCorrupted(..))));
        assert_eq!(push.state(), PushState::Failed);
        assert!(push.build_round(&store, RecoveryConfig::default().budget()).is_err());
    }

    #[test]
    fn test_stale_reply_round_ignored() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![1; 300]);
        let budget = RecoveryConfig::with_max_push_bytes(100).budget();

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let payload = push.build_round(&store, budget).unwrap();
        let mut reply = ack(&payload);
        reply.round = 5;

        assert_eq!(push.on_reply(&reply, &store, budget).unwrap(), PushStep::Ignored);
        assert_eq!(push.confirmed().data_recovered_to, 0);
        assert!(push.outstanding().is_some());
    }

    #[test]
    fn test_target_failure_fails_the_pair() {
        let store = MemoryStore::new();
        store.put_object(key(), version(), vec![1; 300]);
        let budget = RecoveryConfig::with_max_push_bytes(100).budget();

        let mut push = push_for(&store, &MissingItem::whole(version()));
        let first = push.build_round(&store, budget).unwrap();
        let PushStep::Next(second) = push.on_reply(&ack(&first), &store, budget).unwrap() else {
            panic!("expected another round");
        };

        let error = RecoveryError::StoreCommitFailed(key(), "no space".into());
        let late = RecoveryFailure::new(key(), first.round, &error);
        assert_eq!(push.on_failure(&late).unwrap(), PushStep::Ignored);

        let failure = RecoveryFailure::new(key(), second.round, &error);
        assert_eq!(push.on_failure(&failure), Err(error));
        assert_eq!(push.state(), PushState::Failed);
        assert!(RecoveryOp::outstanding_for(&push, ShardId::new(2)).is_empty());
        assert_eq!(push.on_reply(&ack(&second), &store, budget).unwrap(), PushStep::Ignored);
    }

    #[test]
    fn test_receiver_assembles_and_commits() {
        let source = MemoryStore::new();
        source.put_object(key(), version(), (0..=255u8).collect());
        let budget = RecoveryConfig::with_max_push_bytes(100).budget();

        let replica = MemoryStore::new();
        let membership = StaticMembership::new([ShardId::new(1), ShardId::new(2)], Epoch::new(2));
        let view = membership.view(ShardId::new(2));
        let fence = EpochFence::new(Epoch::new(2));
        let gate = PersistenceGate::new(&replica, &view, &fence);

        let mut push = push_for(&source, &MissingItem::whole(version()));
        let mut payload = push.build_round(&source, budget).unwrap();
        let mut receiver =
            PushReceiver::new(ShardId::new(1), Epoch::new(2), &payload, Transaction::new(key()));

        loop {
            match receiver.on_push(&payload).unwrap() {
                ReceiveStep::Reply(reply) => {
                    let PushStep::Next(next) = push.on_reply(&reply, &source, budget).unwrap()
                    else {
                        panic!("supplier finished early");
                    };
                    payload = next;
                }
                ReceiveStep::ReadyToCommit => break,
            }
        }

        let (outcome, reply, stats) = receiver.commit(&gate).unwrap();
        assert!(outcome.is_committed());
        assert!(reply.complete);
        assert_eq!(stats.bytes, 256);
        assert_eq!(push.on_reply(&reply, &source, budget).unwrap(), PushStep::Complete);
        assert_eq!(replica.get(&key()).unwrap().data, (0..=255u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_receiver_reacks_duplicate_round() {
        let source = MemoryStore::new();
        source.put_object(key(), version(), vec![3; 300]);
        let budget = RecoveryConfig::with_max_push_bytes(100).budget();

        let mut push = push_for(&source, &MissingItem::whole(version()));
        let payload = push.build_round(&source, budget).unwrap();
        let mut receiver =
            PushReceiver::new(ShardId::new(1), Epoch::new(2), &payload, Transaction::new(key()));

        let first = receiver.on_push(&payload).unwrap();
        let again = receiver.on_push(&payload).unwrap();
        assert_eq!(first, again);
        assert_eq!(receiver.round(), 1);
    }
}
