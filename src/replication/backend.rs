//! Recovery backend (protocol dispatcher)
//!
//! Owns every per-object recovery record of one shard, keyed by object:
//!
//! - pulls: object → `PullStateMachine` (at most one per object)
//! - pushes: (object, target) → `PushStateMachine`
//! - receivers: object → `PushReceiver` (replica side of a push)
//! - deletes: object → `DeletePropagation`
//!
//! Inbound messages are routed by kind; records are created on first
//! contact and removed on completion, failure or abort. An epoch change
//! clears all maps in one step, and a record found on contact to belong to
//! another epoch is dropped.
//!
//! A shard that gives up on a round (unreadable source, rejected commit)
//! answers with a `Failure` so the peer's record fails instead of waiting.
//!
//! The backend is single-threaded; `ShardService` runs it on one task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;

use super::config::{RecoveryConfig, RoundBudget};
use super::delete::DeletePropagation;
use super::errors::{RecoveryError, RecoveryResult};
use super::gate::{EpochFence, GateOutcome, PersistenceGate};
use super::membership::Membership;
use super::messages::{
    DeleteReply, DeleteRequest, MessageBody, PullRequest, PushPayload, PushReply, RecoveryFailure,
    RecoveryMessage,
};
use super::op::{OpContext, OpStep, Outgoing, RecoveryOp};
use super::pull::{PullState, PullStateMachine};
use super::push::{build_push_payload, PushReceiver, PushState, PushStateMachine, ReceiveStep};
use super::store::ObjectStore;
use super::transport::{Transport, TransportError};
use super::types::{Epoch, MissingItem, ObjectKey, RecoveryInfo, ShardId, VersionStamp};
use crate::observability::{log_event, Event, MetricsRegistry};

/// How an object-level recovery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryOutcome {
    /// Every shard reached the requested version
    Recovered,
    /// Discarded: the epoch changed or a newer version was already held
    Stale,
}

type Waiter = oneshot::Sender<RecoveryResult<RecoveryOutcome>>;

/// Resolves when an object-level recovery finishes.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<RecoveryResult<RecoveryOutcome>>,
}

impl Completion {
    fn channel() -> (Waiter, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    fn ready(result: RecoveryResult<RecoveryOutcome>) -> Self {
        let (sender, completion) = Self::channel();
        let _ = sender.send(result);
        completion
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> RecoveryResult<RecoveryOutcome> {
        self.receiver
            .await
            .unwrap_or(Err(RecoveryError::ServiceStopped))
    }

    /// Outcome if already resolved.
    pub fn try_result(&mut self) -> Option<RecoveryResult<RecoveryOutcome>> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryKind {
    Object,
    Delete,
}

/// Object-level orchestration: pull (if needed), then push to all targets.
#[derive(Debug)]
struct ObjectRecovery {
    kind: RecoveryKind,
    version: VersionStamp,
    /// Push targets not yet settled
    pending_targets: BTreeSet<ShardId>,
    /// First target failure
    failure: Option<RecoveryError>,
    waiters: Vec<Waiter>,
}

/// Counts of active records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BackendStatus {
    pub epoch: u64,
    pub pulls: usize,
    pub pushes: usize,
    pub receivers: usize,
    pub deletes: usize,
    pub objects: usize,
}

impl BackendStatus {
    /// No record of any kind is active.
    pub fn is_idle(&self) -> bool {
        self.pulls + self.pushes + self.receivers + self.deletes + self.objects == 0
    }
}

/// Per-shard recovery backend.
#[derive(Debug)]
pub struct RecoveryBackend {
    config: RecoveryConfig,
    budget: RoundBudget,
    local: ShardId,
    epoch: Epoch,
    fence: EpochFence,

    store: Arc<dyn ObjectStore>,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRegistry>,

    pulls: BTreeMap<ObjectKey, PullStateMachine>,
    pushes: BTreeMap<(ObjectKey, ShardId), PushStateMachine>,
    receivers: BTreeMap<ObjectKey, PushReceiver>,
    deletes: BTreeMap<ObjectKey, DeletePropagation>,
    objects: BTreeMap<ObjectKey, ObjectRecovery>,
}

impl RecoveryBackend {
    pub fn new(
        config: RecoveryConfig,
        store: Arc<dyn ObjectStore>,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsRegistry>,
    ) -> RecoveryResult<Self> {
        config.validate()?;
        let epoch = membership.current_epoch();
        Ok(Self {
            budget: config.budget(),
            config,
            local: membership.local_shard(),
            epoch,
            fence: EpochFence::new(epoch),
            store,
            membership,
            transport,
            metrics,
            pulls: BTreeMap::new(),
            pushes: BTreeMap::new(),
            receivers: BTreeMap::new(),
            deletes: BTreeMap::new(),
            objects: BTreeMap::new(),
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn local_shard(&self) -> ShardId {
        self.local
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            epoch: self.epoch.value(),
            pulls: self.pulls.len(),
            pushes: self.pushes.len(),
            receivers: self.receivers.len(),
            deletes: self.deletes.len(),
            objects: self.objects.len(),
        }
    }

    pub fn pull_state(&self, object: &ObjectKey) -> Option<PullState> {
        self.pulls.get(object).map(|p| p.state())
    }

    pub fn push_state(&self, object: &ObjectKey, target: ShardId) -> Option<PushState> {
        self.pushes.get(&(object.clone(), target)).map(|p| p.state())
    }

    /// Shards that have not acknowledged `object`'s tombstone.
    pub fn pending_deletes(&self, object: &ObjectKey) -> Option<&BTreeSet<ShardId>> {
        self.deletes.get(object).map(|d| d.pending())
    }

    // =========================================================================
    // Shard controller interface
    // =========================================================================

    /// Bring every replica of `object` to at least `version`.
    ///
    /// Pulls first when the local shard is missing the object, then pushes
    /// to each shard that needs it. A second call for an object already in
    /// progress joins the first.
    pub fn recover_object(&mut self, object: ObjectKey, version: VersionStamp) -> Completion {
        self.sync_epoch();
        let (completion, fresh) = self.register(&object, RecoveryKind::Object, version);
        if !fresh {
            return completion;
        }
        log_event(
            Event::RecoveryStart,
            &[("object", &object.to_string()), ("version", &version.to_string())],
        );

        let result = if self.membership.missing_item(self.local, &object).is_some() {
            match self.membership.pull_source(&object) {
                Some(from) => self.initiate_pull(object.clone(), version, from),
                None => Err(RecoveryError::ObjectNotFound(object.clone())),
            }
        } else {
            self.start_pushes(&object)
        };
        if let Err(e) = result {
            self.finish_object(&object, Err(e));
        }
        completion
    }

    /// Apply a tombstone locally, then replicate it to every shard that
    /// still holds the object.
    pub fn recover_delete(&mut self, object: ObjectKey, version: VersionStamp) -> Completion {
        self.sync_epoch();
        let (completion, fresh) = self.register(&object, RecoveryKind::Delete, version);
        if !fresh {
            return completion;
        }
        match self.apply_tombstone(&object, version) {
            Ok(GateOutcome::Committed) => {
                if let Err(e) = self.start_delete(&object, version) {
                    self.finish_object(&object, Err(e));
                }
            }
            Ok(_) => self.finish_object(&object, Ok(RecoveryOutcome::Stale)),
            Err(e) => self.finish_object(&object, Err(e)),
        }
        completion
    }

    /// Replicate a tombstone already applied locally.
    pub fn push_delete(&mut self, object: ObjectKey, version: VersionStamp) -> Completion {
        self.sync_epoch();
        let (completion, fresh) = self.register(&object, RecoveryKind::Delete, version);
        if !fresh {
            return completion;
        }
        if let Err(e) = self.start_delete(&object, version) {
            self.finish_object(&object, Err(e));
        }
        completion
    }

    /// Start pulling `object` from `from`.
    pub fn initiate_pull(
        &mut self,
        object: ObjectKey,
        version: VersionStamp,
        from: ShardId,
    ) -> RecoveryResult<()> {
        if self.pulls.contains_key(&object) {
            return Err(RecoveryError::AlreadyInProgress(object));
        }

        let missing = match self.membership.missing_item(self.local, &object) {
            Some(mut item) => {
                item.need = item.need.max(version);
                item
            }
            None => MissingItem::whole(version),
        };
        // Without a local copy nothing can be patched in place.
        let missing = if self.store.stat(&object)?.is_none() {
            MissingItem::whole(missing.need)
        } else {
            missing
        };

        let info = RecoveryInfo::for_missing(object.clone(), &missing, None);
        let transaction = self.store.begin_transaction(&object);
        let mut pull = PullStateMachine::new(info, from, self.epoch, transaction);
        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let outgoing = RecoveryOp::initiate(&mut pull, &ctx)?;

        log_event(
            Event::PullStart,
            &[
                ("object", &object.to_string()),
                ("from", &from.to_string()),
                ("need", &missing.need.to_string()),
            ],
        );
        self.pulls.insert(object, pull);
        self.send_all(outgoing)
    }

    /// Route one inbound message.
    ///
    /// Messages stamped with another epoch are dropped untouched.
    pub fn handle_message(&mut self, message: RecoveryMessage) -> RecoveryResult<()> {
        self.sync_epoch();
        let RecoveryMessage { from, epoch, body } = message;
        if epoch != self.epoch {
            self.metrics.increment_messages_dropped();
            log_event(
                Event::MessageDropped,
                &[
                    ("kind", body.kind()),
                    ("from", &from.to_string()),
                    ("epoch", &epoch.to_string()),
                    ("current", &self.epoch.to_string()),
                ],
            );
            return Ok(());
        }

        match &body {
            MessageBody::Pull(request) => self.handle_pull(from, request),
            MessageBody::Push(payload) => {
                if self.pulling_from(&payload.object, from) {
                    self.handle_pull_response(from, &body)
                } else {
                    self.handle_push(from, payload)
                }
            }
            MessageBody::PushReply(_) => self.handle_push_reply(from, &body),
            MessageBody::Delete(request) => self.handle_recovery_delete(from, request),
            MessageBody::DeleteReply(_) => self.handle_delete_reply(from, &body),
            MessageBody::Failure(failure) => {
                if self.pulling_from(&failure.object, from) {
                    self.handle_pull_response(from, &body)
                } else {
                    self.handle_push_reply(from, &body)
                }
            }
        }
    }

    /// Tear down every record; waiters resolve as `Stale`.
    pub fn on_epoch_changed(&mut self, epoch: Epoch) {
        if epoch == self.epoch {
            return;
        }
        self.fence.advance(epoch);
        let previous = self.epoch;
        self.epoch = epoch;

        let torn_down =
            self.pulls.len() + self.pushes.len() + self.receivers.len() + self.deletes.len();
        for pull in self.pulls.values_mut() {
            pull.on_epoch_changed(epoch);
        }
        for push in self.pushes.values_mut() {
            push.on_epoch_changed(epoch);
        }
        for delete in self.deletes.values_mut() {
            delete.on_epoch_changed(epoch);
        }
        self.pulls.clear();
        self.pushes.clear();
        self.receivers.clear();
        self.deletes.clear();

        for (_, entry) in std::mem::take(&mut self.objects) {
            for waiter in entry.waiters {
                let _ = waiter.send(Ok(RecoveryOutcome::Stale));
            }
        }

        log_event(
            Event::EpochChanged,
            &[
                ("previous", &previous.to_string()),
                ("current", &epoch.to_string()),
                ("torn_down", &torn_down.to_string()),
            ],
        );
    }

    /// Re-send whatever is still awaiting a response from `peer`.
    ///
    /// Returns the number of messages re-sent.
    pub fn on_peer_reconnected(&mut self, peer: ShardId) -> usize {
        let mut resend: Vec<MessageBody> = Vec::new();
        for pull in self.pulls.values().filter(|p| !p.is_finished()) {
            resend.extend(pull.outstanding_for(peer));
        }
        for push in self.pushes.values().filter(|p| !p.is_finished()) {
            resend.extend(push.outstanding_for(peer));
        }
        for delete in self.deletes.values().filter(|d| !d.is_finished()) {
            resend.extend(delete.outstanding_for(peer));
        }

        let count = resend.len();
        log_event(
            Event::PeerResend,
            &[("peer", &peer.to_string()), ("messages", &count.to_string())],
        );
        for body in resend {
            if let Err(e) = self.send(peer, body) {
                log_event(
                    Event::PeerUnreachable,
                    &[("peer", &peer.to_string()), ("error", &e.to_string())],
                );
            }
        }
        count
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Supplier side: serve one round of a pull. Stateless.
    ///
    /// A source that cannot be read fails the requester's pull.
    fn handle_pull(&mut self, from: ShardId, request: &PullRequest) -> RecoveryResult<()> {
        let info = RecoveryInfo {
            object: request.object.clone(),
            version: request.version,
            size: None,
            copy_subset: request.copy_subset.clone(),
            copy_omap: request.copy_omap,
            is_delete: false,
            creating: false,
        };
        match build_push_payload(
            self.store.as_ref(),
            &info,
            &request.cursor,
            self.budget,
            request.round,
        ) {
            Ok((payload, stats)) => {
                if self.config.log_rounds {
                    log_event(
                        Event::PushRound,
                        &[
                            ("object", &request.object.to_string()),
                            ("target", &from.to_string()),
                            ("round", &request.round.to_string()),
                            ("bytes", &stats.bytes.to_string()),
                        ],
                    );
                }
                self.send(from, MessageBody::Push(payload))
            }
            Err(e) => {
                log_event(
                    Event::PushFailed,
                    &[
                        ("object", &request.object.to_string()),
                        ("target", &from.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                let failure = RecoveryFailure::new(request.object.clone(), request.round, &e);
                self.send_failure(from, failure)?;
                Err(e)
            }
        }
    }

    /// Requester side: consume a round of an active pull, or the
    /// supplier's failure.
    fn handle_pull_response(&mut self, from: ShardId, body: &MessageBody) -> RecoveryResult<()> {
        let object = body.object().clone();
        if reap(&mut self.pulls, &object, self.epoch) {
            self.finish_object(&object, Ok(RecoveryOutcome::Stale));
            return Ok(());
        }
        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let Some(pull) = self.pulls.get_mut(&object) else {
            return Ok(());
        };

        match pull.handle_message(&ctx, from, body) {
            Ok(OpStep::Send(outgoing)) => {
                if self.config.log_rounds {
                    log_event(
                        Event::PullRound,
                        &[("object", &object.to_string()), ("from", &from.to_string())],
                    );
                }
                self.send_all(outgoing)
            }
            Ok(OpStep::ReadyToCommit) => self.commit_pull(&object),
            Ok(OpStep::Complete) | Ok(OpStep::Ignored) => Ok(()),
            Err(e) => {
                self.pulls.remove(&object);
                self.finish_object(&object, Err(e.clone()));
                Err(e)
            }
        }
    }

    fn commit_pull(&mut self, object: &ObjectKey) -> RecoveryResult<()> {
        let Some(mut pull) = self.pulls.remove(object) else {
            return Ok(());
        };
        let gate = PersistenceGate::new(self.store.as_ref(), self.membership.as_ref(), &self.fence);

        match pull.commit(&gate) {
            Ok(GateOutcome::Committed) => {
                let stats = *pull.stats();
                self.metrics.record_pull(&stats);
                log_event(
                    Event::PullCommitted,
                    &[
                        ("object", &object.to_string()),
                        ("from", &pull.from().to_string()),
                        ("rounds", &stats.rounds.to_string()),
                        ("bytes", &stats.bytes.to_string()),
                    ],
                );
                let orchestrated = self
                    .objects
                    .get(object)
                    .map_or(false, |e| e.kind == RecoveryKind::Object);
                if orchestrated {
                    self.start_pushes(object)
                } else {
                    Ok(())
                }
            }
            Ok(outcome) => {
                if outcome == GateOutcome::StaleEpoch {
                    self.metrics.increment_stale_commits();
                }
                self.finish_object(object, Ok(RecoveryOutcome::Stale));
                Ok(())
            }
            Err(e) => {
                self.finish_object(object, Err(e.clone()));
                Err(e)
            }
        }
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Fan out one push per shard needing `object`.
    fn start_pushes(&mut self, object: &ObjectKey) -> RecoveryResult<()> {
        let Some(version) = self.objects.get(object).map(|e| e.version) else {
            return Ok(());
        };
        let targets = self.membership.shards_needing(object);
        if targets.is_empty() {
            self.finish_object(object, Ok(RecoveryOutcome::Recovered));
            return Ok(());
        }
        let meta = self
            .store
            .stat(object)?
            .ok_or_else(|| RecoveryError::ObjectNotFound(object.clone()))?;

        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let mut outgoing: Vec<Outgoing> = Vec::new();
        let mut started = BTreeSet::new();
        let mut failure = None;

        for target in targets {
            let missing = self
                .membership
                .missing_item(target, object)
                .unwrap_or_else(|| MissingItem::whole(version));
            let mut info = RecoveryInfo::for_missing(object.clone(), &missing, Some(meta.size));
            info.version = info.version.max(version);

            let mut push = PushStateMachine::new(info, target, self.epoch);
            match push.initiate(&ctx) {
                Ok(out) => {
                    log_event(
                        Event::PushStart,
                        &[("object", &object.to_string()), ("target", &target.to_string())],
                    );
                    outgoing.extend(out);
                    started.insert(target);
                    self.pushes.insert((object.clone(), target), push);
                }
                Err(e) => {
                    log_event(
                        Event::PushFailed,
                        &[
                            ("object", &object.to_string()),
                            ("target", &target.to_string()),
                            ("error", &e.to_string()),
                        ],
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        if started.is_empty() {
            let e = failure.unwrap_or_else(|| RecoveryError::ObjectNotFound(object.clone()));
            self.finish_object(object, Err(e));
            return Ok(());
        }
        if let Some(entry) = self.objects.get_mut(object) {
            entry.pending_targets = started;
            if let Some(e) = failure {
                entry.failure.get_or_insert(e);
            }
        }
        self.send_all(outgoing)
    }

    /// Replica side: fold an incoming push round.
    fn handle_push(&mut self, from: ShardId, payload: &PushPayload) -> RecoveryResult<()> {
        let object = payload.object.clone();

        if !self.receivers.contains_key(&object) {
            // Final reply lost after commit: the version is already here.
            let held = self.store.stat(&object)?.map(|m| m.version);
            if payload.complete && held.map_or(false, |v| v >= payload.info.version) {
                let reply = PushReply {
                    object,
                    cursor: payload.after.clone(),
                    complete: true,
                    round: payload.round,
                };
                return self.send(from, MessageBody::PushReply(reply));
            }
            if payload.round != 1 {
                // Mid-push round with nothing to fold it into.
                log_event(
                    Event::MessageDropped,
                    &[
                        ("kind", "PUSH"),
                        ("object", &object.to_string()),
                        ("round", &payload.round.to_string()),
                    ],
                );
                let error = RecoveryError::UnknownRecovery(object.clone());
                let failure = RecoveryFailure::new(object, payload.round, &error);
                return self.send_failure(from, failure);
            }
            let transaction = self.store.begin_transaction(&object);
            let receiver = PushReceiver::new(from, self.epoch, payload, transaction);
            self.receivers.insert(object.clone(), receiver);
        }

        let Some(receiver) = self.receivers.get_mut(&object) else {
            return Ok(());
        };
        if receiver.from() != from {
            log_event(
                Event::MessageDropped,
                &[
                    ("kind", "PUSH"),
                    ("object", &object.to_string()),
                    ("from", &from.to_string()),
                ],
            );
            return Ok(());
        }

        match receiver.on_push(payload) {
            Ok(ReceiveStep::Reply(reply)) => self.send(from, MessageBody::PushReply(reply)),
            Ok(ReceiveStep::ReadyToCommit) => {
                let gate =
                    PersistenceGate::new(self.store.as_ref(), self.membership.as_ref(), &self.fence);
                let committed = receiver.commit(&gate);
                self.receivers.remove(&object);

                let (outcome, reply, stats) = match committed {
                    Ok(committed) => committed,
                    Err(e) => {
                        let failure = RecoveryFailure::new(object, payload.round, &e);
                        self.send_failure(from, failure)?;
                        return Err(e);
                    }
                };
                match outcome {
                    GateOutcome::StaleEpoch => {
                        self.metrics.increment_stale_commits();
                        Ok(())
                    }
                    GateOutcome::Committed | GateOutcome::Superseded => {
                        log_event(
                            Event::PushApplied,
                            &[
                                ("object", &object.to_string()),
                                ("from", &from.to_string()),
                                ("bytes", &stats.bytes.to_string()),
                            ],
                        );
                        self.send(from, MessageBody::PushReply(reply))
                    }
                }
            }
            Err(e) => {
                self.receivers.remove(&object);
                self.send_failure(from, RecoveryFailure::new(object, payload.round, &e))?;
                Err(e)
            }
        }
    }

    /// Supplier side: a target confirmed a round, or gave up on it.
    fn handle_push_reply(&mut self, from: ShardId, body: &MessageBody) -> RecoveryResult<()> {
        let object = body.object().clone();
        let key = (object.clone(), from);
        if reap(&mut self.pushes, &key, self.epoch) {
            self.finish_object(&object, Ok(RecoveryOutcome::Stale));
            return Ok(());
        }
        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let Some(push) = self.pushes.get_mut(&key) else {
            return Ok(());
        };

        match push.handle_message(&ctx, from, body) {
            Ok(OpStep::Send(outgoing)) => {
                if self.config.log_rounds {
                    log_event(
                        Event::PushRound,
                        &[("object", &object.to_string()), ("target", &from.to_string())],
                    );
                }
                self.send_all(outgoing)
            }
            Ok(OpStep::Complete) => {
                if let Some(push) = self.pushes.remove(&key) {
                    self.metrics.record_push(push.stats());
                    self.membership
                        .mark_recovered(from, &object, push.info().version);
                    log_event(
                        Event::PushTargetComplete,
                        &[
                            ("object", &object.to_string()),
                            ("target", &from.to_string()),
                            ("rounds", &push.stats().rounds.to_string()),
                        ],
                    );
                }
                self.settle_target(&object, from, None);
                Ok(())
            }
            Ok(OpStep::ReadyToCommit) | Ok(OpStep::Ignored) => Ok(()),
            Err(e) => {
                let state = self.pushes.remove(&key).map_or("gone", |p| p.state_name());
                log_event(
                    Event::PushFailed,
                    &[
                        ("object", &object.to_string()),
                        ("target", &from.to_string()),
                        ("state", state),
                        ("error", &e.to_string()),
                    ],
                );
                self.settle_target(&object, from, Some(e.clone()));
                Err(e)
            }
        }
    }

    fn settle_target(&mut self, object: &ObjectKey, target: ShardId, failure: Option<RecoveryError>) {
        let Some(entry) = self.objects.get_mut(object) else {
            return;
        };
        entry.pending_targets.remove(&target);
        if let Some(e) = failure {
            entry.failure.get_or_insert(e);
        }
        if !entry.pending_targets.is_empty() {
            return;
        }
        let result = match entry.failure.clone() {
            Some(e) => Err(e),
            None => Ok(RecoveryOutcome::Recovered),
        };
        self.finish_object(object, result);
    }

    // =========================================================================
    // Delete
    // =========================================================================

    fn start_delete(&mut self, object: &ObjectKey, version: VersionStamp) -> RecoveryResult<()> {
        if self.deletes.contains_key(object) {
            return Err(RecoveryError::AlreadyInProgress(object.clone()));
        }
        let targets = self.membership.shards_needing(object);
        if targets.is_empty() {
            self.finish_object(object, Ok(RecoveryOutcome::Recovered));
            return Ok(());
        }

        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let mut delete = DeletePropagation::new(object.clone(), version, targets, self.epoch);
        let outgoing = delete.initiate(&ctx)?;
        log_event(
            Event::DeletePropagate,
            &[
                ("object", &object.to_string()),
                ("targets", &outgoing.len().to_string()),
            ],
        );
        self.deletes.insert(object.clone(), delete);
        self.send_all(outgoing)
    }

    fn apply_tombstone(
        &mut self,
        object: &ObjectKey,
        version: VersionStamp,
    ) -> RecoveryResult<GateOutcome> {
        let mut transaction = self.store.begin_transaction(object);
        transaction.delete();
        let info = RecoveryInfo::tombstone(object.clone(), version);
        let gate = PersistenceGate::new(self.store.as_ref(), self.membership.as_ref(), &self.fence);
        let outcome = gate.commit(&info, true, self.epoch, transaction)?;
        if outcome == GateOutcome::StaleEpoch {
            self.metrics.increment_stale_commits();
        }
        Ok(outcome)
    }

    /// Target side: apply a replicated tombstone and acknowledge it.
    fn handle_recovery_delete(
        &mut self,
        from: ShardId,
        request: &DeleteRequest,
    ) -> RecoveryResult<()> {
        let acked = match self.apply_tombstone(&request.object, request.version)? {
            GateOutcome::Committed => true,
            GateOutcome::Superseded => false,
            GateOutcome::StaleEpoch => return Ok(()),
        };
        let reply = DeleteReply {
            object: request.object.clone(),
            acked,
        };
        self.send(from, MessageBody::DeleteReply(reply))
    }

    fn handle_delete_reply(&mut self, from: ShardId, body: &MessageBody) -> RecoveryResult<()> {
        let object = body.object().clone();
        if reap(&mut self.deletes, &object, self.epoch) {
            self.finish_object(&object, Ok(RecoveryOutcome::Stale));
            return Ok(());
        }
        let acked = matches!(body, MessageBody::DeleteReply(reply) if reply.acked);
        let ctx = OpContext {
            store: self.store.as_ref(),
            budget: self.budget,
        };
        let Some(delete) = self.deletes.get_mut(&object) else {
            return Ok(());
        };
        let version = delete.version();
        let step = delete.handle_message(&ctx, from, body)?;

        if matches!(step, OpStep::Send(_) | OpStep::Complete) && acked {
            self.membership.mark_recovered(from, &object, version);
        }
        if step == OpStep::Complete {
            self.deletes.remove(&object);
            self.metrics.increment_deletes_propagated();
            log_event(
                Event::DeleteComplete,
                &[("object", &object.to_string()), ("version", &version.to_string())],
            );
            self.finish_object(&object, Ok(RecoveryOutcome::Recovered));
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Catch up with an epoch change the controller has not delivered yet.
    fn sync_epoch(&mut self) {
        let current = self.membership.current_epoch();
        if current != self.epoch {
            self.on_epoch_changed(current);
        }
    }

    /// Register a waiter; the flag is true when a new recovery must start.
    fn register(
        &mut self,
        object: &ObjectKey,
        kind: RecoveryKind,
        version: VersionStamp,
    ) -> (Completion, bool) {
        if let Some(entry) = self.objects.get_mut(object) {
            if entry.kind == kind && version <= entry.version {
                let (waiter, completion) = Completion::channel();
                entry.waiters.push(waiter);
                return (completion, false);
            }
            return (
                Completion::ready(Err(RecoveryError::AlreadyInProgress(object.clone()))),
                false,
            );
        }

        let (waiter, completion) = Completion::channel();
        self.objects.insert(
            object.clone(),
            ObjectRecovery {
                kind,
                version,
                pending_targets: BTreeSet::new(),
                failure: None,
                waiters: vec![waiter],
            },
        );
        (completion, true)
    }

    fn finish_object(&mut self, object: &ObjectKey, result: RecoveryResult<RecoveryOutcome>) {
        let Some(entry) = self.objects.remove(object) else {
            return;
        };
        // Records still referring to an unfinished object are dropped with it.
        if result != Ok(RecoveryOutcome::Recovered) {
            self.pulls.remove(object);
            self.pushes.retain(|(obj, _), _| obj != object);
            self.deletes.remove(object);
        }

        match &result {
            Ok(RecoveryOutcome::Recovered) => {
                self.membership.mark_object_recovered(object, entry.version);
                self.metrics.increment_objects_recovered();
                log_event(
                    Event::RecoveryComplete,
                    &[
                        ("object", &object.to_string()),
                        ("version", &entry.version.to_string()),
                    ],
                );
            }
            Ok(RecoveryOutcome::Stale) => {}
            Err(e) => {
                self.metrics.increment_recovery_failures();
                log_event(
                    Event::RecoveryFailed,
                    &[("object", &object.to_string()), ("error", &e.to_string())],
                );
            }
        }
        for waiter in entry.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Send in the current epoch. An unreachable peer keeps its record
    /// pending until it reconnects.
    fn send(&self, to: ShardId, body: MessageBody) -> RecoveryResult<()> {
        let message = RecoveryMessage::new(self.local, self.epoch, body);
        match self.transport.send(to, message) {
            Ok(()) => Ok(()),
            Err(TransportError::PeerUnreachable(peer)) => {
                log_event(Event::PeerUnreachable, &[("peer", &peer.to_string())]);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_all(&self, outgoing: Vec<Outgoing>) -> RecoveryResult<()> {
        for (to, body) in outgoing {
            self.send(to, body)?;
        }
        Ok(())
    }

    fn send_failure(&self, to: ShardId, failure: RecoveryFailure) -> RecoveryResult<()> {
        log_event(
            Event::FailureSent,
            &[
                ("object", &failure.object.to_string()),
                ("to", &to.to_string()),
                ("round", &failure.round.to_string()),
                ("kind", &format!("{:?}", failure.kind)),
            ],
        );
        self.send(to, MessageBody::Failure(failure))
    }

    /// `from` supplies this shard's pull of `object`.
    fn pulling_from(&self, object: &ObjectKey, from: ShardId) -> bool {
        self.pulls.get(object).map_or(false, |p| p.from() == from)
    }
}

/// Drop `key`'s record if it started in another epoch or already finished.
///
/// Returns true when a record was dropped.
fn reap<K: Ord, O: RecoveryOp>(records: &mut BTreeMap<K, O>, key: &K, epoch: Epoch) -> bool {
    let Some(op) = records.get(key) else {
        return false;
    };
    if op.epoch() == epoch && !op.is_finished() {
        return false;
    }
    log_event(
        Event::RecordReaped,
        &[
            ("object", &op.object().to_string()),
            ("state", op.state_name()),
            ("epoch", &op.epoch().to_string()),
        ],
    );
    records.remove(key);
    true
}
