//! Recovery operation capability
//!
//! Pull, push and delete are independent state machines. The dispatcher
//! drives all three through this trait, picking the instance by message
//! kind; each suspension point is a named state awaiting one reply kind.

use super::config::RoundBudget;
use super::errors::RecoveryResult;
use super::messages::MessageBody;
use super::store::ObjectStore;
use super::types::{Epoch, ObjectKey, ShardId};

/// Message to hand to the transport.
pub type Outgoing = (ShardId, MessageBody);

/// What an operation needs from its shard while advancing.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub budget: RoundBudget,
}

/// Result of feeding a message to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStep {
    /// Still in progress; send these (possibly none)
    Send(Vec<Outgoing>),
    /// Everything received; the local result awaits the persistence gate
    ReadyToCommit,
    /// Finished, nothing left to do
    Complete,
    /// Message did not match the awaited round or peer
    Ignored,
}

/// Common surface of pull, push and delete operations.
pub trait RecoveryOp {
    fn object(&self) -> &ObjectKey;

    /// Epoch the operation started in.
    fn epoch(&self) -> Epoch;

    fn state_name(&self) -> &'static str;

    fn is_finished(&self) -> bool;

    /// Emit the opening messages.
    fn initiate(&mut self, ctx: &OpContext<'_>) -> RecoveryResult<Vec<Outgoing>>;

    /// Advance on a reply of the kind this operation awaits.
    fn handle_message(
        &mut self,
        ctx: &OpContext<'_>,
        from: ShardId,
        body: &MessageBody,
    ) -> RecoveryResult<OpStep>;

    /// Tear down; nothing may reach the store afterwards.
    fn on_epoch_changed(&mut self, epoch: Epoch);

    /// Messages still awaiting a response from `peer`.
    fn outstanding_for(&self, peer: ShardId) -> Vec<MessageBody>;
}
