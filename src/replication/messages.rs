//! Recovery protocol messages
//!
//! | Message      | Direction            |
//! |--------------|----------------------|
//! | PullRequest  | requester → supplier |
//! | PushPayload  | supplier → requester |
//! | PushReply    | requester → supplier |
//! | DeleteRequest| source → target      |
//! | DeleteReply  | target → source      |
//! | Failure      | either side          |
//!
//! Every message travels in an envelope stamped with the sender's shard and
//! epoch. Receivers drop envelopes from another epoch before touching state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::errors::RecoveryError;
use super::interval::{ByteRange, IntervalSet};
use super::progress::ProgressCursor;
use super::types::{Epoch, ObjectKey, RecoveryInfo, ShardId, VersionStamp};

/// Ask a supplier for the next round of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub object: ObjectKey,
    pub version: VersionStamp,
    pub copy_subset: IntervalSet,
    pub copy_omap: bool,
    /// Where the supplier should resume
    pub cursor: ProgressCursor,
    pub round: u32,
}

/// One round of object state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub object: ObjectKey,
    /// Supplier's view of the recovery; `size` is always set
    pub info: RecoveryInfo,
    /// Ranges carried, in the order their bytes appear in `data`
    pub data_included: Vec<ByteRange>,
    pub data: Vec<u8>,
    /// Present on the first round only
    pub omap_header: Option<Vec<u8>>,
    pub omap_entries: BTreeMap<String, Vec<u8>>,
    /// Full attribute set, present on the first round only
    pub attrs: Option<BTreeMap<String, Vec<u8>>>,
    /// Cursor this round started from
    pub before: ProgressCursor,
    /// Cursor after this round
    pub after: ProgressCursor,
    pub complete: bool,
    pub round: u32,
}

impl PushPayload {
    /// Bytes of object data carried.
    pub fn data_len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Confirms receipt of one push round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReply {
    pub object: ObjectKey,
    pub cursor: ProgressCursor,
    pub complete: bool,
    pub round: u32,
}

/// Replicate a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub object: ObjectKey,
    pub version: VersionStamp,
}

/// Acknowledges a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReply {
    pub object: ObjectKey,
    pub acked: bool,
}

/// Why a peer gave up on a pull or push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Supplier could not read a consistent copy
    Corrupted,

    /// Supplier does not hold the object
    NotFound,

    /// Receiver's store rejected the final transaction
    CommitFailed,

    /// Receiver could not make sense of a round
    Rejected,
}

/// Sent instead of a reply when the sender abandons the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryFailure {
    pub object: ObjectKey,
    /// Round being served or received when the sender gave up
    pub round: u32,
    pub kind: FailureKind,
    pub reason: String,
}

impl RecoveryFailure {
    pub fn new(object: ObjectKey, round: u32, error: &RecoveryError) -> Self {
        let (kind, reason) = match error {
            RecoveryError::ObjectCorrupted(_, reason) => (FailureKind::Corrupted, reason.clone()),
            RecoveryError::ObjectNotFound(_) => (FailureKind::NotFound, String::new()),
            RecoveryError::StoreCommitFailed(_, reason) => {
                (FailureKind::CommitFailed, reason.clone())
            }
            other => (FailureKind::Rejected, other.to_string()),
        };
        Self {
            object,
            round,
            kind,
            reason,
        }
    }

    /// The error the peer hit, as seen by the other side.
    pub fn to_error(&self) -> RecoveryError {
        let object = self.object.clone();
        match self.kind {
            FailureKind::Corrupted => RecoveryError::ObjectCorrupted(object, self.reason.clone()),
            FailureKind::NotFound => RecoveryError::ObjectNotFound(object),
            FailureKind::CommitFailed => {
                RecoveryError::StoreCommitFailed(object, self.reason.clone())
            }
            FailureKind::Rejected => RecoveryError::MalformedMessage(self.reason.clone()),
        }
    }
}

/// Protocol message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Pull(PullRequest),
    Push(PushPayload),
    PushReply(PushReply),
    Delete(DeleteRequest),
    DeleteReply(DeleteReply),
    Failure(RecoveryFailure),
}

impl MessageBody {
    /// Object the message is about.
    pub fn object(&self) -> &ObjectKey {
        match self {
            MessageBody::Pull(m) => &m.object,
            MessageBody::Push(m) => &m.object,
            MessageBody::PushReply(m) => &m.object,
            MessageBody::Delete(m) => &m.object,
            MessageBody::DeleteReply(m) => &m.object,
            MessageBody::Failure(m) => &m.object,
        }
    }

    /// Message kind name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Pull(_) => "PULL",
            MessageBody::Push(_) => "PUSH",
            MessageBody::PushReply(_) => "PUSH_REPLY",
            MessageBody::Delete(_) => "DELETE",
            MessageBody::DeleteReply(_) => "DELETE_REPLY",
            MessageBody::Failure(_) => "FAILURE",
        }
    }
}

/// Envelope carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMessage {
    pub from: ShardId,
    pub epoch: Epoch,
    pub body: MessageBody,
}

impl RecoveryMessage {
    pub fn new(from: ShardId, epoch: Epoch, body: MessageBody) -> Self {
        Self { from, epoch, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serializes_to_json() {
        let msg = RecoveryMessage::new(
            ShardId::new(1),
            Epoch::new(9),
            MessageBody::Delete(DeleteRequest {
                object: ObjectKey::new("gone"),
                version: VersionStamp::new(9, 3),
            }),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: RecoveryMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.body.kind(), "DELETE");
        assert_eq!(back.body.object(), &ObjectKey::new("gone"));
    }

    #[test]
    fn test_failure_carries_error_kind_across_the_wire() {
        let object = ObjectKey::new("bad");
        let sent = RecoveryFailure::new(
            object.clone(),
            3,
            &RecoveryError::StoreCommitFailed(object.clone(), "disk full".into()),
        );
        assert_eq!(sent.kind, FailureKind::CommitFailed);

        let json = serde_json::to_string(&MessageBody::Failure(sent)).unwrap();
        let MessageBody::Failure(back) = serde_json::from_str(&json).unwrap() else {
            panic!("expected failure body");
        };
        assert_eq!(back.round, 3);
        assert_eq!(
            back.to_error(),
            RecoveryError::StoreCommitFailed(object.clone(), "disk full".into())
        );

        let missing =
            RecoveryFailure::new(object.clone(), 1, &RecoveryError::ObjectNotFound(object.clone()));
        assert_eq!(missing.to_error(), RecoveryError::ObjectNotFound(object));
    }
}
