//! Observable recovery events
//!
//! Events are explicit and typed; each maps to one stable log name.

use std::fmt;

use super::logger::Severity;

/// Observable events of the recovery subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Object-level orchestration
    /// recover_object accepted
    RecoveryStart,
    /// Every target of an object is up to date
    RecoveryComplete,
    /// Object recovery failed for at least one target
    RecoveryFailed,

    // Pull
    PullStart,
    PullRound,
    PullCommitted,

    // Push
    PushStart,
    PushRound,
    PushTargetComplete,
    /// Hard failure for one (object, target) pair
    PushFailed,
    /// Replica applied an incoming push
    PushApplied,

    // Delete
    DeletePropagate,
    DeleteComplete,
    DeleteApplied,

    // Persistence gate
    CommitStale,
    CommitSuperseded,
    CommitFailed,

    // Membership / transport
    EpochChanged,
    MessageDropped,
    /// Inbound message could not be processed
    MessageFailed,
    /// Told a peer this shard gave up on its pull or push
    FailureSent,
    /// Record from another epoch, or already finished, dropped on contact
    RecordReaped,
    PeerUnreachable,
    PeerResend,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",

            Event::PullStart => "PULL_BEGIN",
            Event::PullRound => "PULL_ROUND",
            Event::PullCommitted => "PULL_COMMITTED",

            Event::PushStart => "PUSH_BEGIN",
            Event::PushRound => "PUSH_ROUND",
            Event::PushTargetComplete => "PUSH_TARGET_COMPLETE",
            Event::PushFailed => "PUSH_FAILED",
            Event::PushApplied => "PUSH_APPLIED",

            Event::DeletePropagate => "DELETE_PROPAGATE",
            Event::DeleteComplete => "DELETE_COMPLETE",
            Event::DeleteApplied => "DELETE_APPLIED",

            Event::CommitStale => "COMMIT_STALE_EPOCH",
            Event::CommitSuperseded => "COMMIT_SUPERSEDED",
            Event::CommitFailed => "COMMIT_FAILED",

            Event::EpochChanged => "EPOCH_CHANGED",
            Event::MessageDropped => "MESSAGE_DROPPED",
            Event::MessageFailed => "MESSAGE_FAILED",
            Event::FailureSent => "FAILURE_SENT",
            Event::RecordReaped => "RECORD_REAPED",
            Event::PeerUnreachable => "PEER_UNREACHABLE",
            Event::PeerResend => "PEER_RESEND",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::PullRound | Event::PushRound | Event::MessageDropped => Severity::Trace,
            Event::CommitStale
            | Event::CommitSuperseded
            | Event::PeerUnreachable
            | Event::MessageFailed
            | Event::FailureSent
            | Event::RecordReaped
            | Event::EpochChanged => Severity::Warn,
            Event::RecoveryFailed | Event::PushFailed | Event::CommitFailed => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
