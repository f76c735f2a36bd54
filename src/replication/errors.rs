//! Recovery error types
//!
//! Failures are always scoped to one object's recovery (or one
//! object/target pair). Nothing here is process-fatal.
//!
//! - `ObjectCorrupted` / `ObjectNotFound`: local source unusable, not retried
//! - `PeerUnreachable`: transient, the outstanding request is re-sent later
//! - `StaleEpoch`: membership moved on, the result is discarded
//! - `StoreCommitFailed`: surfaced to the shard controller

use thiserror::Error;

use super::types::{Epoch, ObjectKey, ShardId};

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Recovery errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("object {0} is corrupted: {1}")]
    ObjectCorrupted(ObjectKey, String),

    #[error("object {0} not found")]
    ObjectNotFound(ObjectKey),

    #[error("peer {0} unreachable")]
    PeerUnreachable(ShardId),

    #[error("stale epoch: started in {started}, current is {current}")]
    StaleEpoch { started: Epoch, current: Epoch },

    #[error("store rejected transaction for {0}: {1}")]
    StoreCommitFailed(ObjectKey, String),

    #[error("recovery of {0} already in progress")]
    AlreadyInProgress(ObjectKey),

    #[error("no active recovery for {0}")]
    UnknownRecovery(ObjectKey),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("recovery service stopped")]
    ServiceStopped,
}

impl RecoveryError {
    pub fn corrupted(object: &ObjectKey, message: impl Into<String>) -> Self {
        Self::ObjectCorrupted(object.clone(), message.into())
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::IllegalTransition(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// The object's recovery attempt cannot continue and must be reported.
    pub fn is_fatal_for_object(&self) -> bool {
        matches!(
            self,
            Self::ObjectCorrupted(..) | Self::ObjectNotFound(_) | Self::StoreCommitFailed(..)
        )
    }

    /// Absorbed inside the state machine; the same round is retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PeerUnreachable(_))
    }

    /// Deliberately treated as "nothing to do now".
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleEpoch { .. })
    }
}
