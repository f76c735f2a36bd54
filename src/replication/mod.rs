//! Object recovery subsystem
//!
//! Brings the replicas of one shard back into agreement:
//! - Pull: fetch a missing or stale object from a peer
//! - Push: send object data, omap and attrs to every peer that needs it,
//!   across as many budget-bounded rounds as required
//! - Delete: replicate tombstones
//!
//! All recovered state reaches the store through the persistence gate,
//! which refuses results computed under an epoch that is no longer current.
//!
//! Per-object state is scoped to one membership epoch. An epoch change
//! tears every record down at once.
//!
//! The store, membership authority and transport are collaborators behind
//! traits; in-memory versions are provided for tests and simulation.

mod assembly;
mod backend;
mod config;
mod delete;
mod errors;
mod gate;
mod interval;
mod membership;
mod messages;
mod op;
mod progress;
mod pull;
mod push;
mod reconcile;
mod service;
mod store;
mod transport;
mod types;

pub use assembly::{AssembledObject, Assembly};
pub use backend::{BackendStatus, Completion, RecoveryBackend, RecoveryOutcome};
pub use config::{RecoveryConfig, RoundBudget};
pub use delete::{DeletePropagation, DeleteState, DeleteStep};
pub use errors::{RecoveryError, RecoveryResult};
pub use gate::{EpochFence, GateOutcome, PersistenceGate};
pub use interval::{ByteRange, IntervalSet};
pub use membership::{Membership, StaticMembership};
pub use messages::{
    DeleteReply, DeleteRequest, FailureKind, MessageBody, PullRequest, PushPayload, PushReply,
    RecoveryFailure, RecoveryMessage,
};
pub use op::{OpContext, OpStep, Outgoing, RecoveryOp};
pub use progress::{merge, OmapCursor, ProgressCursor, ReceivedProgress};
pub use pull::{PullState, PullStateMachine, PullStep};
pub use push::{
    build_push_payload, PushReceiver, PushState, PushStateMachine, PushStep, ReceiveStep,
};
pub use reconcile::{trim, zero_fill, TrimmedData};
pub use service::{ShardCommand, ShardHandle, ShardService};
pub use store::{
    MemoryObject, MemoryStore, ObjectMeta, ObjectStore, StoreError, StoreResult, Transaction, TxOp,
};
pub use transport::{
    ChannelTransport, MessageReceiver, RecordingTransport, Transport, TransportError,
};
pub use types::{
    Epoch, MissingItem, ObjectKey, RecoveryInfo, RecoveryStats, ShardId, VersionStamp,
};
