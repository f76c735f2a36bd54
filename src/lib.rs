//! shard-recovery - object recovery for replicated storage shards
//!
//! Pull, push and delete propagation between the replicas of one shard,
//! committed through an epoch-guarded persistence gate.

pub mod cli;
pub mod observability;
pub mod replication;
