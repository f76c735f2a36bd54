//! Transport collaborator
//!
//! Delivers envelopes between shards. No ordering or delivery guarantee
//! is assumed across peers. A failed send is reported as
//! `PeerUnreachable`; the caller keeps its record and re-sends on
//! reconnect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;

use super::errors::RecoveryError;
use super::messages::RecoveryMessage;
use super::types::ShardId;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    PeerUnreachable(ShardId),

    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for RecoveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerUnreachable(shard) => RecoveryError::PeerUnreachable(shard),
            TransportError::Closed => RecoveryError::ServiceStopped,
        }
    }
}

/// Outbound message sink.
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn send(&self, to: ShardId, message: RecoveryMessage) -> Result<(), TransportError>;
}

/// Inbound side of a shard's channel.
pub type MessageReceiver = mpsc::UnboundedReceiver<RecoveryMessage>;

/// In-process transport over per-shard unbounded channels.
///
/// Cloning yields a handle to the same routing table.
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    routes: Arc<RwLock<BTreeMap<ShardId, mpsc::UnboundedSender<RecoveryMessage>>>>,
    unreachable: Arc<RwLock<BTreeSet<ShardId>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `shard` and return its inbound receiver.
    pub fn register(&self, shard: ShardId) -> MessageReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(shard, tx);
        }
        rx
    }

    /// Drop everything sent to `shard` until `set_reachable`.
    pub fn set_unreachable(&self, shard: ShardId) {
        if let Ok(mut down) = self.unreachable.write() {
            down.insert(shard);
        }
    }

    pub fn set_reachable(&self, shard: ShardId) {
        if let Ok(mut down) = self.unreachable.write() {
            down.remove(&shard);
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: ShardId, message: RecoveryMessage) -> Result<(), TransportError> {
        let down = self
            .unreachable
            .read()
            .map(|d| d.contains(&to))
            .unwrap_or(false);
        if down {
            return Err(TransportError::PeerUnreachable(to));
        }
        let routes = self.routes.read().map_err(|_| TransportError::Closed)?;
        let sender = routes.get(&to).ok_or(TransportError::PeerUnreachable(to))?;
        sender
            .send(message)
            .map_err(|_| TransportError::PeerUnreachable(to))
    }
}

/// Transport that records every message; used to drive state machines by
/// hand in tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: RwLock<Vec<(ShardId, RecoveryMessage)>>,
    unreachable: RwLock<BTreeSet<ShardId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every message sent so far.
    pub fn drain(&self) -> Vec<(ShardId, RecoveryMessage)> {
        self.sent
            .write()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn set_unreachable(&self, shard: ShardId) {
        if let Ok(mut down) = self.unreachable.write() {
            down.insert(shard);
        }
    }

    pub fn set_reachable(&self, shard: ShardId) {
        if let Ok(mut down) = self.unreachable.write() {
            down.remove(&shard);
        }
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: ShardId, message: RecoveryMessage) -> Result<(), TransportError> {
        let down = self
            .unreachable
            .read()
            .map(|d| d.contains(&to))
            .unwrap_or(false);
        if down {
            return Err(TransportError::PeerUnreachable(to));
        }
        if let Ok(mut sent) = self.sent.write() {
            sent.push((to, message));
        }
        Ok(())
    }
}
