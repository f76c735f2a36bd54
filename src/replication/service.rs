//! Shard recovery service
//!
//! Runs one `RecoveryBackend` on a single tokio task. Controller commands
//! and inbound protocol messages are consumed from two channels; the
//! backend is never shared, so no locking is needed around it.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::backend::{BackendStatus, Completion, RecoveryBackend};
use super::errors::{RecoveryError, RecoveryResult};
use super::transport::MessageReceiver;
use super::types::{Epoch, ObjectKey, ShardId, VersionStamp};
use crate::observability::{log_event, Event};

/// Controller command
#[derive(Debug)]
pub enum ShardCommand {
    RecoverObject {
        object: ObjectKey,
        version: VersionStamp,
        reply: oneshot::Sender<Completion>,
    },
    RecoverDelete {
        object: ObjectKey,
        version: VersionStamp,
        reply: oneshot::Sender<Completion>,
    },
    PushDelete {
        object: ObjectKey,
        version: VersionStamp,
        reply: oneshot::Sender<Completion>,
    },
    EpochChanged(Epoch),
    PeerReconnected(ShardId),
    Status(oneshot::Sender<BackendStatus>),
    Shutdown,
}

/// Spawns shard tasks.
pub struct ShardService;

impl ShardService {
    /// Run `backend` on its own task, consuming `inbox`.
    pub fn spawn(backend: RecoveryBackend, inbox: MessageReceiver) -> (ShardHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = ShardHandle {
            shard: backend.local_shard(),
            commands,
        };
        let task = tokio::spawn(run(backend, receiver, inbox));
        (handle, task)
    }
}

async fn run(
    mut backend: RecoveryBackend,
    mut commands: mpsc::UnboundedReceiver<ShardCommand>,
    mut inbox: MessageReceiver,
) {
    let mut inbox_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShardCommand::Shutdown) | None => break,
                Some(command) => apply(&mut backend, command),
            },
            message = inbox.recv(), if inbox_open => match message {
                Some(message) => {
                    let kind = message.body.kind();
                    let object = message.body.object().to_string();
                    if let Err(e) = backend.handle_message(message) {
                        log_event(
                            Event::MessageFailed,
                            &[
                                ("shard", &backend.local_shard().to_string()),
                                ("kind", kind),
                                ("object", &object),
                                ("error", &e.to_string()),
                            ],
                        );
                    }
                }
                None => inbox_open = false,
            },
        }
    }
}

fn apply(backend: &mut RecoveryBackend, command: ShardCommand) {
    match command {
        ShardCommand::RecoverObject {
            object,
            version,
            reply,
        } => {
            let _ = reply.send(backend.recover_object(object, version));
        }
        ShardCommand::RecoverDelete {
            object,
            version,
            reply,
        } => {
            let _ = reply.send(backend.recover_delete(object, version));
        }
        ShardCommand::PushDelete {
            object,
            version,
            reply,
        } => {
            let _ = reply.send(backend.push_delete(object, version));
        }
        ShardCommand::EpochChanged(epoch) => backend.on_epoch_changed(epoch),
        ShardCommand::PeerReconnected(peer) => {
            backend.on_peer_reconnected(peer);
        }
        ShardCommand::Status(reply) => {
            let _ = reply.send(backend.status());
        }
        ShardCommand::Shutdown => {}
    }
}

/// Controller-side handle to a running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard: ShardId,
    commands: mpsc::UnboundedSender<ShardCommand>,
}

impl ShardHandle {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub async fn recover_object(
        &self,
        object: ObjectKey,
        version: VersionStamp,
    ) -> RecoveryResult<Completion> {
        let (reply, receiver) = oneshot::channel();
        self.send(ShardCommand::RecoverObject {
            object,
            version,
            reply,
        })?;
        receiver.await.map_err(|_| RecoveryError::ServiceStopped)
    }

    pub async fn recover_delete(
        &self,
        object: ObjectKey,
        version: VersionStamp,
    ) -> RecoveryResult<Completion> {
        let (reply, receiver) = oneshot::channel();
        self.send(ShardCommand::RecoverDelete {
            object,
            version,
            reply,
        })?;
        receiver.await.map_err(|_| RecoveryError::ServiceStopped)
    }

    pub async fn push_delete(
        &self,
        object: ObjectKey,
        version: VersionStamp,
    ) -> RecoveryResult<Completion> {
        let (reply, receiver) = oneshot::channel();
        self.send(ShardCommand::PushDelete {
            object,
            version,
            reply,
        })?;
        receiver.await.map_err(|_| RecoveryError::ServiceStopped)
    }

    pub fn epoch_changed(&self, epoch: Epoch) -> RecoveryResult<()> {
        self.send(ShardCommand::EpochChanged(epoch))
    }

    pub fn peer_reconnected(&self, peer: ShardId) -> RecoveryResult<()> {
        self.send(ShardCommand::PeerReconnected(peer))
    }

    pub async fn status(&self) -> RecoveryResult<BackendStatus> {
        let (reply, receiver) = oneshot::channel();
        self.send(ShardCommand::Status(reply))?;
        receiver.await.map_err(|_| RecoveryError::ServiceStopped)
    }

    /// Stop the task after the commands already queued.
    pub fn shutdown(&self) -> RecoveryResult<()> {
        self.send(ShardCommand::Shutdown)
    }

    fn send(&self, command: ShardCommand) -> RecoveryResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RecoveryError::ServiceStopped)
    }
}
