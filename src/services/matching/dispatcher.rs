//! Single task that owns the match engine.
//!
//! Commands from per-tab workers, download events from the bus and timeout
//! expiries are all handled here one at a time, so the intent table is
//! never mutated concurrently.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::engine::{EngineError, MatchEngine, MatchPolicy};
use crate::models::{Actuation, DownloadEvent, FailureReason, Intent, TabId};
use crate::services::bus::next_event;

const COMMAND_BUFFER: usize = 64;

enum Command {
    Admit {
        intent: Intent,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Clicked {
        id: TabId,
        actuation: Actuation,
        resolved: oneshot::Sender<Intent>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Fail {
        id: TabId,
        reason: FailureReason,
        reply: oneshot::Sender<Result<Intent, EngineError>>,
    },
    SetEpoch(u64),
    RaiseEpoch(u64),
    Snapshot(oneshot::Sender<Vec<Intent>>),
    Clear(oneshot::Sender<Vec<Intent>>),
}

/// Cloneable handle to a running dispatcher.
#[derive(Clone)]
pub struct MatchHandle {
    tx: mpsc::Sender<Command>,
}

/// Resolution of a clicked intent: `Matched` or `Failed(Timeout)`.
pub type Resolution = oneshot::Receiver<Intent>;

impl MatchHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::DispatcherClosed)?;
        rx.await.map_err(|_| EngineError::DispatcherClosed)
    }

    pub async fn admit(&self, intent: Intent) -> Result<(), EngineError> {
        self.request(|reply| Command::Admit { intent, reply }).await?
    }

    /// Mark an admitted intent clicked and get a receiver for its resolution.
    pub async fn clicked(&self, id: &TabId, actuation: Actuation) -> Result<Resolution, EngineError> {
        let (resolved, resolution) = oneshot::channel();
        let id = id.clone();
        self.request(|reply| Command::Clicked {
            id,
            actuation,
            resolved,
            reply,
        })
        .await??;
        Ok(resolution)
    }

    pub async fn fail(&self, id: &TabId, reason: FailureReason) -> Result<Intent, EngineError> {
        let id = id.clone();
        self.request(|reply| Command::Fail { id, reason, reply }).await?
    }

    pub async fn set_epoch(&self, epoch: u64) -> Result<(), EngineError> {
        self.tx
            .send(Command::SetEpoch(epoch))
            .await
            .map_err(|_| EngineError::DispatcherClosed)
    }

    pub async fn raise_epoch(&self, at_least: u64) -> Result<(), EngineError> {
        self.tx
            .send(Command::RaiseEpoch(at_least))
            .await
            .map_err(|_| EngineError::DispatcherClosed)
    }

    pub async fn snapshot(&self) -> Result<Vec<Intent>, EngineError> {
        self.request(Command::Snapshot).await
    }

    /// Drop all live intents; their timeouts are cancelled.
    pub async fn clear(&self) -> Result<Vec<Intent>, EngineError> {
        self.request(Command::Clear).await
    }
}

/// Owns a `MatchEngine` on its own task.
pub struct MatchDispatcher {
    engine: MatchEngine,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Receiver<DownloadEvent>,
    waiters: HashMap<TabId, oneshot::Sender<Intent>>,
}

impl MatchDispatcher {
    /// Spawn the dispatcher; it stops when every handle is dropped.
    pub fn spawn(
        policy: MatchPolicy,
        events: broadcast::Receiver<DownloadEvent>,
    ) -> (MatchHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let dispatcher = Self {
            engine: MatchEngine::new(policy),
            commands,
            events,
            waiters: HashMap::new(),
        };
        let handle = tokio::spawn(dispatcher.run());
        (MatchHandle { tx }, handle)
    }

    async fn run(self) {
        let Self {
            mut engine,
            mut commands,
            mut events,
            mut waiters,
        } = self;
        let mut events_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    handle_command(&mut engine, &mut waiters, command);
                }
                event = next_event(&mut events), if events_open => {
                    match event {
                        Some(event) => {
                            if let Some(intent) = engine.on_download_event(&event) {
                                notify(&mut waiters, intent);
                            }
                        }
                        None => {
                            debug!("Download event bus closed");
                            events_open = false;
                        }
                    }
                }
                intent = engine.next_expired() => {
                    notify(&mut waiters, intent);
                }
            }
        }
        debug!("Match dispatcher stopped");
    }
}

fn handle_command(
    engine: &mut MatchEngine,
    waiters: &mut HashMap<TabId, oneshot::Sender<Intent>>,
    command: Command,
) {
    match command {
        Command::Admit { intent, reply } => {
            let _ = reply.send(engine.admit(intent));
        }
        Command::Clicked {
            id,
            actuation,
            resolved,
            reply,
        } => match engine.mark_clicked(&id, &actuation) {
            Ok(already) => {
                waiters.insert(id, resolved);
                let _ = reply.send(Ok(()));
                for intent in already {
                    notify(waiters, intent);
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        },
        Command::Fail { id, reason, reply } => {
            let result = engine.fail(&id, reason);
            // A clicked intent failed from outside still has a waiter.
            waiters.remove(&id);
            let _ = reply.send(result);
        }
        Command::SetEpoch(epoch) => engine.set_epoch(epoch),
        Command::RaiseEpoch(at_least) => engine.raise_epoch(at_least),
        Command::Snapshot(reply) => {
            let _ = reply.send(engine.snapshot());
        }
        Command::Clear(reply) => {
            waiters.clear();
            let _ = reply.send(engine.clear());
        }
    }
}

fn notify(waiters: &mut HashMap<TabId, oneshot::Sender<Intent>>, intent: Intent) {
    match waiters.remove(&intent.id) {
        Some(waiter) => {
            let _ = waiter.send(intent);
        }
        None => debug!("Intent {} resolved with nobody waiting", intent.id),
    }
}
