//! FIFO command queue owned by a single worker task.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Command, CommandStatus, RecordStore};
use crate::error::CommandError;

/// Commands kept for inspection and undo when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

enum QueueEvent {
    Submit {
        command: Command,
        reply: Option<oneshot::Sender<Command>>,
    },
    UndoLast {
        reply: oneshot::Sender<Result<Command, CommandError>>,
    },
    History {
        reply: oneshot::Sender<Vec<Command>>,
    },
}

/// Handle to the queue worker. Clones feed the same worker; the worker stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct CommandQueue {
    event_tx: mpsc::UnboundedSender<QueueEvent>,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_history_limit(store, DEFAULT_HISTORY_LIMIT)
    }

    /// A limit of zero is treated as one.
    pub fn with_history_limit(store: Arc<dyn RecordStore>, limit: usize) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = QueueWorker {
            store,
            history: VecDeque::new(),
            limit: limit.max(1),
            event_rx,
        };
        tokio::spawn(worker.run());
        Self { event_tx }
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }

    /// Queue `command` and wait for its outcome. A failed command is returned
    /// with status `Failed`; the queue itself keeps going.
    pub async fn submit(&self, command: Command) -> Result<Command, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::Submit {
            command,
            reply: Some(reply_tx),
        })?;
        reply_rx.await.map_err(|_| CommandError::QueueClosed)
    }

    /// Queue `command` without waiting.
    pub fn enqueue(&self, command: Command) -> Result<(), CommandError> {
        self.send(QueueEvent::Submit {
            command,
            reply: None,
        })
    }

    /// Undo the most recent executed, reversible command in history.
    pub async fn undo_last(&self) -> Result<Command, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::UndoLast { reply: reply_tx })?;
        reply_rx.await.map_err(|_| CommandError::QueueClosed)?
    }

    /// Processed commands, oldest first.
    pub async fn history(&self) -> Result<Vec<Command>, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(QueueEvent::History { reply: reply_tx })?;
        reply_rx.await.map_err(|_| CommandError::QueueClosed)
    }

    fn send(&self, event: QueueEvent) -> Result<(), CommandError> {
        self.event_tx
            .send(event)
            .map_err(|_| CommandError::QueueClosed)
    }
}

struct QueueWorker {
    store: Arc<dyn RecordStore>,
    history: VecDeque<Command>,
    limit: usize,
    event_rx: mpsc::UnboundedReceiver<QueueEvent>,
}

impl QueueWorker {
    async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            match event {
                QueueEvent::Submit { command, reply } => {
                    let processed = self.process(command).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(processed);
                    }
                }
                QueueEvent::UndoLast { reply } => {
                    let _ = reply.send(self.undo_last().await);
                }
                QueueEvent::History { reply } => {
                    let _ = reply.send(self.history.iter().cloned().collect());
                }
            }
        }
        debug!("command queue stopped");
    }

    async fn process(&mut self, mut command: Command) -> Command {
        let outcome = command.execute(self.store.as_ref()).await.map(|_| ());
        match outcome {
            Ok(()) => debug!(command = %command.id, operation = command.name(), "command executed"),
            Err(e) => warn!(
                command = %command.id,
                operation = command.name(),
                error = %e,
                "command failed; continuing with queue"
            ),
        }
        self.history.push_back(command.clone());
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
        command
    }

    async fn undo_last(&mut self) -> Result<Command, CommandError> {
        let command = self
            .history
            .iter_mut()
            .rev()
            .find(|c| c.status == CommandStatus::Executed && c.reversible)
            .ok_or(CommandError::NothingToUndo)?;
        match command.undo(self.store.as_ref()).await {
            Ok(()) => {
                info!(command = %command.id, operation = command.name(), "command undone");
                Ok(command.clone())
            }
            Err(e) => {
                warn!(command = %command.id, operation = command.name(), error = %e, "undo failed");
                Err(e)
            }
        }
    }
}
