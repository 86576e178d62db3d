//! Reversible commands over a [`RecordStore`]
//!
//! What this module provides
//! - `Command`: one create, update or delete, executed at most once, capturing
//!   the prior state needed to undo it
//! - `CommandQueue`: a FIFO worker with bounded history and "undo last"
//! - `RecordStore` and the in-memory `InMemoryRecordStore`
//!
//! Implementation strategy
//! - Undo replays the inverse through the same store operations: undoing a
//!   create deletes, undoing a delete re-creates, undoing an update re-applies
//!   the prior data
//! - The queue is a single-owner task; callers talk to it over a channel, so
//!   the history is never touched concurrently

mod queue;
mod store;

pub use queue::{CommandQueue, DEFAULT_HISTORY_LIMIT};
pub use store::{InMemoryRecordStore, Record, RecordStore};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CommandError, ToolError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Create { id: Option<String>, data: Value },
    Update { id: String, data: Value },
    Delete { id: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Executed,
    Failed,
    Undone,
}

/// A state-mutating operation with enough captured state to reverse it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    pub operation: Operation,
    pub status: CommandStatus,
    pub reversible: bool,
    /// Record as it was before execution (update, delete).
    pub prior: Option<Record>,
    /// Record produced by execution (create, update) or removed (delete).
    pub result: Option<Record>,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Command {
    fn new(operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            status: CommandStatus::Pending,
            reversible: true,
            prior: None,
            result: None,
            error: None,
            executed_at: None,
        }
    }

    pub fn create(id: Option<String>, data: Value) -> Self {
        Self::new(Operation::Create { id, data })
    }

    pub fn update(id: impl Into<String>, data: Value) -> Self {
        Self::new(Operation::Update {
            id: id.into(),
            data,
        })
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self::new(Operation::Delete { id: id.into() })
    }

    /// Mark the command as not undoable.
    pub fn irreversible(mut self) -> Self {
        self.reversible = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.operation.name()
    }

    /// Run the command once. A second call fails, whatever the first outcome.
    pub async fn execute(&mut self, store: &dyn RecordStore) -> Result<&Record, CommandError> {
        if self.status != CommandStatus::Pending {
            return Err(CommandError::AlreadyExecuted {
                operation: self.name(),
            });
        }
        self.executed_at = Some(Utc::now());
        let outcome = match &self.operation {
            Operation::Create { id, data } => store
                .create(id.clone(), data.clone())
                .await
                .map(|created| (None, created)),
            Operation::Update { id, data } => match store.get(id).await {
                Ok(Some(prior)) => store
                    .update(id, data.clone())
                    .await
                    .map(|updated| (Some(prior), updated)),
                Ok(None) => Err(ToolError::not_found("record", id.as_str())),
                Err(e) => Err(e),
            },
            Operation::Delete { id } => store
                .delete(id)
                .await
                .map(|removed| (Some(removed.clone()), removed)),
        };
        match outcome {
            Ok((prior, result)) => {
                self.prior = prior;
                self.status = CommandStatus::Executed;
                Ok(self.result.insert(result))
            }
            Err(e) => {
                self.status = CommandStatus::Failed;
                self.error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Reverse an executed, reversible command.
    pub async fn undo(&mut self, store: &dyn RecordStore) -> Result<(), CommandError> {
        let operation = self.name();
        match self.status {
            CommandStatus::Pending | CommandStatus::Failed => {
                return Err(CommandError::NotExecuted { operation })
            }
            CommandStatus::Undone => return Err(CommandError::AlreadyUndone { operation }),
            CommandStatus::Executed if !self.reversible => {
                return Err(CommandError::NotReversible { operation })
            }
            CommandStatus::Executed => {}
        }
        match (&self.operation, &self.prior, &self.result) {
            (Operation::Create { .. }, _, Some(created)) => {
                store.delete(&created.id).await?;
            }
            (Operation::Update { id, .. }, Some(prior), _) => {
                store.update(id, prior.data.clone()).await?;
            }
            (Operation::Delete { .. }, Some(removed), _) => {
                store
                    .create(Some(removed.id.clone()), removed.data.clone())
                    .await?;
            }
            _ => return Err(CommandError::NotReversible { operation }),
        }
        self.status = CommandStatus::Undone;
        Ok(())
    }
}
