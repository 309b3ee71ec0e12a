//! Terminal verdict of one firing, handed to the observer registry.

use std::sync::Arc;

use crate::execution::{Execution, TaskStatus};
use crate::key::TaskKey;
use crate::task::WorkError;

/// What a firing produced.
pub enum TaskOutcome<V> {
    Completed(V),
    Canceled,
    Failed(WorkError),
}

impl<V> TaskOutcome<V> {
    /// The terminal status this outcome corresponds to.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Canceled => TaskStatus::Canceled,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskOutcome::Canceled)
    }
}

/// The result of one firing: which task, what happened, and the record it
/// happened under. The record is the one whose status was just driven to a
/// terminal value; for aggregate members it is the child record.
pub struct TaskResult<K, V> {
    pub key: TaskKey<K>,
    pub outcome: TaskOutcome<V>,
    pub execution: Arc<Execution>,
}

impl<K, V> TaskResult<K, V> {
    pub fn new(key: TaskKey<K>, outcome: TaskOutcome<V>, execution: Arc<Execution>) -> Self {
        Self {
            key,
            outcome,
            execution,
        }
    }
}
