use serde::{Deserialize, Serialize};

use crate::execution::TaskStatus;

/// Per-status counts of the live execution records an engine is tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    pub pending: usize,
    pub started: usize,
    pub canceled: usize,
    pub failed: usize,
    pub completed: usize,
}

impl ExecutionCounts {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Started => self.started += 1,
            TaskStatus::Canceled => self.canceled += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::NotStarted => {}
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.started + self.canceled + self.failed + self.completed
    }
}
