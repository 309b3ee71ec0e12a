//! Execution record: lifecycle + cancellation state for one run (or one
//! repeating schedule) of a task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Task lifecycle status.
///
/// Transitions:
/// - creation -> Pending -> Started -> {Canceled | Failed | Completed}
/// - a repeatable scheduled record re-enters Started on its next firing
///
/// `NotStarted` is synthetic: it is reported when a status lookup finds no
/// live record, and is never stored on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    NotStarted,
    Pending,
    Started,
    Canceled,
    Failed,
    Completed,
}

impl TaskStatus {
    /// Is this a terminal status for the current firing?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Completed
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskStatus::NotStarted => 0,
            TaskStatus::Pending => 1,
            TaskStatus::Started => 2,
            TaskStatus::Canceled => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Completed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskStatus::Pending,
            2 => TaskStatus::Started,
            3 => TaskStatus::Canceled,
            4 => TaskStatus::Failed,
            5 => TaskStatus::Completed,
            _ => TaskStatus::NotStarted,
        }
    }
}

/// Timing of a scheduled record.
///
/// `period == 0` means one-shot. The period is measured from the end of the
/// previous firing (fixed-delay), not from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl Schedule {
    pub fn once(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            period: Duration::ZERO,
        }
    }

    pub fn repeating(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        !self.period.is_zero()
    }
}

/// One run's lifecycle record.
///
/// Design:
/// - Status and the cancellation flag are independent: cancellation may be
///   requested while the record is still Pending, and the flag is only
///   turned into a Canceled status at the start of a firing.
/// - The driver handle is bound exactly once, after the worker/timer task
///   is spawned.
/// - `parent` is a non-owning link set on records spawned for the members
///   of an aggregate firing; parent and children have independent lifetimes.
#[derive(Debug)]
pub struct Execution {
    id: Ulid,
    status: AtomicU8,
    canceled: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    parent: Option<Weak<Execution>>,
    schedule: Option<Schedule>,
    created_at: DateTime<Utc>,
}

impl Execution {
    /// A record for an immediate execution.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A record for a delayed or periodic execution.
    pub fn new_scheduled(schedule: Schedule) -> Self {
        Self::build(None, Some(schedule))
    }

    /// A record for one member unit of an aggregate firing.
    pub fn new_child(parent: &Arc<Execution>) -> Self {
        Self::build(Some(Arc::downgrade(parent)), None)
    }

    fn build(parent: Option<Weak<Execution>>, schedule: Option<Schedule>) -> Self {
        Self {
            id: Ulid::new(),
            status: AtomicU8::new(TaskStatus::Pending.as_u8()),
            canceled: AtomicBool::new(false),
            handle: Mutex::new(None),
            parent,
            schedule,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_started(&self) {
        self.status.store(TaskStatus::Started.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn mark_canceled(&self) {
        self.status.store(TaskStatus::Canceled.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn mark_failed(&self) {
        self.status.store(TaskStatus::Failed.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn mark_completed(&self) {
        self.status.store(TaskStatus::Completed.as_u8(), Ordering::SeqCst);
    }

    /// Request cancellation. Monotonic; never interrupts in-flight work.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Bind the spawned driver/worker handle. Set-once: later binds are
    /// ignored.
    pub(crate) fn bind_handle(&self, handle: JoinHandle<()>) {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(handle);
        }
    }

    /// Terminal status *and* the bound driver has finished.
    pub fn is_done(&self) -> bool {
        if !self.status().is_terminal() {
            return false;
        }
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| h.is_finished())
    }

    pub fn schedule(&self) -> Option<Schedule> {
        self.schedule
    }

    /// True iff this is a scheduled record with a non-zero period.
    pub fn is_repeatable(&self) -> bool {
        self.schedule.is_some_and(|s| s.is_repeatable())
    }

    /// The aggregate record this child belongs to, if its parent is still
    /// alive.
    pub fn parent(&self) -> Option<Arc<Execution>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }
}

impl Default for Execution {
    fn default() -> Self {
        Self::new()
    }
}
