//! Units of work: the single task, the aggregate, and the tagged task kind
//! the engine fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::key::TaskKey;

/// Failure raised by a unit of work.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of computation.
///
/// `process` runs on an arbitrary worker task, so implementations must be
/// `Send + Sync` and must not assume any particular thread.
#[async_trait]
pub trait Work<V>: Send + Sync {
    async fn process(&self) -> Result<V, WorkError>;
}

/// The smallest schedulable unit: a key, a set-once cancellation flag, and
/// the computation body.
///
/// Cancellation is cooperative: the flag is checked before the work runs,
/// never by interrupting work that is already in flight.
pub struct SingleTask<K, V> {
    key: TaskKey<K>,
    canceled: AtomicBool,
    work: Box<dyn Work<V>>,
}

impl<K, V> SingleTask<K, V> {
    pub fn new(key: TaskKey<K>, work: impl Work<V> + 'static) -> Self {
        Self {
            key,
            canceled: AtomicBool::new(false),
            work: Box::new(work),
        }
    }

    pub fn key(&self) -> &TaskKey<K> {
        &self.key
    }

    /// Request cancellation. Monotonic: once set, never cleared.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub async fn process(&self) -> Result<V, WorkError> {
        self.work.process().await
    }
}

/// A group of single units sharing one major key, scheduled and reported as
/// one.
///
/// Membership has set semantics keyed by task identity; insertion order is
/// irrelevant. The member set is safe to mutate while another caller
/// iterates a snapshot.
pub struct AggregateTask<K, V> {
    key: TaskKey<K>,
    canceled: AtomicBool,
    members: RwLock<HashMap<TaskKey<K>, Arc<SingleTask<K, V>>>>,
}

impl<K, V> AggregateTask<K, V> {
    pub fn new(major: K) -> Self {
        Self {
            key: TaskKey::Simple(major),
            canceled: AtomicBool::new(false),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// The simple key of the major component.
    pub fn key(&self) -> &TaskKey<K> {
        &self.key
    }

    /// Snapshot of the current member set.
    pub fn tasks(&self) -> Vec<Arc<SingleTask<K, V>>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl<K, V> AggregateTask<K, V>
where
    K: Eq + std::hash::Hash + Clone,
{
    /// Add a member unit. Returns `false` if a unit with the same identity
    /// is already present (the existing member is kept).
    pub fn add_task(&self, unit: Arc<SingleTask<K, V>>) -> bool {
        let mut members = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if members.contains_key(unit.key()) {
            return false;
        }
        members.insert(unit.key().clone(), unit);
        true
    }

    /// Remove a member unit by identity. Returns `false` if absent.
    pub fn remove_task(&self, key: &TaskKey<K>) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }
}

/// The two task kinds the engine stores and fires.
pub enum Task<K, V> {
    Single(Arc<SingleTask<K, V>>),
    Aggregate(Arc<AggregateTask<K, V>>),
}

impl<K, V> Clone for Task<K, V> {
    fn clone(&self) -> Self {
        match self {
            Task::Single(t) => Task::Single(Arc::clone(t)),
            Task::Aggregate(t) => Task::Aggregate(Arc::clone(t)),
        }
    }
}

impl<K, V> Task<K, V> {
    pub fn key(&self) -> &TaskKey<K> {
        match self {
            Task::Single(t) => t.key(),
            Task::Aggregate(t) => t.key(),
        }
    }

    pub fn cancel(&self) {
        match self {
            Task::Single(t) => t.cancel(),
            Task::Aggregate(t) => t.cancel(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            Task::Single(t) => t.is_canceled(),
            Task::Aggregate(t) => t.is_canceled(),
        }
    }
}

impl<K, V> From<Arc<SingleTask<K, V>>> for Task<K, V> {
    fn from(task: Arc<SingleTask<K, V>>) -> Self {
        Task::Single(task)
    }
}

impl<K, V> From<Arc<AggregateTask<K, V>>> for Task<K, V> {
    fn from(task: Arc<AggregateTask<K, V>>) -> Self {
        Task::Aggregate(task)
    }
}
