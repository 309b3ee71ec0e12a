//! Observer registry: binds observers to task keys and delivers terminal
//! notifications.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::error::{Result, SpindleError};
use crate::key::TaskKey;
use crate::outcome::{TaskOutcome, TaskResult};
use crate::task::WorkError;

/// A listener for one task's terminal outcomes.
///
/// Callbacks run synchronously on the firing's worker task and must not
/// block indefinitely.
pub trait Observer<V>: Send + Sync {
    fn on_completed(&self, value: &V);
    fn on_canceled(&self);
    fn on_failed(&self, cause: &WorkError);
}

/// Bindings from task keys to observer sets.
///
/// Design:
/// - One lock around a plain map; per-key sets are snapshotted before
///   dispatch so callbacks run outside the lock.
/// - Set semantics by `Arc` identity: binding the same observer object
///   twice is a no-op.
pub struct ObserverRegistry<K, V> {
    bindings: RwLock<HashMap<TaskKey<K>, Vec<Arc<dyn Observer<V>>>>>,
}

impl<K, V> Default for ObserverRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ObserverRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ObserverRegistry<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Bind an observer to a key. The binding set is created on first use;
    /// re-binding the same observer object is a no-op.
    pub fn add(&self, key: TaskKey<K>, observer: Arc<dyn Observer<V>>) {
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let set = bindings.entry(key).or_default();
        if !set.iter().any(|bound| Arc::ptr_eq(bound, &observer)) {
            set.push(observer);
        }
    }

    /// Remove one binding, matched by `Arc` identity. Absent key or
    /// observer is a silent no-op.
    pub fn remove(&self, key: &TaskKey<K>, observer: &Arc<dyn Observer<V>>) {
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = bindings.get_mut(key) {
            set.retain(|bound| !Arc::ptr_eq(bound, observer));
            if set.is_empty() {
                bindings.remove(key);
            }
        }
    }

    /// Drop all bindings for a key. Absent key is a silent no-op.
    pub fn remove_all(&self, key: &TaskKey<K>) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of observers currently bound to a key.
    pub fn observer_count(&self, key: &TaskKey<K>) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Deliver a terminal result to every observer bound to its key.
    ///
    /// A result with no bound observers is an engine fault: every
    /// submission requires at least one observer, so an empty lookup here
    /// means the engine lost track of a binding.
    ///
    /// After dispatch the bindings are dropped, unless the firing was not
    /// canceled and belongs to a repeatable schedule (the record's parent
    /// for an aggregate member, the record itself for a directly fired
    /// scheduled task). Observers of a repeating schedule stay registered
    /// across firings until it is canceled.
    pub fn notify(&self, result: &TaskResult<K, V>) -> Result<()> {
        let observers = {
            let bindings = self
                .bindings
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            bindings.get(&result.key).cloned()
        };
        let Some(observers) = observers.filter(|set| !set.is_empty()) else {
            error!(key = ?result.key, "result arrived for a task with no observers");
            return Err(SpindleError::MissingObservers(format!("{:?}", result.key)));
        };

        for observer in &observers {
            match &result.outcome {
                TaskOutcome::Completed(value) => observer.on_completed(value),
                TaskOutcome::Canceled => observer.on_canceled(),
                TaskOutcome::Failed(cause) => observer.on_failed(cause),
            }
        }

        if !Self::retains_bindings(result) {
            self.remove_all(&result.key);
        }
        Ok(())
    }

    /// Bindings survive a notification only for a not-canceled firing of a
    /// repeatable schedule.
    fn retains_bindings(result: &TaskResult<K, V>) -> bool {
        if result.execution.is_canceled() {
            return false;
        }
        match result.execution.parent() {
            Some(parent) => parent.is_repeatable(),
            None => result.execution.is_repeatable(),
        }
    }
}
