//! Scheduling & execution engine.
//!
//! The façade over the tracking state: accepts immediate, one-shot, and
//! periodic requests, deduplicates concurrent submissions per identity,
//! drives timers and workers, and runs the aggregate fan-out/fan-in
//! protocol.

mod config;
mod firing;
#[cfg(test)]
mod tests;

pub use config::EngineConfig;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SpindleError};
use crate::execution::{Execution, Schedule, TaskStatus};
use crate::key::TaskKey;
use crate::observability::ExecutionCounts;
use crate::observer::{Observer, ObserverRegistry};
use crate::task::{AggregateTask, SingleTask, Task};

/// The scheduling and execution engine.
///
/// Cheaply cloneable; clones share one instance. All tracking state is
/// per-instance, so multiple engines coexist in one process. Dropping the
/// last clone (or calling [`Engine::shutdown`]) stands every timer driver
/// down at its next checkpoint; in-flight firings run to completion.
pub struct Engine<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Engine<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Shared per-instance state. Spawned drivers hold this weakly so an engine
/// dropped by its callers is actually torn down.
pub(crate) struct Inner<K, V> {
    config: EngineConfig,
    state: RwLock<EngineState<K, V>>,
    registry: ObserverRegistry<K, V>,
    shutdown_tx: watch::Sender<bool>,
}

/// The identity -> record tracking maps.
///
/// One lock makes "check absence, then create" atomic; it is held only for
/// map and registry mutation, never across an await.
struct EngineState<K, V> {
    /// Live immediate executions (including aggregate member children).
    executing: HashMap<TaskKey<K>, Arc<Execution>>,
    /// Live simple-keyed scheduled records.
    scheduled: HashMap<TaskKey<K>, Arc<Execution>>,
    /// Live aggregate scheduled records by major key. A simple schedule
    /// and an aggregate share a major value without sharing an identity,
    /// so their records are tracked apart.
    scheduled_aggregates: HashMap<K, Arc<Execution>>,
    /// Aggregates by major key, created lazily on the first composite
    /// schedule for that key.
    aggregates: HashMap<K, Arc<AggregateTask<K, V>>>,
}

impl<K, V> EngineState<K, V> {
    fn new() -> Self {
        Self {
            executing: HashMap::new(),
            scheduled: HashMap::new(),
            scheduled_aggregates: HashMap::new(),
            aggregates: HashMap::new(),
        }
    }
}

impl<K, V> Engine<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(EngineState::new()),
                registry: ObserverRegistry::new(),
                shutdown_tx,
            }),
        }
    }

    /// Run a task immediately on a spawned worker.
    ///
    /// The observers are merged with any existing bindings for the task's
    /// key. If a live immediate execution already exists for that key, it
    /// is returned and no new work is started: concurrent callers get the
    /// same record and exactly one worker is submitted.
    pub fn execute(
        &self,
        task: impl Into<Task<K, V>>,
        observers: Vec<Arc<dyn Observer<V>>>,
    ) -> Result<Arc<Execution>> {
        if observers.is_empty() {
            return Err(SpindleError::NoObservers);
        }
        let task = task.into();
        let key = task.key().clone();
        let exec = {
            let mut state = self.inner.state_write();
            for observer in observers {
                self.inner.registry.add(key.clone(), observer);
            }
            if let Some(existing) = state.executing.get(&key) {
                debug!(key = ?key, "execute joined the live record");
                return Ok(Arc::clone(existing));
            }
            let exec = Arc::new(Execution::new());
            if task.is_canceled() {
                exec.cancel();
            }
            state.executing.insert(key.clone(), Arc::clone(&exec));
            exec
        };
        debug!(key = ?key, execution = %exec.id(), "accepted immediate execution");
        firing::spawn_immediate(&self.inner, key, task, Arc::clone(&exec));
        Ok(exec)
    }

    /// Schedule a one-shot run after `initial_delay`.
    pub fn schedule_once(
        &self,
        initial_delay: Duration,
        task: impl Into<Task<K, V>>,
        observers: Vec<Arc<dyn Observer<V>>>,
    ) -> Result<Arc<Execution>> {
        self.schedule(initial_delay, Duration::ZERO, task, observers)
    }

    /// Schedule a run after `initial_delay`, repeating every `period` if
    /// the period is non-zero.
    ///
    /// The period is measured from the end of the previous firing
    /// (fixed-delay), so two firings of one schedule never overlap.
    ///
    /// A composite-keyed task attaches to the aggregate for its major key,
    /// lazily creating both the aggregate and its scheduled record; every
    /// sibling scheduled under the same major key gets the same record
    /// back. A simple-keyed task replaces any live simple schedule for its
    /// exact key: the old record is flagged canceled, its bindings are
    /// dropped, and its driver stands down without firing again. A simple
    /// schedule and an aggregate are distinct identities even when they
    /// share a major value; neither replaces the other.
    pub fn schedule(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: impl Into<Task<K, V>>,
        observers: Vec<Arc<dyn Observer<V>>>,
    ) -> Result<Arc<Execution>> {
        if initial_delay.is_zero() {
            return Err(SpindleError::ZeroInitialDelay);
        }
        if observers.is_empty() {
            return Err(SpindleError::NoObservers);
        }
        let schedule = Schedule {
            initial_delay,
            period,
        };
        match task.into() {
            Task::Single(unit) if unit.key().is_composite() => {
                self.schedule_composite(schedule, unit, observers)
            }
            task => self.schedule_simple(schedule, task, observers),
        }
    }

    fn schedule_composite(
        &self,
        schedule: Schedule,
        unit: Arc<SingleTask<K, V>>,
        observers: Vec<Arc<dyn Observer<V>>>,
    ) -> Result<Arc<Execution>> {
        let unit_key = unit.key().clone();
        let agg_key = unit_key.aggregate_key();
        let (aggregate, exec, armed) = {
            let mut state = self.inner.state_write();
            let aggregate = Arc::clone(
                state
                    .aggregates
                    .entry(unit_key.major().clone())
                    .or_insert_with_key(|major| Arc::new(AggregateTask::new(major.clone()))),
            );
            aggregate.add_task(Arc::clone(&unit));
            // The last schedule call for a given unit wins its bindings.
            self.inner.registry.remove_all(&unit_key);
            for observer in observers {
                self.inner.registry.add(unit_key.clone(), observer);
            }
            match state.scheduled_aggregates.get(unit_key.major()) {
                Some(existing) => (aggregate, Arc::clone(existing), false),
                None => {
                    let exec = Arc::new(Execution::new_scheduled(schedule));
                    if aggregate.is_canceled() {
                        exec.cancel();
                    }
                    state
                        .scheduled_aggregates
                        .insert(unit_key.major().clone(), Arc::clone(&exec));
                    (aggregate, exec, true)
                }
            }
        };
        if armed {
            debug!(key = ?agg_key, execution = %exec.id(), "armed aggregate schedule");
            firing::spawn_driver(
                &self.inner,
                agg_key,
                Task::Aggregate(aggregate),
                Arc::clone(&exec),
            );
        } else {
            debug!(key = ?agg_key, unit = ?unit_key, "attached unit to live aggregate");
        }
        Ok(exec)
    }

    fn schedule_simple(
        &self,
        schedule: Schedule,
        task: Task<K, V>,
        observers: Vec<Arc<dyn Observer<V>>>,
    ) -> Result<Arc<Execution>> {
        let key = task.key().clone();
        let exec = {
            let mut state = self.inner.state_write();
            if let Some(old) = state.scheduled.remove(&key) {
                // Clean replacement: the old driver observes it is no
                // longer the live record and stands down without firing
                // against the new bindings. An aggregate sharing the major
                // value is a different identity and is left untouched.
                old.cancel();
                self.inner.registry.remove_all(&key);
                debug!(key = ?key, replaced = %old.id(), "replaced live schedule");
            }
            for observer in observers {
                self.inner.registry.add(key.clone(), observer);
            }
            let exec = Arc::new(Execution::new_scheduled(schedule));
            if task.is_canceled() {
                exec.cancel();
            }
            state.scheduled.insert(key.clone(), Arc::clone(&exec));
            exec
        };
        debug!(key = ?key, execution = %exec.id(), "armed schedule");
        firing::spawn_driver(&self.inner, key, task, Arc::clone(&exec));
        Ok(exec)
    }

    /// The live record for a key: immediate executions first, then simple
    /// schedules, then the aggregate tracked under a simple key's value.
    pub fn execution(&self, key: &TaskKey<K>) -> Option<Arc<Execution>> {
        let state = self.inner.state_read();
        state
            .executing
            .get(key)
            .or_else(|| state.scheduled.get(key))
            .or_else(|| match key {
                TaskKey::Simple(major) => state.scheduled_aggregates.get(major),
                TaskKey::Composite { .. } => None,
            })
            .cloned()
    }

    /// Request cancellation of the live record for a key.
    ///
    /// Only flips the record's flag; work already past its cancellation
    /// check runs to completion. Idempotent, and a no-op for an unknown
    /// key.
    pub fn cancel(&self, key: &TaskKey<K>) {
        if let Some(exec) = self.execution(key) {
            exec.cancel();
            debug!(key = ?key, execution = %exec.id(), "cancellation requested");
        }
    }

    /// Status of the live record, or `NotStarted` if there is none.
    pub fn task_status(&self, key: &TaskKey<K>) -> TaskStatus {
        self.execution(key)
            .map_or(TaskStatus::NotStarted, |exec| exec.status())
    }

    pub fn is_canceled(&self, key: &TaskKey<K>) -> bool {
        self.execution(key).is_some_and(|exec| exec.is_canceled())
    }

    /// Terminal status *and* a finished driver for the live record.
    /// Absence of a record yields `false`.
    pub fn is_done(&self, key: &TaskKey<K>) -> bool {
        self.execution(key).is_some_and(|exec| exec.is_done())
    }

    /// Per-status counts of the live records across all tracking maps.
    pub fn counts_by_status(&self) -> ExecutionCounts {
        let state = self.inner.state_read();
        let mut counts = ExecutionCounts::default();
        let execs = state
            .executing
            .values()
            .chain(state.scheduled.values())
            .chain(state.scheduled_aggregates.values());
        for exec in execs {
            counts.record(exec.status());
        }
        counts
    }

    /// Stand every timer driver down at its next checkpoint. In-flight
    /// firings run to completion.
    pub fn shutdown(&self) {
        // store unconditionally: `send` would drop the value when no
        // driver holds a receiver yet
        self.inner.shutdown_tx.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn observers_bound(&self, key: &TaskKey<K>) -> usize {
        self.inner.registry.observer_count(key)
    }
}

impl<K, V> Default for Engine<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn state_read(&self) -> RwLockReadGuard<'_, EngineState<K, V>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, EngineState<K, V>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Is this record still the live simple scheduled entry for its key?
    fn is_live_scheduled(&self, key: &TaskKey<K>, exec: &Arc<Execution>) -> bool {
        self.state_read()
            .scheduled
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(live, exec))
    }

    /// Is this record still the live aggregate entry for its major key?
    fn is_live_aggregate(&self, major: &K, exec: &Arc<Execution>) -> bool {
        self.state_read()
            .scheduled_aggregates
            .get(major)
            .is_some_and(|live| Arc::ptr_eq(live, exec))
    }

    fn publish_executing(&self, key: TaskKey<K>, exec: Arc<Execution>) {
        self.state_write().executing.insert(key, exec);
    }

    /// Remove an immediate entry, guarded by record identity so an
    /// unrelated live record under the same key is not evicted.
    fn retire_executing(&self, key: &TaskKey<K>, exec: &Arc<Execution>) {
        let mut state = self.state_write();
        if state
            .executing
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(live, exec))
        {
            state.executing.remove(key);
        }
    }

    /// Remove a simple scheduled entry, identity-guarded.
    fn retire_scheduled(&self, key: &TaskKey<K>, exec: &Arc<Execution>) {
        let mut state = self.state_write();
        if state
            .scheduled
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(live, exec))
        {
            state.scheduled.remove(key);
        }
    }

    /// Remove an aggregate's scheduled record (identity-guarded) together
    /// with the aggregate itself, so a later composite schedule for the
    /// major key starts fresh.
    fn retire_aggregate(&self, major: &K, exec: &Arc<Execution>) {
        let mut state = self.state_write();
        if state
            .scheduled_aggregates
            .get(major)
            .is_some_and(|live| Arc::ptr_eq(live, exec))
        {
            state.scheduled_aggregates.remove(major);
            state.aggregates.remove(major);
        }
    }
}
