//! The firing protocol: what happens when a timer tick or an immediate
//! submission runs a task.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::Inner;
use crate::error::{Result, SpindleError};
use crate::execution::Execution;
use crate::key::TaskKey;
use crate::outcome::{TaskOutcome, TaskResult};
use crate::task::{AggregateTask, SingleTask, Task};

/// Submit an immediate execution. The worker fires once, then retires the
/// record from the tracking map.
pub(super) fn spawn_immediate<K, V>(
    inner: &Arc<Inner<K, V>>,
    key: TaskKey<K>,
    task: Task<K, V>,
    exec: Arc<Execution>,
) where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    let weak = Arc::downgrade(inner);
    let handle = {
        let exec = Arc::clone(&exec);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(err) = fire(&inner, &task, &exec).await {
                error!(key = ?key, error = %err, "engine fault during immediate firing");
            }
            inner.retire_executing(&key, &exec);
        })
    };
    exec.bind_handle(handle);
}

/// Arm the timer driver for a scheduled record.
///
/// The driver sleeps `initial_delay`, then fires; a repeatable record
/// rearms with `period` measured from the end of each firing, so firings
/// of one schedule are strictly sequential. The driver holds the engine
/// weakly and stands down when the engine is shut down or dropped, when
/// its record has been replaced, or after a one-shot / canceled /
/// engine-fatal firing.
pub(super) fn spawn_driver<K, V>(
    inner: &Arc<Inner<K, V>>,
    key: TaskKey<K>,
    task: Task<K, V>,
    exec: Arc<Execution>,
) where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    let weak = Arc::downgrade(inner);
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let is_aggregate = matches!(task, Task::Aggregate(_));
    let handle = {
        let exec = Arc::clone(&exec);
        tokio::spawn(async move {
            let Some(schedule) = exec.schedule() else {
                return;
            };
            // `subscribe` marks the current value as seen, so a driver
            // armed after shutdown must check it directly.
            if *shutdown_rx.borrow() {
                return;
            }
            let mut delay = schedule.initial_delay;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // A replaced record's driver stands down without firing.
                let live = if is_aggregate {
                    inner.is_live_aggregate(key.major(), &exec)
                } else {
                    inner.is_live_scheduled(&key, &exec)
                };
                if !live {
                    break;
                }
                let fired = fire(&inner, &task, &exec).await;
                let retire = exec.is_canceled() || !schedule.is_repeatable() || fired.is_err();
                if let Err(err) = fired {
                    error!(key = ?key, error = %err, "engine fault during scheduled firing; rearming stopped");
                }
                if retire {
                    if is_aggregate {
                        inner.retire_aggregate(key.major(), &exec);
                    } else {
                        inner.retire_scheduled(&key, &exec);
                    }
                    break;
                }
                drop(inner);
                delay = schedule.period;
            }
        })
    };
    exec.bind_handle(handle);
}

async fn fire<K, V>(inner: &Arc<Inner<K, V>>, task: &Task<K, V>, exec: &Arc<Execution>) -> Result<()>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    match task {
        Task::Single(unit) => {
            let result = run_unit(unit, exec).await;
            inner.registry.notify(&result)
        }
        Task::Aggregate(aggregate) => fire_aggregate(inner, aggregate, exec).await,
    }
}

/// Fire one unit against its record: check the cancellation flag, run the
/// work, drive the record to its terminal status.
async fn run_unit<K, V>(unit: &Arc<SingleTask<K, V>>, exec: &Arc<Execution>) -> TaskResult<K, V>
where
    K: Clone + fmt::Debug,
{
    exec.mark_started();
    if exec.is_canceled() {
        exec.mark_canceled();
        debug!(key = ?unit.key(), "firing canceled before work ran");
        return TaskResult::new(unit.key().clone(), TaskOutcome::Canceled, Arc::clone(exec));
    }
    match unit.process().await {
        Ok(value) => {
            exec.mark_completed();
            TaskResult::new(
                unit.key().clone(),
                TaskOutcome::Completed(value),
                Arc::clone(exec),
            )
        }
        Err(cause) => {
            exec.mark_failed();
            warn!(key = ?unit.key(), error = %cause, "work failed");
            TaskResult::new(
                unit.key().clone(),
                TaskOutcome::Failed(cause),
                Arc::clone(exec),
            )
        }
    }
}

/// Fan-out/fan-in for one aggregate firing.
///
/// Every member gets a fresh child record (parent = the aggregate's
/// record) published in the immediate-execution map and fired on its own
/// spawned task, bounded by the member-parallelism semaphore. One member's
/// failure, cancellation, or panic never touches its siblings. The firing
/// then waits for all members, bounded by the fan-in ceiling; a breach
/// aborts the stragglers, sweeps their records, and is an engine fault.
async fn fire_aggregate<K, V>(
    inner: &Arc<Inner<K, V>>,
    aggregate: &Arc<AggregateTask<K, V>>,
    exec: &Arc<Execution>,
) -> Result<()>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + 'static,
{
    exec.mark_started();
    if exec.is_canceled() {
        // Propagate to every member; their child firings below observe
        // the flag and report cancellation individually.
        exec.mark_canceled();
        for member in aggregate.tasks() {
            member.cancel();
        }
    }

    let semaphore = Arc::new(Semaphore::new(inner.config.member_parallelism));
    let mut members: JoinSet<Result<()>> = JoinSet::new();
    let mut children: Vec<(TaskKey<K>, Arc<Execution>)> = Vec::new();

    for member in aggregate.tasks() {
        let child = Arc::new(Execution::new_child(exec));
        if member.is_canceled() {
            child.cancel();
        }
        let member_key = member.key().clone();
        inner.publish_executing(member_key.clone(), Arc::clone(&child));
        children.push((member_key.clone(), Arc::clone(&child)));

        let inner = Arc::clone(inner);
        let aggregate = Arc::clone(aggregate);
        let semaphore = Arc::clone(&semaphore);
        members.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                // The semaphore lives for the whole firing; never closed.
                return Ok(());
            };
            let result = run_unit(&member, &child).await;
            if result.outcome.is_canceled() {
                aggregate.remove_task(&member_key);
            }
            let notified = inner.registry.notify(&result);
            inner.retire_executing(&member_key, &child);
            notified
        });
    }

    let ceiling = inner.config.fan_in_ceiling;
    let fan_in = async {
        let mut fatal = Ok(());
        while let Some(joined) = members.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => fatal = Err(err),
                Err(join_err) => {
                    // A panicking member is isolated from its siblings.
                    warn!(key = ?aggregate.key(), error = %join_err, "aggregate member aborted");
                }
            }
        }
        fatal
    };
    let waited = tokio::time::timeout(ceiling, fan_in).await;
    let outcome = match waited {
        Ok(result) => result,
        Err(_) => {
            members.abort_all();
            error!(key = ?aggregate.key(), ceiling = ?ceiling, "aggregate fan-in exceeded its ceiling");
            Err(SpindleError::FanInCeilingExceeded(ceiling))
        }
    };

    // Children that never reached their own retirement (panicked or
    // aborted members) must not linger in the tracking map.
    for (key, child) in &children {
        inner.retire_executing(key, child);
    }
    outcome
}
