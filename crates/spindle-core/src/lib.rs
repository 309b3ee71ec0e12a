//! spindle-core
//!
//! An in-process task scheduling and execution engine: immediate, one-shot,
//! and fixed-delay periodic execution of keyed units of work, with
//! aggregation of sibling units under a shared major key, cooperative
//! cancellation, and observer-based outcome delivery.
//!
//! Module map:
//! - **key**: task identity (simple and composite keys)
//! - **task**: units of work (`Work` trait, single and aggregate tasks)
//! - **execution**: execution records (status machine, schedule metadata)
//! - **outcome**: terminal verdicts handed to the observer registry
//! - **observer**: observer bindings and notification delivery
//! - **engine**: the scheduling/execution façade and its firing protocol
//! - **error**: error taxonomy
//! - **observability**: live-record count snapshots

pub mod engine;
pub mod error;
pub mod execution;
pub mod key;
pub mod observability;
pub mod observer;
pub mod outcome;
pub mod task;

pub use engine::{Engine, EngineConfig};
pub use error::{Result, SpindleError};
pub use execution::{Execution, Schedule, TaskStatus};
pub use key::TaskKey;
pub use observability::ExecutionCounts;
pub use observer::{Observer, ObserverRegistry};
pub use outcome::{TaskOutcome, TaskResult};
pub use task::{AggregateTask, SingleTask, Task, Work, WorkError};
