//! Coordination engine for a distributed task queue worker pool.
//!
//! This crate implements the claim/process/finalize state machine described
//! by the task queue coordination protocol: a [`Worker`] claims one task at
//! a time from a shared node in a realtime tree-structured store, hands it
//! to a user-supplied [`Processor`], and finalizes the outcome with an
//! optimistic compare-and-set transaction. A [`TaskQueue`] composes several
//! Workers against the same node for horizontal fan-out.
//!
//! The store itself — its wire protocol, authentication, reconnection — is
//! out of scope; callers provide an implementation of the [`Store`] trait.

pub mod clock;
pub mod config;
pub mod entropy;
pub mod error;
pub mod flag;
pub mod pool;
pub mod processor;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod spec;
pub mod store;
pub mod txn;

pub use self::clock::{Clock, SystemClock};
pub use self::config::Config;
pub use self::entropy::{Entropy, SystemEntropy};
pub use self::error::{ErrorReporter, OperationKind, ProcessorError, QueueError, TransportError};
pub use self::pool::{TaskQueue, TaskQueueBuilder, TaskQueueHandle};
pub use self::processor::{Context, Processor};
pub use self::record::TaskRecord;
pub use self::runner::TransactionRunner;
pub use self::scheduler::{Component, NoopScheduler, ScheduleEvent, ScheduleGuard, Scheduler};
pub use self::spec::TaskSpec;
pub use self::store::{ChildEvent, ChildWatch, FieldWatch, Store, TransactionOutcome};
pub use self::txn::{Outcome, TransactionBody};
pub use self::worker::{Worker, WorkerBuilder, WorkerHandle, WorkerState};

mod worker;
