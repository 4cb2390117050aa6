//! Scheduler trait for deterministic simulation testing.
//!
//! The [`Scheduler`] trait allows controlling the interleaving of concurrent
//! Workers sharing one task node. In production, the default [`NoopScheduler`]
//! is used, which never blocks. In simulation tests, a custom scheduler can
//! gate each component behind a permit, allowing the test harness to
//! deterministically control execution order and therefore exercise races
//! such as "owner stolen mid-flight" (§8.3) reliably.

use std::borrow::Cow;
use std::fmt;

/// Identifies a point in the claim/process/finalize loop that is requesting
/// permission to proceed.
///
/// The scheduler uses this to decide which Worker to advance next.
#[derive(Clone, Debug)]
pub enum Component {
    /// The Worker is about to run a claim transaction for a candidate task.
    Claim { worker_id: String, task_key: String },

    /// The processor is about to be invoked for a claimed task.
    Process { worker_id: String, task_key: String },

    /// A finalize transaction (resolve or reject) is about to run.
    Finalize { worker_id: String, task_key: String },

    /// The Worker is about to re-subscribe to the start-state query.
    Resubscribe { worker_id: String },

    /// A user-defined component for downstream deterministic tests.
    Custom(Cow<'static, str>),
}

/// Events emitted by the Worker at key state transitions.
///
/// These are delivered to the scheduler via [`Scheduler::notify`] for
/// logging, assertions, and driving simulation decisions.
#[derive(Clone, Debug)]
pub enum ScheduleEvent {
    /// A task was claimed by a Worker.
    TaskClaimed { worker_id: String, task_key: String },

    /// A task's claim attempt did not commit (already claimed, or malformed).
    ClaimAborted { worker_id: String, task_key: String },

    /// A task was resolved.
    TaskResolved { worker_id: String, task_key: String },

    /// A task was rejected.
    TaskRejected { worker_id: String, task_key: String },

    /// Ownership of a task was observed to change away from the claiming
    /// Worker while the processor was still running.
    OwnershipLost { worker_id: String, task_key: String },

    /// A Worker finished graceful shutdown.
    WorkerShutdown { worker_id: String },
}

/// RAII guard returned by [`Scheduler::acquire`].
///
/// While this guard is held, the scheduler knows the component is actively
/// executing. When dropped, the scheduler is notified that the step
/// completed. The default implementation is a no-op; custom schedulers can
/// use [`ScheduleGuard::on_drop`] to attach cleanup logic.
pub struct ScheduleGuard {
    inner: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduleGuard {
    /// Create a no-op guard.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Create a guard that calls `f` when dropped.
    pub fn on_drop(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }
}

impl Drop for ScheduleGuard {
    fn drop(&mut self) {
        if let Some(f) = self.inner.take() {
            f();
        }
    }
}

impl fmt::Debug for ScheduleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleGuard")
            .field("has_callback", &self.inner.is_some())
            .finish()
    }
}

/// Controls the execution order of Workers sharing a task node.
///
/// In production, the default [`NoopScheduler`] is used, which never blocks
/// and ignores all events.
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Called by a Worker before it does work for `component`.
    ///
    /// The scheduler can delay this call arbitrarily to control ordering.
    /// Returns a guard that is held while the component does its work;
    /// dropping the guard signals that the step completed.
    async fn acquire(&self, component: Component) -> ScheduleGuard;

    /// Notify the scheduler about a state transition.
    ///
    /// This is informational: the scheduler can use it for logging,
    /// assertions, or to inform future scheduling decisions.
    fn notify(&self, event: ScheduleEvent);
}

/// A no-op scheduler that never blocks and ignores all events.
///
/// This is the default scheduler used in production.
pub struct NoopScheduler;

#[async_trait::async_trait]
impl Scheduler for NoopScheduler {
    async fn acquire(&self, _component: Component) -> ScheduleGuard {
        ScheduleGuard::noop()
    }

    fn notify(&self, _event: ScheduleEvent) {}
}
