//! The processor contract and the resolve/reject/setProgress callback API
//! handed to it (spec §4.3, §6.3).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{ErrorReporter, OperationKind, ProcessorError, QueueError};
use crate::runner::TransactionRunner;
use crate::scheduler::{Component, ScheduleEvent, Scheduler};
use crate::spec::TaskSpec;
use crate::store::Store;
use crate::txn::{self, TransactionBody};

/// A user-supplied unit of work (spec §4.3 "Processor contract").
///
/// Implemented automatically for any `Fn(task, context) -> impl Future<Output
/// = Result<Option<Value>, ProcessorError>>` closure, so most callers never
/// name this trait directly — see [`from_fn`].
#[async_trait]
pub trait Processor: Send + Sync {
    /// Do the work for one claimed task.
    ///
    /// The sanitised task (reserved control fields already stripped, spec
    /// §4.3 "Sanitisation") is handed in alongside a [`Context`] that exposes
    /// `set_progress`/`resolve`/`reject`. Returning `Ok(new_task)` is
    /// equivalent to calling `context.resolve(new_task)`; returning `Err(e)`
    /// is equivalent to calling `context.reject(e)` — unless the processor
    /// already settled the task itself via the context, in which case the
    /// return value is ignored (spec §4.3 "MUST ultimately cause exactly one
    /// of...").
    async fn process(&self, task: Map<String, Value>, context: Context) -> Result<Option<Value>, ProcessorError>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(Map<String, Value>, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, ProcessorError>> + Send,
{
    async fn process(&self, task: Map<String, Value>, context: Context) -> Result<Option<Value>, ProcessorError> {
        (self)(task, context).await
    }
}

/// Wrap a plain async closure as a [`Processor`] trait object.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Map<String, Value>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, ProcessorError>> + Send + 'static,
{
    Arc::new(f)
}

struct ContextInner {
    store: Arc<dyn Store>,
    runner: Arc<TransactionRunner>,
    scheduler: Arc<dyn Scheduler>,
    spec: Arc<TaskSpec>,
    owner_token: String,
    worker_id: String,
    task_key: String,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    settled: AtomicBool,
    report_error: ErrorReporter,
}

/// The callback surface handed to a [`Processor`] for one claimed task (spec
/// §6.3).
///
/// Every method here runs a fresh [`TransactionBody`] through the
/// [`TransactionRunner`], using the owner token captured at claim time. If
/// the Worker has since advanced its generation counter — because ownership
/// of the task was observed to move elsewhere (spec §4.3 "Ownership-loss
/// handling") — every call here fails fast with
/// [`QueueError::OwnershipLost`] without spending a transaction attempt
/// (spec §5 "early-check optimisation").
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn Store>,
        runner: Arc<TransactionRunner>,
        scheduler: Arc<dyn Scheduler>,
        spec: Arc<TaskSpec>,
        owner_token: String,
        worker_id: String,
        task_key: String,
        generation: Arc<AtomicU64>,
        my_generation: u64,
        report_error: ErrorReporter,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                store,
                runner,
                scheduler,
                spec,
                owner_token,
                worker_id,
                task_key,
                generation,
                my_generation,
                settled: AtomicBool::new(false),
                report_error,
            }),
        }
    }

    fn is_current_generation(&self) -> bool {
        self.inner.generation.load(Ordering::Acquire) == self.inner.my_generation
    }

    /// Whether this task has already been resolved or rejected (by the
    /// processor itself, through this context).
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    fn notify_outcome(&self, kind: OperationKind, committed: bool) {
        if !matches!(kind, OperationKind::Resolve | OperationKind::Reject) {
            return;
        }

        let worker_id = self.inner.worker_id.clone();
        let task_key = self.inner.task_key.clone();
        let event = match (kind, committed) {
            (OperationKind::Resolve, true) => ScheduleEvent::TaskResolved { worker_id, task_key },
            (OperationKind::Reject, true) => ScheduleEvent::TaskRejected { worker_id, task_key },
            (_, false) => ScheduleEvent::OwnershipLost { worker_id, task_key },
            _ => return,
        };
        self.inner.scheduler.notify(event);
    }

    async fn run_body(&self, body: Arc<dyn TransactionBody>) -> Result<(), QueueError> {
        let kind = body.kind();

        if !self.is_current_generation() {
            let err = QueueError::OwnershipLost;
            (self.inner.report_error)(err.clone());
            self.notify_outcome(kind, false);
            return Err(err);
        }

        let _permit = self
            .inner
            .scheduler
            .acquire(Component::Finalize {
                worker_id: self.inner.worker_id.clone(),
                task_key: self.inner.task_key.clone(),
            })
            .await;

        let outcome = self
            .inner
            .runner
            .run(self.inner.store.as_ref(), body)
            .await
            .map_err(|err| {
                (self.inner.report_error)(err.clone());
                err
            })?;

        if outcome.committed {
            self.notify_outcome(kind, true);
            Ok(())
        } else {
            let err = QueueError::OwnershipLost;
            (self.inner.report_error)(err.clone());
            self.notify_outcome(kind, false);
            Err(err)
        }
    }

    /// Report progress `0..=100`. Accepts a raw JSON value so that the
    /// non-integer and out-of-range boundary cases from spec §8.3 are
    /// rejected the same way a dynamically typed port would reject them,
    /// rather than being ruled out already by Rust's type system.
    pub async fn set_progress(&self, progress: Value) -> Result<(), QueueError> {
        let progress = validate_progress(&progress)?;

        let body = Arc::new(txn::SetProgress {
            spec: self.inner.spec.clone(),
            owner_token: self.inner.owner_token.clone(),
            progress,
        });

        self.run_body(body).await
    }

    /// Resolve the task successfully. A no-op (returns
    /// [`QueueError::AlreadySettled`]) if the task was already resolved or
    /// rejected.
    pub async fn resolve(&self, new_task: Option<Value>) -> Result<(), QueueError> {
        if self.inner.settled.swap(true, Ordering::AcqRel) {
            let err = QueueError::AlreadySettled;
            (self.inner.report_error)(err.clone());
            return Err(err);
        }

        let body = Arc::new(txn::Resolve {
            spec: self.inner.spec.clone(),
            owner_token: self.inner.owner_token.clone(),
            new_task,
        });

        self.run_body(body).await
    }

    /// Reject the task. A no-op (returns [`QueueError::AlreadySettled`]) if
    /// the task was already resolved or rejected.
    pub async fn reject(&self, error: ProcessorError) -> Result<(), QueueError> {
        if self.inner.settled.swap(true, Ordering::AcqRel) {
            let err = QueueError::AlreadySettled;
            (self.inner.report_error)(err.clone());
            return Err(err);
        }

        let body = Arc::new(txn::Reject {
            spec: self.inner.spec.clone(),
            owner_token: self.inner.owner_token.clone(),
            error,
        });

        self.run_body(body).await
    }
}

fn validate_progress(value: &Value) -> Result<u8, QueueError> {
    let n = match value.as_number() {
        Some(n) => n,
        None => return Err(QueueError::InvalidProgress(format!("progress must be an integer, got {value}"))),
    };

    let as_int = n
        .as_i64()
        .or_else(|| n.as_u64().map(|v| v as i64))
        .ok_or_else(|| QueueError::InvalidProgress(format!("progress must be an integer, got {value}")))?;

    if !(0..=100).contains(&as_int) {
        return Err(QueueError::InvalidProgress(format!("progress {as_int} is out of range 0..=100")));
    }

    Ok(as_int as u8)
}

/// Sanitise `record` before handing it to the processor (spec §4.3).
pub(crate) fn sanitise(record: &Value) -> Map<String, Value> {
    match record.as_object() {
        Some(map) => crate::record::TaskRecord::from_map(map.clone()).sanitised(),
        None => Map::new(),
    }
}

/// Normalise an arbitrary rejection reason the way spec §4.3 normalises
/// thrown errors: a `{message, stack?}`-shaped object keeps its message and
/// stack, a bare string becomes the message, and `null`/absent clears both
/// fields.
pub fn normalize_rejection(value: Option<Value>) -> ProcessorError {
    match value {
        None | Some(Value::Null) => ProcessorError::empty(),
        Some(Value::String(s)) => ProcessorError::from_message(s),
        Some(Value::Object(map)) => match map.get("message").and_then(Value::as_str) {
            Some(message) => match map.get("stack").and_then(Value::as_str) {
                Some(stack) => ProcessorError::with_stack(message, stack),
                None => ProcessorError::from_message(message),
            },
            None => ProcessorError::from_message(coerce_to_string(&Value::Object(map))),
        },
        Some(other) => ProcessorError::from_message(coerce_to_string(&other)),
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_integer_progress() {
        assert!(matches!(
            validate_progress(&Value::from(50.5)),
            Err(QueueError::InvalidProgress(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_progress() {
        assert!(matches!(validate_progress(&Value::from(-1)), Err(QueueError::InvalidProgress(_))));
        assert!(matches!(validate_progress(&Value::from(101)), Err(QueueError::InvalidProgress(_))));
    }

    #[test]
    fn rejects_string_progress() {
        assert!(matches!(
            validate_progress(&Value::from("50")),
            Err(QueueError::InvalidProgress(_))
        ));
    }

    #[test]
    fn accepts_boundary_progress_values() {
        assert_eq!(validate_progress(&Value::from(0)).unwrap(), 0);
        assert_eq!(validate_progress(&Value::from(100)).unwrap(), 100);
    }

    #[test]
    fn normalizes_string_rejection() {
        let err = normalize_rejection(Some(Value::from("boom")));
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert_eq!(err.error_stack, None);
    }

    #[test]
    fn normalizes_absent_rejection() {
        let err = normalize_rejection(None);
        assert_eq!(err.error, None);
        assert_eq!(err.error_stack, None);
    }

    #[test]
    fn normalizes_message_shaped_rejection() {
        let value = serde_json::json!({"message": "boom", "stack": "at foo.rs:1"});
        let err = normalize_rejection(Some(value));
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert_eq!(err.error_stack.as_deref(), Some("at foo.rs:1"));
    }
}
