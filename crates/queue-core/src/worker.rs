//! The Worker: a single listen/claim/process/finalize loop against one
//! shared task node (spec §4.4).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::entropy::{Entropy, SystemEntropy};
use crate::error::{ErrorReporter, ProcessorError, QueueError};
use crate::flag::{WorkerShutdownFlag, WorkerShutdownGuard};
use crate::processor::{self, Context, Processor};
use crate::record::{FIELD_OWNER, FIELD_STATE};
use crate::runner::TransactionRunner;
use crate::scheduler::{Component, NoopScheduler, ScheduleEvent, Scheduler};
use crate::spec::TaskSpec;
use crate::store::Store;
use crate::txn::Claim;

/// Observable phase of a [`Worker`]'s claim/process/finalize loop.
///
/// Exists mainly so tests can assert on progress without racing the loop
/// itself; production code has no reason to poll it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Listening,
    Claiming,
    Processing,
    Finalizing,
    ShuttingDown,
    Stopped,
}

/// Builds a [`Worker`] against a shared task node.
pub struct WorkerBuilder {
    store: Arc<dyn Store>,
    spec: TaskSpec,
    processor: Arc<dyn Processor>,
    worker_id: String,
    resubscribe_backoff: Duration,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn Entropy>,
    scheduler: Arc<dyn Scheduler>,
    report_error: ErrorReporter,
}

impl WorkerBuilder {
    /// `worker_id` should be of the form `"<queueId>:<index>"` (spec §3.3);
    /// the owner token actually written to each claimed task is derived from
    /// it by appending a per-attempt task number.
    pub fn new(
        store: Arc<dyn Store>,
        spec: TaskSpec,
        processor: Arc<dyn Processor>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            spec,
            processor,
            worker_id: worker_id.into(),
            resubscribe_backoff: Duration::from_millis(250),
            clock: Arc::new(SystemClock),
            entropy: Arc::new(SystemEntropy),
            scheduler: Arc::new(NoopScheduler),
            report_error: Arc::new(|_| {}),
        }
    }

    pub fn resubscribe_backoff(mut self, backoff: Duration) -> Self {
        self.resubscribe_backoff = backoff;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn entropy(mut self, entropy: Arc<dyn Entropy>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn report_error(mut self, report_error: ErrorReporter) -> Self {
        self.report_error = report_error;
        self
    }

    pub fn build(self) -> Result<Worker, QueueError> {
        self.spec.validate()?;

        let runner = Arc::new(TransactionRunner::new(self.clock.clone()));

        Ok(Worker {
            store: self.store,
            spec: Arc::new(self.spec),
            processor: self.processor,
            worker_id: self.worker_id,
            resubscribe_backoff: self.resubscribe_backoff,
            clock: self.clock,
            entropy: self.entropy,
            scheduler: self.scheduler,
            runner,
            report_error: self.report_error,
            task_number: AtomicU64::new(0),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: WorkerShutdownFlag::new(),
            state: Mutex::new(WorkerState::Listening),
        })
    }
}

/// A handle that can request graceful shutdown of its [`Worker`] from
/// another task.
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: WorkerShutdownFlag,
}

impl WorkerHandle {
    /// Request shutdown. Idempotent: calling this more than once, or after
    /// the worker has already stopped, has no additional effect.
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }
}

/// A single claim/process/finalize loop running against one shared task
/// node (spec §4.4 "Worker").
pub struct Worker {
    store: Arc<dyn Store>,
    spec: Arc<TaskSpec>,
    processor: Arc<dyn Processor>,
    worker_id: String,
    resubscribe_backoff: Duration,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn Entropy>,
    scheduler: Arc<dyn Scheduler>,
    runner: Arc<TransactionRunner>,
    report_error: ErrorReporter,

    /// Incremented each time a claim attempt begins; the owner token written
    /// to the store is `"<worker_id>:<task_number>"` (spec §3.3 "Identities").
    task_number: AtomicU64,

    /// Bumped whenever ownership of the in-flight task is observed to move
    /// away from this worker, so a stale `Context` can fail fast instead of
    /// spending a transaction attempt (spec §5 "ownership-loss detection").
    generation: Arc<AtomicU64>,
    shutdown: WorkerShutdownFlag,
    state: Mutex<WorkerState>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("resubscribe_backoff", &self.resubscribe_backoff)
            .field("task_number", &self.task_number)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// A fresh owner token for a new claim attempt (spec §3.3).
    fn next_owner_token(&self) -> String {
        let n = self.task_number.fetch_add(1, Ordering::AcqRel);
        format!("{}:{}", self.worker_id, n)
    }

    /// Run the claim/process/finalize loop until shutdown is requested.
    ///
    /// Shutdown is monotonic and idempotent (spec §4.4): once raised, the
    /// worker finishes whatever task it is currently processing and then
    /// stops; it never resumes listening for new candidates.
    pub async fn run(&mut self) -> Result<(), QueueError> {
        let _guard = WorkerShutdownGuard::new(&self.shutdown, &self.worker_id);
        let mut shutdown = std::pin::pin!(self.shutdown.wait());

        'outer: loop {
            self.set_state(WorkerState::Listening);

            let key = tokio::select! {
                biased;

                _ = shutdown.as_mut() => break 'outer,
                result = self.listen_for_candidate() => match result {
                    Ok(Some(key)) => key,
                    Ok(None) => continue 'outer,
                    Err(err) => {
                        (self.report_error)(err);
                        self.backoff().await;
                        continue 'outer;
                    }
                },
            };

            self.set_state(WorkerState::Claiming);
            let claimed = match self.claim(&key).await {
                Ok(Some((owner_token, record))) => (owner_token, record),
                Ok(None) => continue 'outer,
                Err(err) => {
                    (self.report_error)(err);
                    self.backoff().await;
                    continue 'outer;
                }
            };

            self.process_and_finalize(&key, claimed.0, claimed.1).await;
        }

        self.set_state(WorkerState::ShuttingDown);
        self.scheduler.notify(ScheduleEvent::WorkerShutdown {
            worker_id: self.worker_id.clone(),
        });
        self.set_state(WorkerState::Stopped);

        Ok(())
    }

    async fn listen_for_candidate(&self) -> Result<Option<String>, QueueError> {
        let _permit = self
            .scheduler
            .acquire(Component::Resubscribe {
                worker_id: self.worker_id.clone(),
            })
            .await;

        let mut watch = self
            .store
            .watch_next_child(FIELD_STATE, self.spec.start_state.as_deref())
            .await?;

        match watch.next().await {
            Some(Ok(event)) => Ok(Some(event.key)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    async fn claim(&self, key: &str) -> Result<Option<(String, Value)>, QueueError> {
        let child = self.store.child(key);
        let owner_token = self.next_owner_token();

        let _permit = self
            .scheduler
            .acquire(Component::Claim {
                worker_id: self.worker_id.clone(),
                task_key: key.to_string(),
            })
            .await;

        let body = Arc::new(Claim {
            spec: self.spec.clone(),
            owner_token: owner_token.clone(),
        });

        let outcome = self.runner.run(child.as_ref(), body).await?;

        // A committed outcome isn't necessarily a successful claim: `Claim`
        // also commits the malformed-task branch straight to `error_state`
        // (spec §4.3 transition table). Only a record that actually reached
        // `in_progress_state` is ours to process.
        let claimed_into_progress = outcome.committed
            && outcome
                .value
                .as_ref()
                .and_then(|v| v.as_object())
                .and_then(|m| m.get(FIELD_STATE))
                .and_then(Value::as_str)
                == Some(self.spec.in_progress_state.as_str());

        if claimed_into_progress {
            self.scheduler.notify(ScheduleEvent::TaskClaimed {
                worker_id: self.worker_id.clone(),
                task_key: key.to_string(),
            });
            Ok(outcome.value.map(|value| (owner_token, value)))
        } else {
            self.scheduler.notify(ScheduleEvent::ClaimAborted {
                worker_id: self.worker_id.clone(),
                task_key: key.to_string(),
            });
            Ok(None)
        }
    }

    async fn process_and_finalize(&self, key: &str, owner_token: String, claimed: Value) {
        self.set_state(WorkerState::Processing);

        let child = self.store.child(key);
        let my_generation = self.generation.load(Ordering::Acquire);
        let watch_handle = self.spawn_ownership_watch(child.clone(), key.to_string(), owner_token.clone(), my_generation);

        let context = Context::new(
            child,
            self.runner.clone(),
            self.scheduler.clone(),
            self.spec.clone(),
            owner_token,
            self.worker_id.clone(),
            key.to_string(),
            self.generation.clone(),
            my_generation,
            self.report_error.clone(),
        );

        let task = processor::sanitise(&claimed);

        let _permit = self
            .scheduler
            .acquire(Component::Process {
                worker_id: self.worker_id.clone(),
                task_key: key.to_string(),
            })
            .await;

        let outcome = AssertUnwindSafe(self.processor.process(task, context.clone()))
            .catch_unwind()
            .await;

        watch_handle.abort();
        self.set_state(WorkerState::Finalizing);

        if context.is_settled() {
            return;
        }

        let result = match outcome {
            Ok(Ok(new_task)) => context.resolve(new_task).await,
            Ok(Err(error)) => context.reject(error).await,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(worker_id = %self.worker_id, task_key = key, "processor panicked: {message}");
                context.reject(ProcessorError::from_message(message)).await
            }
        };

        if let Err(err) = result {
            (self.report_error)(err);
        }
    }

    /// Watch the claimed task's `_owner` field for the lifetime of
    /// processing, advancing [`Worker::generation`] the moment ownership is
    /// observed to move elsewhere (spec §5).
    fn spawn_ownership_watch(&self, child: Arc<dyn Store>, task_key: String, owner_token: String, my_generation: u64) -> JoinHandle<()> {
        let generation = self.generation.clone();
        let report_error = self.report_error.clone();

        tokio::spawn(async move {
            let mut watch = match child.watch_field(FIELD_OWNER).await {
                Ok(watch) => watch,
                Err(err) => {
                    report_error(QueueError::from(err));
                    return;
                }
            };

            loop {
                match watch.changed().await {
                    Ok(value) => {
                        let current_owner = value.as_ref().and_then(Value::as_str);
                        if current_owner != Some(owner_token.as_str()) {
                            generation.fetch_add(1, Ordering::AcqRel);
                            tracing::debug!(
                                task_key = %task_key,
                                generation = my_generation,
                                "observed ownership change while processing"
                            );
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
    }

    async fn backoff(&self) {
        let quarter = (self.resubscribe_backoff / 4).as_nanos().max(1);
        let jitter = self.entropy.random_range(0..quarter);
        let delay = self
            .resubscribe_backoff
            .saturating_sub(Duration::from_nanos(jitter as u64));
        self.clock.sleep(delay).await;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "processor panicked with a non-string payload".to_string()
    }
}
