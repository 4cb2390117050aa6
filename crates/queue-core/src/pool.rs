//! Composes multiple [`Worker`]s against one shared task node (spec §4.4
//! "Pool").

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entropy::{Entropy, SystemEntropy};
use crate::error::{ErrorReporter, QueueError};
use crate::processor::Processor;
use crate::scheduler::{NoopScheduler, Scheduler};
use crate::spec::TaskSpec;
use crate::store::Store;
use crate::worker::{Worker, WorkerBuilder, WorkerHandle};

/// Builds a [`TaskQueue`]: `config.num_workers` independent [`Worker`]s all
/// claiming from the same task node, each with its own worker id of the
/// form `"<queue_id>:<index>"` (spec §3.3, §4.4).
pub struct TaskQueueBuilder {
    store: Arc<dyn Store>,
    spec: TaskSpec,
    processor: Arc<dyn Processor>,
    queue_id: String,
    config: Config,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn Entropy>,
    scheduler: Arc<dyn Scheduler>,
    report_error: ErrorReporter,
}

impl TaskQueueBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        spec: TaskSpec,
        processor: Arc<dyn Processor>,
        queue_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            spec,
            processor,
            queue_id: queue_id.into(),
            config: Config::default(),
            clock: Arc::new(SystemClock),
            entropy: Arc::new(SystemEntropy),
            scheduler: Arc::new(NoopScheduler),
            report_error: Arc::new(|_| {}),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
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

    /// Validate the spec and config, then build one [`Worker`] per
    /// `config.num_workers`.
    pub fn build(self) -> Result<TaskQueue, QueueError> {
        self.spec.validate()?;

        if self.config.num_workers == 0 {
            return Err(QueueError::Configuration(
                "num_workers must be at least 1".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(self.config.num_workers);
        for index in 0..self.config.num_workers {
            let worker_id = format!("{}:{}", self.queue_id, index);
            let worker = WorkerBuilder::new(self.store.clone(), self.spec.clone(), self.processor.clone(), worker_id)
                .resubscribe_backoff(self.config.resubscribe_backoff)
                .clock(self.clock.clone())
                .entropy(self.entropy.clone())
                .scheduler(self.scheduler.clone())
                .report_error(self.report_error.clone())
                .build()?;
            workers.push(worker);
        }

        Ok(TaskQueue { workers })
    }
}

/// A fixed-size pool of [`Worker`]s claiming from the same task node.
///
/// `TaskQueue` itself is inert; call [`TaskQueue::start`] to spawn each
/// worker's loop and get back a [`TaskQueueHandle`] for shutdown.
#[derive(Debug)]
pub struct TaskQueue {
    workers: Vec<Worker>,
}

impl TaskQueue {
    pub fn builder(
        store: Arc<dyn Store>,
        spec: TaskSpec,
        processor: Arc<dyn Processor>,
        queue_id: impl Into<String>,
    ) -> TaskQueueBuilder {
        TaskQueueBuilder::new(store, spec, processor, queue_id)
    }

    /// The worker ids of the workers that make up this pool, in index order.
    /// Useful for tests that want to assert on which worker ends up owning a
    /// given task.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.worker_id().to_string()).collect()
    }

    /// Spawn every worker's loop onto the current tokio runtime.
    pub fn start(self) -> TaskQueueHandle {
        let mut handles = Vec::with_capacity(self.workers.len());
        let mut tasks = JoinSet::new();

        for mut worker in self.workers {
            handles.push(worker.handle());
            tasks.spawn(async move { worker.run().await });
        }

        TaskQueueHandle {
            handles,
            tasks: AsyncMutex::new(Some(tasks)),
        }
    }
}

/// Handle to a running [`TaskQueue`]. Dropping this does not stop the
/// workers; call [`TaskQueueHandle::shutdown`] explicitly.
pub struct TaskQueueHandle {
    handles: Vec<WorkerHandle>,
    tasks: AsyncMutex<Option<JoinSet<Result<(), QueueError>>>>,
}

impl TaskQueueHandle {
    /// Request shutdown of every worker in the pool. Idempotent, and safe
    /// to call before any worker has finished its current task (spec §4.4
    /// "the pool's shutdown fans out to every worker").
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.shutdown();
        }
    }

    /// Wait for every worker to finish shutting down.
    ///
    /// # Panics
    ///
    /// Panics if called more than once concurrently.
    pub async fn join(&self) {
        let mut guard = self.tasks.lock().await;
        let mut set = guard.take().expect("TaskQueueHandle::join called more than once");

        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::error!("worker exited with an error: {err}"),
                Err(err) => tracing::error!("worker task panicked: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_processor() -> Arc<dyn Processor> {
        crate::processor::from_fn(|_task, _ctx| async move { Ok(None) })
    }

    struct UnimplementedStore;

    #[async_trait::async_trait]
    impl Store for UnimplementedStore {
        fn key(&self) -> &str {
            "root"
        }
        fn child(&self, _key: &str) -> Arc<dyn Store> {
            unimplemented!()
        }
        async fn push(&self, _value: Option<serde_json::Value>) -> Result<Arc<dyn Store>, crate::error::TransportError> {
            unimplemented!()
        }
        async fn once(&self) -> Result<Option<serde_json::Value>, crate::error::TransportError> {
            unimplemented!()
        }
        async fn transaction(
            &self,
            _body: Arc<dyn crate::txn::TransactionBody>,
        ) -> Result<crate::store::TransactionOutcome, crate::error::TransportError> {
            unimplemented!()
        }
        async fn watch_next_child(
            &self,
            _field: &str,
            _value: Option<&str>,
        ) -> Result<crate::store::ChildWatch, crate::error::TransportError> {
            unimplemented!()
        }
        async fn watch_field(&self, _field: &str) -> Result<crate::store::FieldWatch, crate::error::TransportError> {
            unimplemented!()
        }
    }

    #[test]
    fn rejects_zero_workers() {
        let store: Arc<dyn Store> = Arc::new(UnimplementedStore);
        let err = TaskQueueBuilder::new(store, TaskSpec::default(), noop_processor(), "queue")
            .config(Config { num_workers: 0, ..Config::default() })
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn assigns_sequential_worker_ids() {
        let store: Arc<dyn Store> = Arc::new(UnimplementedStore);
        let queue = TaskQueueBuilder::new(store, TaskSpec::default(), noop_processor(), "my-queue")
            .config(Config { num_workers: 3, ..Config::default() })
            .build()
            .unwrap();

        assert_eq!(
            queue.worker_ids(),
            vec!["my-queue:0".to_string(), "my-queue:1".to_string(), "my-queue:2".to_string()]
        );
    }
}
