//! Executes a [`TransactionBody`] against a [`Store`] as a retried operation
//! (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::QueueError;
use crate::store::{Store, TransactionOutcome};
use crate::txn::TransactionBody;

/// Runs a [`TransactionBody`] against a store reference, retrying transient
/// transport failures up to [`TransactionRunner::MAX_ATTEMPTS`] times.
///
/// A body that returns [`crate::txn::Outcome::Abort`] is not a failure: the
/// store reports a committed-false [`TransactionOutcome`] and the runner
/// returns it directly without retrying (spec §4.2).
pub struct TransactionRunner {
    clock: Arc<dyn Clock>,
}

impl TransactionRunner {
    /// Retry bound for transient store transport errors (spec §4.2).
    pub const MAX_ATTEMPTS: u32 = 10;

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn run(
        &self,
        store: &dyn Store,
        body: Arc<dyn TransactionBody>,
    ) -> Result<TransactionOutcome, QueueError> {
        let kind = body.kind();

        for attempt in 1..=Self::MAX_ATTEMPTS {
            match store.transaction(body.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if attempt == Self::MAX_ATTEMPTS {
                        tracing::warn!(op = %kind, attempts = attempt, error = %err, "transaction exhausted its retry budget");
                        return Err(QueueError::TransactionExhausted(kind));
                    }

                    tracing::debug!(op = %kind, attempt, error = %err, "transaction attempt failed, retrying");
                    let backoff = Duration::from_millis(10u64.saturating_mul(attempt as u64));
                    self.clock.sleep(backoff).await;
                }
            }
        }

        unreachable!("loop above always returns by the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::clock::SystemClock;
    use crate::error::{OperationKind, TransportError};
    use crate::store::{ChildWatch, FieldWatch};
    use crate::txn::Outcome;

    struct FlakyStore {
        failures_left: AtomicUsize,
    }

    struct NoopBody;
    impl TransactionBody for NoopBody {
        fn kind(&self) -> OperationKind {
            OperationKind::Claim
        }
        fn apply(&self, _current: Option<&Value>) -> Outcome {
            Outcome::Abort
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        fn key(&self) -> &str {
            "flaky"
        }

        fn child(&self, _key: &str) -> StdArc<dyn Store> {
            unimplemented!()
        }

        async fn push(&self, _value: Option<Value>) -> Result<StdArc<dyn Store>, TransportError> {
            unimplemented!()
        }

        async fn once(&self) -> Result<Option<Value>, TransportError> {
            unimplemented!()
        }

        async fn transaction(
            &self,
            _body: StdArc<dyn TransactionBody>,
        ) -> Result<TransactionOutcome, TransportError> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(TransportError::new(anyhow::anyhow!("transient failure")))
            } else {
                Ok(TransactionOutcome { committed: false, value: None })
            }
        }

        async fn watch_next_child(&self, _field: &str, _value: Option<&str>) -> Result<ChildWatch, TransportError> {
            unimplemented!()
        }

        async fn watch_field(&self, _field: &str) -> Result<FieldWatch, TransportError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn retries_until_it_succeeds() {
        let store = FlakyStore { failures_left: AtomicUsize::new(3) };
        let runner = TransactionRunner::new(StdArc::new(SystemClock));
        let outcome = runner.run(&store, StdArc::new(NoopBody)).await.unwrap();
        assert!(!outcome.committed);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = FlakyStore { failures_left: AtomicUsize::new(1000) };
        let runner = TransactionRunner::new(StdArc::new(SystemClock));
        let err = runner.run(&store, StdArc::new(NoopBody)).await.unwrap_err();
        assert!(matches!(err, QueueError::TransactionExhausted(OperationKind::Claim)));
    }
}
