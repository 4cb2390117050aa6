//! The narrow store capability the core consumes (spec §6.1).
//!
//! The realtime tree-database client itself — its wire protocol,
//! reconnection, authentication — is explicitly out of scope (spec §1). This
//! module only defines the trait boundary; a concrete adapter (such as
//! `queue-memory`, used in this crate's own tests) lives outside the core.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;
use crate::txn::TransactionBody;

/// The result of running a [`TransactionBody`] through [`Store::transaction`].
///
/// Mirrors spec §4.2: `committed: false` means the body chose
/// [`crate::txn::Outcome::Abort`] and `value` is the record observed at read
/// time; `committed: true` means the write landed and `value` is the new
/// record (`None` if it was removed).
#[derive(Clone, Debug)]
pub struct TransactionOutcome {
    pub committed: bool,
    pub value: Option<Value>,
}

/// One `child_added` notification from a [`Store::watch_next_child`] query.
#[derive(Clone, Debug)]
pub struct ChildEvent {
    pub key: String,
    pub value: Value,
}

/// A live subscription to a `orderByChild(..).equalTo(..)` query's
/// `child_added` event (spec §6.1 `on("child_added", ...)`).
///
/// Dropping this value is the `off()` call: the Worker unsubscribes by
/// dropping the watch as soon as it has a candidate to claim (spec §9
/// "Single-shot subscription per claim").
pub struct ChildWatch {
    rx: mpsc::UnboundedReceiver<Result<ChildEvent, TransportError>>,
}

impl ChildWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<ChildEvent, TransportError>>) -> Self {
        Self { rx }
    }

    /// Wait for the next matching child. Returns `None` once the adapter has
    /// no more events to deliver (e.g. the underlying connection closed).
    pub async fn next(&mut self) -> Option<Result<ChildEvent, TransportError>> {
        self.rx.recv().await
    }
}

/// A live subscription to a single field's value (spec §6.1 `on("value",
/// ...)`, narrowed to one field). Used for the Worker's `ownerWatch`.
pub struct FieldWatch {
    rx: watch::Receiver<Option<Value>>,
}

impl FieldWatch {
    pub fn new(rx: watch::Receiver<Option<Value>>) -> Self {
        Self { rx }
    }

    /// The field's value as of the most recent notification.
    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Wait until the field's value changes, then return the new value.
    ///
    /// Returns `Err` once the adapter drops the publishing side, which this
    /// crate treats the same as "stop watching" rather than a hard failure.
    pub async fn changed(&mut self) -> Result<Option<Value>, TransportError> {
        self.rx
            .changed()
            .await
            .map_err(|_| TransportError::new(anyhow::anyhow!("field watch was closed by the store")))?;
        Ok(self.rx.borrow().clone())
    }
}

/// The capability the core requires of its backing store (spec §6.1).
///
/// A `Store` value always refers to one node in the tree; `child` navigates
/// to a named sub-node, returning another `Store` of the same shape — this
/// mirrors how a real tree-database ref re-exposes itself at any depth.
#[async_trait]
pub trait Store: Send + Sync {
    /// The key of this node (e.g. a task's push-generated id).
    fn key(&self) -> &str;

    /// Navigate to a named sub-node (§6.1 `child(key)`).
    fn child(&self, key: &str) -> Arc<dyn Store>;

    /// Create a new unique child and return its ref (§6.1 `push(value?)`).
    async fn push(&self, value: Option<Value>) -> Result<Arc<dyn Store>, TransportError>;

    /// One-shot read (§6.1 `once("value")`).
    async fn once(&self) -> Result<Option<Value>, TransportError>;

    /// Compare-and-set transaction: read the current value, pass it to
    /// `body`, and atomically write the result (§6.1 `transaction`).
    async fn transaction(&self, body: Arc<dyn TransactionBody>) -> Result<TransactionOutcome, TransportError>;

    /// Subscribe to `child_added` on `orderByChild(field).equalTo(value).limitToFirst(1)`
    /// (§6.1, composed). `value = None` matches an absent/null field.
    async fn watch_next_child(&self, field: &str, value: Option<&str>) -> Result<ChildWatch, TransportError>;

    /// Subscribe to live changes of a single field on this node (§6.1 `on("value", ...)`).
    async fn watch_field(&self, field: &str) -> Result<FieldWatch, TransportError>;
}
