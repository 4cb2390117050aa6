//! An in-process [`Store`] implementation for `queue-core`'s own integration
//! tests and the demo binary.
//!
//! This is a reference adapter, not a production backend: every node lives
//! in a single process behind a `parking_lot::Mutex`, and the compare-and-set
//! "transaction" primitive simply runs the body while holding that lock —
//! there is no network round trip to retry against. It implements the same
//! shape the core expects (§6.1 of the coordination spec this crate
//! implements) closely enough that `queue-core`'s `Worker`/`TaskQueue` cannot
//! tell the difference.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use queue_core::error::TransportError;
use queue_core::record::SERVER_TIMESTAMP;
use queue_core::{ChildEvent, ChildWatch, FieldWatch, Outcome, Store, TransactionBody, TransactionOutcome};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

struct ChildWaiter {
    field: String,
    expected: Option<String>,
    tx: mpsc::UnboundedSender<Result<ChildEvent, TransportError>>,
}

struct NodeInner {
    value: Option<Value>,
    parent: Option<(Weak<Mutex<NodeInner>>, String)>,
    children: HashMap<String, Arc<Mutex<NodeInner>>>,
    /// Keys in the order their value was first materialised, used to give
    /// [`MemoryStore::watch_next_child`] a stable "first match" ordering
    /// roughly approximating a real store's push-id ordering.
    order: Vec<String>,
    next_push_seq: u64,
    child_waiters: Vec<ChildWaiter>,
    field_watchers: HashMap<String, watch::Sender<Option<Value>>>,
}

impl NodeInner {
    fn new(parent: Option<(Weak<Mutex<NodeInner>>, String)>) -> Self {
        Self {
            value: None,
            parent,
            children: HashMap::new(),
            order: Vec::new(),
            next_push_seq: 0,
            child_waiters: Vec::new(),
            field_watchers: HashMap::new(),
        }
    }
}

/// A single node in the in-process tree. Implements [`Store`].
pub struct MemoryStore {
    node: Arc<Mutex<NodeInner>>,
    key: String,
}

impl MemoryStore {
    /// A fresh, empty tree rooted at `key`.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::new(Mutex::new(NodeInner::new(None))),
            key: key.into(),
        })
    }
}

fn field_of<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.as_object().and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn check_child_waiters(guard: &mut NodeInner, key: &str, value: Option<&Value>) {
    let expected_field_value = |waiter: &ChildWaiter| value.and_then(|v| field_of(v, &waiter.field)).map(str::to_string);

    guard.child_waiters.retain(|waiter| {
        if expected_field_value(waiter).as_deref() != waiter.expected.as_deref() {
            return true;
        }
        let event = ChildEvent {
            key: key.to_string(),
            value: value.cloned().unwrap_or(Value::Null),
        };
        let _ = waiter.tx.send(Ok(event));
        false
    });
}

fn notify_field_watchers(guard: &NodeInner, next: Option<&Map<String, Value>>) {
    for (field, sender) in &guard.field_watchers {
        let current = next.and_then(|m| m.get(field)).cloned();
        let _ = sender.send(current);
    }
}

/// Replace the server-timestamp sentinel (`queue_core::record::SERVER_TIMESTAMP`)
/// with this adapter's wall-clock, mirroring a real store's write-time
/// substitution (spec §3.1). Only scans top-level string values: the core
/// never nests the sentinel inside a sub-object.
fn resolve_sentinels(map: &mut Map<String, Value>) {
    let now = chrono::Utc::now().to_rfc3339();
    for value in map.values_mut() {
        if matches!(value, Value::String(s) if s == SERVER_TIMESTAMP) {
            *value = Value::String(now.clone());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn key(&self) -> &str {
        &self.key
    }

    fn child(&self, key: &str) -> Arc<dyn Store> {
        let mut guard = self.node.lock();
        let child = guard
            .children
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NodeInner::new(Some((Arc::downgrade(&self.node), key.to_string()))))))
            .clone();

        Arc::new(MemoryStore { node: child, key: key.to_string() })
    }

    async fn push(&self, value: Option<Value>) -> Result<Arc<dyn Store>, TransportError> {
        let child_node;
        let key;
        {
            let mut guard = self.node.lock();
            let seq = guard.next_push_seq;
            guard.next_push_seq += 1;
            key = format!("task-{seq:08}");

            let mut inner = NodeInner::new(Some((Arc::downgrade(&self.node), key.clone())));
            inner.value = value.clone();
            let child = Arc::new(Mutex::new(inner));

            guard.children.insert(key.clone(), child.clone());
            if value.is_some() {
                guard.order.push(key.clone());
                check_child_waiters(&mut guard, &key, value.as_ref());
            }
            child_node = child;
        }

        Ok(Arc::new(MemoryStore { node: child_node, key }))
    }

    async fn once(&self) -> Result<Option<Value>, TransportError> {
        Ok(self.node.lock().value.clone())
    }

    async fn transaction(&self, body: Arc<dyn TransactionBody>) -> Result<TransactionOutcome, TransportError> {
        let (outcome, parent_link, existed_before, next_for_parent) = {
            let mut guard = self.node.lock();
            let current = guard.value.clone();
            let existed_before = current.is_some();

            match body.apply(current.as_ref()) {
                Outcome::Abort => (TransactionOutcome { committed: false, value: current }, guard.parent.clone(), existed_before, None),
                Outcome::Remove => {
                    guard.value = None;
                    notify_field_watchers(&guard, None);
                    (TransactionOutcome { committed: true, value: None }, guard.parent.clone(), existed_before, Some(None))
                }
                Outcome::Replace(mut next_map) => {
                    resolve_sentinels(&mut next_map);
                    let next_value = Value::Object(next_map.clone());
                    guard.value = Some(next_value.clone());
                    notify_field_watchers(&guard, Some(&next_map));
                    (TransactionOutcome { committed: true, value: Some(next_value.clone()) }, guard.parent.clone(), existed_before, Some(Some(next_value)))
                }
            }
        };

        if let (Some((weak_parent, key)), Some(new_value)) = (parent_link, next_for_parent) {
            if let Some(parent) = weak_parent.upgrade() {
                let mut pguard = parent.lock();
                if !existed_before && new_value.is_some() && !pguard.order.contains(&key) {
                    pguard.order.push(key.clone());
                }
                check_child_waiters(&mut pguard, &key, new_value.as_ref());
            }
        }

        Ok(outcome)
    }

    async fn watch_next_child(&self, field: &str, value: Option<&str>) -> Result<ChildWatch, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let expected = value.map(str::to_string);
        let mut guard = self.node.lock();

        let found = guard.order.iter().find_map(|key| {
            let child = guard.children.get(key)?;
            let child_value = child.lock().value.clone()?;
            (field_of(&child_value, field).map(str::to_string) == expected).then_some((key.clone(), child_value))
        });

        match found {
            Some((key, value)) => {
                let _ = tx.send(Ok(ChildEvent { key, value }));
            }
            None => guard.child_waiters.push(ChildWaiter { field: field.to_string(), expected, tx }),
        }

        Ok(ChildWatch::new(rx))
    }

    async fn watch_field(&self, field: &str) -> Result<FieldWatch, TransportError> {
        let mut guard = self.node.lock();
        let current = guard.value.as_ref().and_then(|v| v.as_object()).and_then(|m| m.get(field)).cloned();

        let rx = guard
            .field_watchers
            .entry(field.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe();

        Ok(FieldWatch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_watch_delivers_immediately() {
        let root = MemoryStore::new("tasks");
        root.push(Some(Value::Object(Map::from_iter([("index".to_string(), Value::from(0))]))))
            .await
            .unwrap();

        let mut watch = root.watch_next_child("_state", None).await.unwrap();
        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.value.get("index").unwrap(), 0);
    }

    #[tokio::test]
    async fn watch_registered_before_push_still_fires() {
        let root = MemoryStore::new("tasks");
        let mut watch = root.watch_next_child("_state", None).await.unwrap();

        root.push(Some(Value::Object(Map::from_iter([("index".to_string(), Value::from(1))]))))
            .await
            .unwrap();

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.value.get("index").unwrap(), 1);
    }

    #[tokio::test]
    async fn transaction_resolves_server_timestamp_sentinel() {
        let root = MemoryStore::new("tasks");
        let child = root.push(Some(Value::Object(Map::new()))).await.unwrap();

        struct SetTimestamp;
        impl TransactionBody for SetTimestamp {
            fn kind(&self) -> queue_core::OperationKind {
                queue_core::OperationKind::Claim
            }
            fn apply(&self, _current: Option<&Value>) -> Outcome {
                let mut map = Map::new();
                map.insert("_state_changed".to_string(), queue_core::record::server_timestamp());
                Outcome::Replace(map)
            }
        }

        let outcome = child.transaction(Arc::new(SetTimestamp)).await.unwrap();
        let stamped = outcome.value.unwrap();
        let stamp = stamped.get("_state_changed").unwrap().as_str().unwrap();
        assert_ne!(stamp, SERVER_TIMESTAMP);
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[tokio::test]
    async fn field_watch_observes_owner_change() {
        let root = MemoryStore::new("tasks");
        let child = root
            .push(Some(Value::Object(Map::from_iter([(
                "_owner".to_string(),
                Value::String("w:0:0".to_string()),
            )]))))
            .await
            .unwrap();

        let mut watch = child.watch_field("_owner").await.unwrap();
        assert_eq!(watch.current().unwrap(), "w:0:0");

        struct StealOwner;
        impl TransactionBody for StealOwner {
            fn kind(&self) -> queue_core::OperationKind {
                queue_core::OperationKind::Claim
            }
            fn apply(&self, current: Option<&Value>) -> Outcome {
                let mut map = current.unwrap().as_object().unwrap().clone();
                map.insert("_owner".to_string(), Value::String("intruder".to_string()));
                Outcome::Replace(map)
            }
        }
        child.transaction(Arc::new(StealOwner)).await.unwrap();

        let new_value = watch.changed().await.unwrap();
        assert_eq!(new_value.unwrap(), "intruder");
    }
}
