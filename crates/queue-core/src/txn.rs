//! The five pure `TransactionBody` functions (spec §4.1).
//!
//! None of these suspend or perform I/O: each is a pure `current -> next`
//! function, run against a store snapshot by [`crate::runner::TransactionRunner`].

use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::error::{OperationKind, ProcessorError};
use crate::record::{self, server_timestamp, FIELD_ERROR_DETAILS, FIELD_OWNER, FIELD_PROGRESS, FIELD_STATE, FIELD_STATE_CHANGED};
use crate::spec::TaskSpec;

/// The result of applying a [`TransactionBody`] to an observed record.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Preconditions failed; leave the record unchanged.
    Abort,
    /// Delete the record.
    Remove,
    /// Write this value in full.
    Replace(Map<String, Value>),
}

/// A pure function from an observed task record to its next value.
pub trait TransactionBody: Send + Sync {
    /// The operation class, used to classify a retry-exhaustion error.
    fn kind(&self) -> OperationKind;

    /// `current` is `None` when the record does not exist.
    fn apply(&self, current: Option<&Value>) -> Outcome;
}

fn owner_and_state_match(map: &Map<String, Value>, owner_token: &str, in_progress_state: &str) -> bool {
    map.get(FIELD_OWNER).and_then(Value::as_str) == Some(owner_token)
        && map.get(FIELD_STATE).and_then(Value::as_str) == Some(in_progress_state)
}

/// `claim(ownerToken)`: move a task from `startState` to `inProgressState`.
pub struct Claim {
    pub spec: Arc<TaskSpec>,
    pub owner_token: String,
}

impl TransactionBody for Claim {
    fn kind(&self) -> OperationKind {
        OperationKind::Claim
    }

    fn apply(&self, current: Option<&Value>) -> Outcome {
        let current = match current {
            Some(v) => v,
            None => return Outcome::Abort,
        };

        let map = match current.as_object() {
            Some(m) => m,
            None => {
                let mut details = Map::new();
                details.insert("error".to_string(), Value::String("Task was malformed".to_string()));
                details.insert("original_task".to_string(), current.clone());

                let mut next = Map::new();
                next.insert(FIELD_STATE.to_string(), Value::String(self.spec.error_state.clone()));
                next.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp());
                next.insert(FIELD_ERROR_DETAILS.to_string(), Value::Object(details));

                return Outcome::Replace(next);
            }
        };

        let current_state = map.get(FIELD_STATE).and_then(Value::as_str);
        if !self.spec.is_start_state(current_state) {
            return Outcome::Abort;
        }

        let next = record::merge(
            map,
            [
                (FIELD_STATE.to_string(), Value::String(self.spec.in_progress_state.clone())),
                (FIELD_STATE_CHANGED.to_string(), server_timestamp()),
                (FIELD_OWNER.to_string(), Value::String(self.owner_token.clone())),
                (FIELD_PROGRESS.to_string(), Value::Number(0.into())),
            ],
        );

        Outcome::Replace(next)
    }
}

/// `resolve(newTask, ownerToken)`: the success finalize transaction.
pub struct Resolve {
    pub spec: Arc<TaskSpec>,
    pub owner_token: String,
    pub new_task: Option<Value>,
}

impl TransactionBody for Resolve {
    fn kind(&self) -> OperationKind {
        OperationKind::Resolve
    }

    fn apply(&self, current: Option<&Value>) -> Outcome {
        let current = match current {
            Some(v) => v,
            None => return Outcome::Abort,
        };
        let map = match current.as_object() {
            Some(m) => m,
            None => return Outcome::Abort,
        };

        if !owner_and_state_match(map, &self.owner_token, &self.spec.in_progress_state) {
            return Outcome::Abort;
        }

        let mut nt = match &self.new_task {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        let new_state_field = nt.remove("_new_state");

        let target: Option<String> = match new_state_field {
            None => self.spec.finished_state.clone(),
            Some(Value::Bool(false)) => None,
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_other) => self.spec.finished_state.clone(),
        };

        let target = match target {
            None => return Outcome::Remove,
            Some(s) => s,
        };

        let next = record::merge(
            &nt,
            [
                (FIELD_STATE.to_string(), Value::String(target)),
                (FIELD_STATE_CHANGED.to_string(), server_timestamp()),
                (FIELD_OWNER.to_string(), Value::Null),
                (FIELD_PROGRESS.to_string(), Value::Number(100.into())),
                (FIELD_ERROR_DETAILS.to_string(), Value::Null),
            ],
        );

        Outcome::Replace(next)
    }
}

/// `reject(errorString, errorStack, ownerToken)`: the failure finalize transaction.
pub struct Reject {
    pub spec: Arc<TaskSpec>,
    pub owner_token: String,
    pub error: ProcessorError,
}

impl TransactionBody for Reject {
    fn kind(&self) -> OperationKind {
        OperationKind::Reject
    }

    fn apply(&self, current: Option<&Value>) -> Outcome {
        let current = match current {
            Some(v) => v,
            None => return Outcome::Abort,
        };
        let map = match current.as_object() {
            Some(m) => m,
            None => return Outcome::Abort,
        };

        if !owner_and_state_match(map, &self.owner_token, &self.spec.in_progress_state) {
            return Outcome::Abort;
        }

        let mut details = Map::new();
        details.insert(
            "error".to_string(),
            self.error.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        details.insert(
            "error_stack".to_string(),
            self.error.error_stack.clone().map(Value::String).unwrap_or(Value::Null),
        );

        let next = record::merge(
            map,
            [
                (FIELD_STATE.to_string(), Value::String(self.spec.error_state.clone())),
                (FIELD_STATE_CHANGED.to_string(), server_timestamp()),
                (FIELD_OWNER.to_string(), Value::Null),
                (FIELD_ERROR_DETAILS.to_string(), Value::Object(details)),
            ],
        );

        Outcome::Replace(next)
    }
}

/// `setProgress(progress, ownerToken)`: a progress update transaction.
///
/// `progress` must already be validated to `0..=100` by the caller (spec
/// §4.1 "progress is a validated integer 0..100 (validated by caller)").
pub struct SetProgress {
    pub spec: Arc<TaskSpec>,
    pub owner_token: String,
    pub progress: u8,
}

impl TransactionBody for SetProgress {
    fn kind(&self) -> OperationKind {
        OperationKind::Progress
    }

    fn apply(&self, current: Option<&Value>) -> Outcome {
        let current = match current {
            Some(v) => v,
            None => return Outcome::Abort,
        };
        let map = match current.as_object() {
            Some(m) => m,
            None => return Outcome::Abort,
        };

        if !owner_and_state_match(map, &self.owner_token, &self.spec.in_progress_state) {
            return Outcome::Abort;
        }

        let next = record::merge(
            map,
            [(FIELD_PROGRESS.to_string(), Value::Number(Number::from(self.progress)))],
        );

        Outcome::Replace(next)
    }
}
