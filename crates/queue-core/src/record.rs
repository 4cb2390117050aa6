//! The task record data model (spec §3.1).
//!
//! A task is a schema-flexible mapping co-located at a unique child key
//! within the task node. Reserved control fields are written only by this
//! crate; everything else is an opaque user field passed through untouched.

use serde_json::{Map, Value};

/// Sentinel marker substituted by the store adapter with its own wall-clock
/// value at commit time (spec §3.1, "server timestamp sentinel"). The core
/// never interprets this value itself; it only ever writes it verbatim.
pub const SERVER_TIMESTAMP: &str = "\0queue_core::server_timestamp\0";

pub fn server_timestamp() -> Value {
    Value::String(SERVER_TIMESTAMP.to_string())
}

pub const FIELD_STATE: &str = "_state";
pub const FIELD_STATE_CHANGED: &str = "_state_changed";
pub const FIELD_OWNER: &str = "_owner";
pub const FIELD_PROGRESS: &str = "_progress";
pub const FIELD_ERROR_DETAILS: &str = "_error_details";

const RESERVED_FIELDS: &[&str] = &[
    FIELD_STATE,
    FIELD_STATE_CHANGED,
    FIELD_OWNER,
    FIELD_PROGRESS,
    FIELD_ERROR_DETAILS,
];

/// A typed view over the reserved control fields of a task record.
///
/// Wraps a `serde_json::Map` so that user fields stay opaque while the
/// handful of reserved fields (§3.1) get a small, panic-free accessor API.
#[derive(Clone, Debug)]
pub struct TaskRecord(Map<String, Value>);

impl TaskRecord {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// `_state`, treated as absent when the field is JSON `null` or missing.
    pub fn state(&self) -> Option<&str> {
        match self.0.get(FIELD_STATE) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// `_owner`, treated as absent when the field is JSON `null` or missing.
    pub fn owner(&self) -> Option<&str> {
        match self.0.get(FIELD_OWNER) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<i64> {
        self.0.get(FIELD_PROGRESS).and_then(Value::as_i64)
    }

    /// The record with all reserved control fields stripped, as handed to
    /// the user-supplied processor (spec §4.3 "Sanitisation").
    pub fn sanitised(&self) -> Map<String, Value> {
        let mut map = self.0.clone();
        for field in RESERVED_FIELDS {
            map.remove(*field);
        }
        map
    }
}

/// Merge `patch` on top of `base`, inserting or overwriting keys. Used by the
/// claim/resolve/reject bodies to build their replacement record (§4.1).
pub fn merge(base: &Map<String, Value>, patch: impl IntoIterator<Item = (String, Value)>) -> Map<String, Value> {
    let mut out = base.clone();
    for (k, v) in patch {
        out.insert(k, v);
    }
    out
}

pub fn is_reserved_field(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}
