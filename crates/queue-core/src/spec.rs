//! The task spec, its defaults, and its validation rules (spec §3.2, §4.5).

use crate::error::QueueError;

/// A configuration record, frozen for the lifetime of a [`crate::pool::TaskQueue`].
///
/// `timeout` and `retries` are accepted and validated but otherwise inert in
/// this core: timeout reclamation of tasks whose owner died belongs to a
/// sibling subsystem (spec §1, §9 "Open question — timeout and retries
/// fields").
#[derive(Clone, Debug)]
pub struct TaskSpec {
    /// A task is eligible for claim iff its `_state` equals `start_state`
    /// (`None` matches an absent `_state`).
    pub start_state: Option<String>,

    /// The state a task is moved to once claimed.
    pub in_progress_state: String,

    /// The state a task is moved to on resolve, or `None` to remove the
    /// record instead.
    pub finished_state: Option<String>,

    /// The state a task is moved to on reject.
    pub error_state: String,

    /// Validated but inert in this core; see the type-level docs.
    pub timeout: Option<std::time::Duration>,

    /// Validated but inert in this core; see the type-level docs.
    pub retries: Option<u32>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            start_state: None,
            in_progress_state: "in_progress".to_string(),
            finished_state: None,
            error_state: "error".to_string(),
            timeout: None,
            retries: None,
        }
    }
}

impl TaskSpec {
    /// Validate the distinctness and non-emptiness constraints from spec §3.2.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.in_progress_state.is_empty() {
            return Err(QueueError::Configuration(
                "in_progress_state must be a non-empty string".to_string(),
            ));
        }

        if self.start_state.as_deref() == Some(self.in_progress_state.as_str()) {
            return Err(QueueError::Configuration(
                "start_state must differ from in_progress_state".to_string(),
            ));
        }

        if let Some(finished) = &self.finished_state {
            if finished == &self.in_progress_state {
                return Err(QueueError::Configuration(
                    "finished_state must differ from in_progress_state".to_string(),
                ));
            }
            if Some(finished.as_str()) == self.start_state.as_deref() {
                return Err(QueueError::Configuration(
                    "finished_state must differ from start_state".to_string(),
                ));
            }
        }

        if self.error_state.is_empty() {
            return Err(QueueError::Configuration(
                "error_state must be a non-empty string".to_string(),
            ));
        }
        if self.error_state == self.in_progress_state {
            return Err(QueueError::Configuration(
                "error_state must differ from in_progress_state".to_string(),
            ));
        }
        if Some(self.error_state.as_str()) == self.start_state.as_deref() {
            return Err(QueueError::Configuration(
                "error_state must differ from start_state".to_string(),
            ));
        }
        if Some(&self.error_state) == self.finished_state.as_ref() {
            return Err(QueueError::Configuration(
                "error_state must differ from finished_state".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a task's current `_state` makes it eligible for claim.
    pub fn is_start_state(&self, state: Option<&str>) -> bool {
        state == self.start_state.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_valid() {
        TaskSpec::default().validate().unwrap();
    }

    #[test]
    fn start_state_cannot_equal_in_progress_state() {
        let spec = TaskSpec {
            start_state: Some("in_progress".to_string()),
            ..TaskSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn finished_state_cannot_equal_start_state() {
        let spec = TaskSpec {
            start_state: Some("go".to_string()),
            finished_state: Some("go".to_string()),
            ..TaskSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn error_state_must_be_distinct_from_everything() {
        let spec = TaskSpec {
            error_state: "in_progress".to_string(),
            ..TaskSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn empty_in_progress_state_is_invalid() {
        let spec = TaskSpec {
            in_progress_state: String::new(),
            ..TaskSpec::default()
        };
        assert!(spec.validate().is_err());
    }
}
