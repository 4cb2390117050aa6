//! Error kinds surfaced by the coordination engine (see spec §7).

use std::fmt;
use std::sync::Arc;

/// The operation class a transaction belongs to, used to classify errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationKind {
    Claim,
    Resolve,
    Reject,
    Progress,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Claim => "claim",
            OperationKind::Resolve => "resolve",
            OperationKind::Reject => "reject",
            OperationKind::Progress => "setProgress",
        };
        f.write_str(s)
    }
}

/// An error returned by the store adapter while servicing a read, write, or
/// subscription. The core treats the inner cause opaquely and only decides
/// whether to retry (see [`crate::runner::TransactionRunner`]).
#[derive(Clone)]
pub struct TransportError(Arc<anyhow::Error>);

impl TransportError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Errors raised by the coordination engine.
///
/// Per spec §7: configuration errors abort construction synchronously;
/// operational errors are surfaced to the caller of the specific operation
/// that failed (`setProgress`/`resolve`/`reject`) and/or reported via the
/// pool's `report_error` callback. An error confined to one task never
/// affects other tasks or Workers.
#[derive(Clone, Debug)]
pub enum QueueError {
    /// Pool or Worker construction was given an invalid [`crate::spec::TaskSpec`]
    /// or [`crate::config::Config`].
    Configuration(String),

    /// `setProgress` was called with a value outside `0..=100`.
    InvalidProgress(String),

    /// A transaction's precondition (`_owner == ownerToken && _state ==
    /// inProgressState`) no longer held when the transaction ran.
    OwnershipLost,

    /// The [`crate::runner::TransactionRunner`] exceeded its retry budget.
    TransactionExhausted(OperationKind),

    /// The store adapter reported a transport-level failure.
    Transport(TransportError),

    /// `resolve`/`reject`/`setProgress` was called after the task had
    /// already settled once.
    AlreadySettled,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            QueueError::InvalidProgress(msg) => write!(f, "invalid progress value: {msg}"),
            QueueError::OwnershipLost => {
                write!(f, "task ownership was lost before the transaction committed")
            }
            QueueError::TransactionExhausted(op) => {
                write!(f, "{op} transaction exhausted its retry budget")
            }
            QueueError::Transport(err) => write!(f, "store transport error: {err}"),
            QueueError::AlreadySettled => write!(f, "the task was already resolved or rejected"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for QueueError {
    fn from(err: TransportError) -> Self {
        QueueError::Transport(err)
    }
}

/// Normalised shape written to `_error_details` on a reject transaction (see
/// spec §4.3 "Error normalisation for reject").
#[derive(Clone, Debug, Default)]
pub struct ProcessorError {
    pub error: Option<String>,
    pub error_stack: Option<String>,
}

impl ProcessorError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_stack: Some(stack.into()),
        }
    }

    /// The `null`/`undefined` case: no message, no stack.
    pub fn empty() -> Self {
        Self {
            error: None,
            error_stack: None,
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(msg) => f.write_str(msg),
            None => f.write_str("task failed with no error message"),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::with_stack(err.to_string(), format!("{err:?}"))
    }
}

/// Callback invoked whenever an operational error occurs that is confined to
/// one task or Worker (spec §7 "operational errors are surfaced via
/// reportError"). Must be safe to call from any context.
pub type ErrorReporter = Arc<dyn Fn(QueueError) + Send + Sync>;
