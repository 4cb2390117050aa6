use std::time::Duration;

/// Runtime-tunable knobs for a [`crate::pool::TaskQueue`] that are not part
/// of the [`crate::spec::TaskSpec`] itself.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of Workers to spawn against the shared task node. Must be a
    /// positive integer (spec §4.4); defaults to 1.
    pub num_workers: usize,

    /// Upper bound on the jittered back-off applied before a Worker
    /// re-subscribes to the start-state query after a transport error
    /// (spec §7 "TransportError ... re-subscribes after a back-off").
    pub resubscribe_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: 1,
            resubscribe_backoff: Duration::from_millis(250),
        }
    }
}
