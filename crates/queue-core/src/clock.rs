//! Clock trait for deterministic simulation testing.
//!
//! The [`Clock`] trait controls the worker's view of time for internal
//! scheduling decisions (re-subscribe back-off). The core never uses it to
//! stamp task records themselves — the server timestamp sentinel (§3.1) is an
//! opaque marker resolved by the store, not by this crate.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Controls the worker's view of time.
///
/// In production, the default [`SystemClock`] delegates to `chrono::Utc::now()`
/// and `tokio::time::sleep`. In deterministic tests, a custom clock can return
/// controlled values so that timing-sensitive logic (back-off jitter) is
/// reproducible.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// The default clock, backed by real system time.
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
