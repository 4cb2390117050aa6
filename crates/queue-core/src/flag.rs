//! The one-shot flag a [`crate::worker::Worker`] waits on to know when to
//! stop, plus the guard that raises it on the way out of the loop — whether
//! that exit was a clean shutdown or a panic (spec §4.4 "shutdown is
//! monotonic and idempotent").

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

/// A one-shot async flag a Worker polls to know when to stop listening for
/// new candidates.
#[derive(Clone)]
pub struct WorkerShutdownFlag(Arc<Shared>);

impl WorkerShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// Request shutdown. Idempotent: raising an already-raised flag wakes no
    /// new waiters and leaves the flag in the same state.
    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Wait until [`WorkerShutdownFlag::raise`] is called, or resolve
    /// immediately if it already has been.
    pub fn wait(&self) -> WorkerShutdownFuture {
        // Early check since there is no reason to create a Notified if it is
        // not necessary.
        if self.is_raised() {
            return WorkerShutdownFuture(None);
        }

        let notified = self.0.notify.notified();

        // We still need to check after creating the notified to avoid the
        // case where raise() is called between the check above and here.
        if self.is_raised() {
            WorkerShutdownFuture(None)
        } else {
            WorkerShutdownFuture(Some(notified))
        }
    }
}

pub struct WorkerShutdownFuture<'a>(Option<Notified<'a>>);

impl Future for WorkerShutdownFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: project Pin<&mut Self> -> Option<Pin<&mut Notified>>
        let notified = unsafe {
            let this = Pin::get_unchecked_mut(self);
            this.0.as_mut().map(|v| Pin::new_unchecked(v))
        };

        match notified {
            Some(notified) => notified.poll(cx),
            None => Poll::Ready(()),
        }
    }
}

/// Raises a [`WorkerShutdownFlag`] when dropped, so a Worker's loop exiting
/// through any path — a clean break, an early return, or a panic unwinding
/// past it — still leaves the flag raised for anyone waiting on it.
pub struct WorkerShutdownGuard<'a> {
    flag: &'a WorkerShutdownFlag,
    worker_id: &'a str,
}

impl<'a> WorkerShutdownGuard<'a> {
    pub fn new(flag: &'a WorkerShutdownFlag, worker_id: &'a str) -> Self {
        Self { flag, worker_id }
    }
}

impl<'a> Drop for WorkerShutdownGuard<'a> {
    fn drop(&mut self) {
        if !self.flag.is_raised() {
            tracing::warn!(worker_id = %self.worker_id, "worker loop exited without its shutdown flag being raised");
        }

        self.flag.raise();
    }
}
