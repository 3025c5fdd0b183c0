//! One-shot readiness notification used to park callers until first sync.
//!
//! The reactor fires `notify_ready` after publishing an update; callers wait
//! with a deadline and observe either readiness or timeout. Waiting after
//! the fact returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SyncNotify {
    ready: AtomicBool,
    notify: Notify,
}

impl SyncNotify {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks ready and wakes every current and future waiter.
    pub fn notify_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Waits until ready or until the timeout elapses. Returns whether the
    /// notification fired.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            // Re-check after registering interest so a concurrent
            // notify_ready cannot be missed.
            if self.is_ready() {
                return true;
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => {
                    if self.is_ready() {
                        return true;
                    }
                }
                Err(_) => return self.is_ready(),
            }
        }
    }
}
