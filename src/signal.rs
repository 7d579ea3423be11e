use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One-shot notification: fires at most once, any number of observers may wait on it.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the call that actually fired the signal.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent `fire` cannot be missed.
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}
