use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::CancelReason;

/// A minimal, cloneable one-shot cancellation flag. The protocol needs
/// nothing heavier than this, so rather than pull in a dedicated token crate
/// this pairs an `AtomicBool` with a `Notify` the way a single-purpose
/// cancellation primitive would.
#[derive(Clone)]
pub struct CancellationSource {
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
    reason: Arc<std::sync::Mutex<Option<CancelReason>>>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            reason: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Fires the source. Returns `true` the first time it is called for this
    /// source, `false` on every subsequent call.
    pub fn trigger(&self, reason: CancelReason) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.reason.lock().unwrap() = Some(reason);
        self.notify.notify_waiters();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap()
    }

    /// Resolves once `trigger` has been called, even if that happened before
    /// this call started waiting. The `notified()` future is captured before
    /// the flag check so a `trigger` landing in between is never missed:
    /// `notify_waiters` only wakes futures that already exist, not ones
    /// created after it runs.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
