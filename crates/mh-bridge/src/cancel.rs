use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// CancelToken — cooperative cancellation
// ---------------------------------------------------------------------------

/// Broadcast-based cancellation handle threaded through every conductor
/// operation.
///
/// Components register interest by calling `subscribe()`, then `select!` on
/// the returned receiver alongside their main work. Firing the token:
/// 1. Sets the `cancelled` flag (atomically)
/// 2. Broadcasts a signal to all subscribers
///
/// ```ignore
/// let cancel = CancelToken::new();
/// let mut rx = cancel.subscribe();
///
/// tokio::select! {
///     _ = rx.recv() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    trigger: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the cancellation signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Check if cancellation has fired (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fire cancellation for all subscribers. Idempotent.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("cancellation triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Wait until cancellation fires. Returns immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.subscribe();
        // A racing cancel() between the check above and the subscribe is
        // caught by re-checking the flag.
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
