//! A cooperative cancellation signal handed to job handlers via
//! [`JobContext`](crate::chain::JobContext), separate from the worker's own
//! internal state machine — handlers only ever observe "should I wind down",
//! never the exact lifecycle phase that triggered it.

use tokio::sync::watch;

/// Cheaply `Clone`; every clone observes the same underlying flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires, for call sites that have no shutdown
    /// machinery to wire in (tests, one-off scripts).
    pub fn noop() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Safe to call repeatedly or
    /// not at all; handlers that poll [`is_cancelled`](Self::is_cancelled)
    /// instead are just as valid.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The paired sender, held by the worker orchestrator.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal::new(rx))
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.tx.subscribe())
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
