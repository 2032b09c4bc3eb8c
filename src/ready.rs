//! Readiness gate for shared resources
//!
//! Replaces interval polling on a resource handle with an explicit signal:
//! producers call [`Readiness::signal`] once the resource exists, consumers
//! `await` [`Readiness::wait`]. Waiting after the signal returns immediately.

use tokio::sync::watch;

/// One-shot readiness signal for a named resource
#[derive(Debug, Clone)]
pub struct Readiness {
    name: String,
    tx: watch::Sender<bool>,
}

impl Readiness {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Mark the resource as ready. Idempotent, and retained even when no
    /// waiter has subscribed yet.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the resource has been signalled ready
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the resource is ready
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
