//! Session cancellation scope

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation signal shared by everything running under one session.
///
/// Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelScope {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelScope {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the scope is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender is held by self, so this is unreachable; never resolve
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}
