//! Shutdown signal shared by the poller, workers and retry loops

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal
///
/// All clones observe the same state. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request shutdown
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Has shutdown been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Sender lives as long as any clone of self, so wait_for cannot fail here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        assert!(!signal.is_cancelled());
        signal.cancel();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let signal = ShutdownSignal::new();
        signal.cancel();
        tokio_test::assert_ready!(tokio_test::task::spawn(signal.cancelled()).poll());
    }
}
