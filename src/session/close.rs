//! Close requests that can cross tasks

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable request to close a session from another task.
///
/// Setting the flag interrupts a pending poll or backoff sleep; the owning
/// session performs the actual close on its own task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }
}

/// Resolves once a close has been requested
pub(crate) async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    // The sender lives in the session's own handle, so this only errors
    // after the session is gone
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Sleep that wakes early on a close request. Returns false when interrupted.
pub(crate) async fn interruptible_sleep(close_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = close_requested(close_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_interrupts_sleep() {
        let (handle, mut rx) = CloseHandle::new();
        let remote = handle.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.close();
        });

        let completed = interruptible_sleep(&mut rx, Duration::from_secs(30)).await;
        assert!(!completed);
        assert!(handle.is_requested());
    }

    #[tokio::test]
    async fn test_sleep_completes_without_close() {
        let (handle, mut rx) = CloseHandle::new();
        assert!(interruptible_sleep(&mut rx, Duration::from_millis(5)).await);
        assert!(!handle.is_requested());
    }

    #[tokio::test]
    async fn test_reset_clears_request() {
        let (handle, mut rx) = CloseHandle::new();
        handle.close();
        assert!(!interruptible_sleep(&mut rx, Duration::from_secs(30)).await);

        handle.reset();
        assert!(!handle.is_requested());
        assert!(interruptible_sleep(&mut rx, Duration::from_millis(5)).await);
    }
}
