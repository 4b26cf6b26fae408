//! Cancellation passed explicitly into gate execution.
//!
//! The CLI owns a [`CancelHandle`] and fires it from its signal listener;
//! the runner holds [`CancelToken`]s and awaits them alongside the child
//! process. The payload is the signal number that caused the cancel.

use tokio::sync::watch;

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<i32>>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<i32>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, CancelToken { rx })
    }

    /// Request cancellation. Only the first signal is kept.
    pub fn cancel(&self, signal: i32) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn signal(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    /// Resolve once cancelled, yielding the signal number. Pends forever if
    /// the handle is dropped without cancelling.
    pub async fn cancelled(&self) -> i32 {
        let mut rx = self.rx.clone();
        let signal = rx
            .wait_for(|v| v.is_some())
            .await
            .ok()
            .map(|v| (*v).unwrap_or_default());
        match signal {
            Some(signal) => signal,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (handle, token) = CancelHandle::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(15);
        assert_eq!(task.await.unwrap(), 15);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn first_signal_wins() {
        let (handle, token) = CancelHandle::new();
        handle.cancel(2);
        handle.cancel(15);
        assert_eq!(token.signal(), Some(2));
        assert_eq!(token.clone().cancelled().await, 2);
    }

    #[tokio::test]
    async fn never_token_stays_pending() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(res.is_err());
    }
}
