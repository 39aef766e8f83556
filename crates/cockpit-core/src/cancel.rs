//! Cooperative abort for the scheduler loop.
//!
//! The scheduler polls an [`AbortToken`] between steps. Hardware-level stop is
//! a separate path: each executor subscribes to the
//! [`USER_ABORT`](crate::events::USER_ABORT) event and stops its device
//! directly. The two are not synchronised; hardware stop never waits on the
//! scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    inner: Arc<Inner>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_state() {
        let token = AbortToken::new();
        let clone = token.clone();
        assert!(!clone.is_aborted());

        let waiter = tokio::spawn(async move { clone.aborted().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_aborted());
    }
}
