//! Cooperative cancellation signal shared by the loop and every handler

use std::sync::Arc;

use tokio::sync::watch;

/// Create a linked trigger and signal
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx, _keep: None })
}

/// Sending half: fires the shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
            _keep: None,
        }
    }
}

/// Receiving half, cheap to clone.
///
/// Dropping the trigger counts as a shutdown request.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    _keep: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    /// A signal that never fires, for handlers driven outside a worker
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            rx,
            _keep: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the trigger was dropped
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, shutdown) = channel();
        assert!(!shutdown.is_cancelled());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_trigger_cancels() {
        let (trigger, shutdown) = channel();
        drop(trigger);

        assert!(shutdown.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("dropped trigger should resolve cancelled()");
    }

    #[tokio::test]
    async fn test_subscribe_sees_trigger() {
        let (trigger, _shutdown) = channel();
        let late = trigger.subscribe();

        trigger.trigger();
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_stays_open() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_cancelled());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), shutdown.cancelled())
                .await
                .is_err()
        );
    }
}
