//! Cooperative shutdown signalling between the agent and its loops.
//!
//! A [`ShutdownTrigger`] is held by the agent; every loop gets a cloned
//! [`ShutdownListener`]. Triggering is sticky: listeners created or polled
//! after the trigger fired still observe it.

use std::sync::Arc;
use tokio::sync::watch;

/// Create a connected trigger/listener pair.
pub fn channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx },
        ShutdownListener {
            rx,
            _keepalive: None,
        },
    )
}

/// Sending half; fires shutdown for every listener.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Receiving half. Dropping the trigger counts as shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl ShutdownListener {
    /// A listener that never fires, for components driven outside an agent.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&mut self) {
        // A closed channel means the trigger is gone; treat it as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_all_listeners() {
        let (trigger, listener) = channel();
        let mut a = listener.clone();
        let mut b = trigger.listener();
        assert!(!a.is_triggered());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), a.triggered()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.triggered()).await.unwrap();
        assert!(listener.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut listener) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), listener.triggered()).await.unwrap();
    }

    #[tokio::test]
    async fn test_never_listener_stays_pending() {
        let mut listener = ShutdownListener::never();
        let result = tokio::time::timeout(Duration::from_millis(20), listener.triggered()).await;
        assert!(result.is_err());
    }
}
