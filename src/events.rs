//! Exactly-once closed notifications
//!
//! A connection or link can be torn down from several directions at once:
//! locally through `safe_close`, by the engine noticing the socket die, or
//! by the peer detaching. Whoever wins, the owner gets exactly one closed
//! notification. [`ClosedEvent`] is the synchronization point those racing
//! paths all go through.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// One-shot, many-subscriber closed signal.
#[derive(Debug)]
pub struct ClosedEvent {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ClosedEvent {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Fire the event. Returns whether this call was the one that
    /// published; every later or racing call is a no-op.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(true);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ClosedSubscription {
        ClosedSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ClosedEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a [`ClosedEvent`].
#[derive(Debug, Clone)]
pub struct ClosedSubscription {
    rx: watch::Receiver<bool>,
}

impl ClosedSubscription {
    /// Resolve once the owner has closed. Resolves immediately if it
    /// already has, and also if the owner is dropped without closing.
    pub async fn closed(mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    /// Non-blocking check.
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}
