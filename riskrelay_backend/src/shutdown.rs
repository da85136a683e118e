//! Teardown signal shared by retry loops and open streams.
//!
//! Triggering the handle, or dropping it, cancels every signal cloned from it.

use std::sync::Arc;
use tokio::sync::watch;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    // Only set for `never()`, so the channel cannot close.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

pub fn shutdown_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownHandle { tx },
        ShutdownSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // send_replace works even when no receiver is alive
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for callers without a session.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the handle is triggered or dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
