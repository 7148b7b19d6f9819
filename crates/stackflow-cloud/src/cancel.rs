//! Cooperative cancellation
//!
//! `Provisioner::cancel` flips the signal of a running operation. The run
//! observes it between units and while waiting on interruptible calls.

use crate::state::StateKey;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Receiving half held by a running operation
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the sender is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// In-process signals of running operations
#[derive(Debug, Default)]
pub(crate) struct CancelSignals {
    senders: Mutex<HashMap<StateKey, watch::Sender<bool>>>,
}

impl CancelSignals {
    /// Token for an operation on `key`
    ///
    /// A second operation on a key that already has a signal shares it and
    /// leaves it in place when dropped.
    pub(crate) fn register(&self, key: &StateKey) -> SignalGuard<'_> {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = senders.get(key) {
            return SignalGuard {
                signals: self,
                key: key.clone(),
                token: CancelToken { rx: tx.subscribe() },
                owned: false,
            };
        }
        let (tx, rx) = watch::channel(false);
        senders.insert(key.clone(), tx);
        SignalGuard {
            signals: self,
            key: key.clone(),
            token: CancelToken { rx },
            owned: true,
        }
    }

    /// Returns false when no operation on `key` runs in this process
    pub(crate) fn signal(&self, key: &StateKey) -> bool {
        let senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        match senders.get(key) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    fn remove(&self, key: &StateKey) {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Registration of one operation; removes the signal when dropped
pub(crate) struct SignalGuard<'a> {
    signals: &'a CancelSignals,
    key: StateKey,
    token: CancelToken,
    owned: bool,
}

impl SignalGuard<'_> {
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.signals.remove(&self.key);
        }
    }
}
