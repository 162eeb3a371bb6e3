//! Cooperative cancellation
//!
//! A [`CancelHandle`] flips a `watch` channel; every [`CancelToken`] cloned
//! from it observes the flip. Long-running work selects on
//! [`CancelToken::cancelled`] next to its real future.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observer side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal cancellation. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
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

    /// Resolve once cancellation is signalled
    ///
    /// If every handle is dropped without cancelling, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Derive a child pair that is cancelled when either this token or the
    /// child handle fires. The forwarding task ends once every child token
    /// is dropped.
    pub fn child(&self) -> (CancelHandle, CancelToken) {
        let (handle, token) = cancel_pair();
        let parent = self.clone();
        let forward = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    forward.cancel();
                }
                _ = forward.tx.closed() => {}
            }
        });
        (handle, token)
    }
}
