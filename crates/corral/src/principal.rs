//! Caller identity with observable liveness
//!
//! A [`Principal`] identifies one logical caller: a test, a request handler,
//! a background task. Connection holders and the ownership layer monitor
//! principals so that a caller that goes away can never strand a connection.
//!
//! Liveness is tied to the value itself: when the last clone of a
//! `Principal` is dropped (or [`Principal::terminate`] is called), every
//! [`PrincipalMonitor`] taken from it resolves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque principal identity, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrincipalId(u64);

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "principal-{}", self.0)
    }
}

struct Inner {
    id: PrincipalId,
    tx: watch::Sender<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// A cloneable caller identity whose termination can be observed
pub struct Principal {
    inner: Arc<Inner>,
}

impl Principal {
    /// Create a fresh principal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: PrincipalId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                tx,
            }),
        }
    }

    /// This principal's identity
    pub fn id(&self) -> PrincipalId {
        self.inner.id
    }

    /// Obtain a monitor that resolves when this principal terminates
    pub fn monitor(&self) -> PrincipalMonitor {
        PrincipalMonitor {
            id: self.inner.id,
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Mark this principal as terminated while clones may still exist
    pub fn terminate(&self) {
        let _ = self.inner.tx.send(true);
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Principal {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal").field("id", &self.inner.id).finish()
    }
}

/// Liveness token on a [`Principal`]
///
/// Monitors do not keep the principal alive; they only observe it.
#[derive(Debug, Clone)]
pub struct PrincipalMonitor {
    id: PrincipalId,
    rx: watch::Receiver<bool>,
}

impl PrincipalMonitor {
    /// Identity of the monitored principal
    pub fn id(&self) -> PrincipalId {
        self.id
    }

    /// Whether the principal has already terminated
    pub fn is_terminated(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the principal terminates
    pub async fn terminated(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // Sender gone without an explicit signal also means termination
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
