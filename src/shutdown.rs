//! Process-wide shutdown signal.
//!
//! [`ShutdownController`] is owned by the orchestrator and moves from active
//! to signaled exactly once. Everything else gets a [`ShutdownSignal`], which
//! can observe the transition and ask for it, but never keeps the controller
//! alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::info;

struct Inner {
    token: CancellationToken,
    fired: AtomicBool,
}

impl Inner {
    fn signal(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(reason, "shutdown signaled");
        self.token.cancel();
        true
    }
}

/// Owner side of the shutdown signal.
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Signal shutdown. Returns `true` only for the call that performed the
    /// transition.
    pub fn signal(&self, reason: &str) -> bool {
        self.inner.signal(reason)
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the controller is signaled.
    pub async fn signaled(&self) {
        self.inner.token.cancelled().await
    }

    /// A non-owning view for components that cooperate with shutdown.
    pub fn observer(&self) -> ShutdownSignal {
        ShutdownSignal {
            owner: Arc::downgrade(&self.inner),
            token: self.inner.token.child_token(),
        }
    }
}

/// Non-owning view of the [`ShutdownController`].
///
/// Once the controller is dropped the signal reads as signaled.
#[derive(Clone)]
pub struct ShutdownSignal {
    owner: Weak<Inner>,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Ask the owner to shut down. Returns `false` when shutdown was already
    /// requested or the owner is gone.
    pub fn request(&self, reason: &str) -> bool {
        match self.owner.upgrade() {
            Some(inner) => inner.signal(reason),
            None => false,
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled() || self.owner.strong_count() == 0
    }

    /// Resolves once shutdown is signaled.
    pub async fn signaled(&self) {
        self.token.cancelled().await
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    static_assertions::assert_impl_all!(ShutdownController: Send, Sync);
    static_assertions::assert_impl_all!(ShutdownSignal: Send, Sync, Clone);

    #[test]
    fn signal_transitions_once() {
        let ctl = ShutdownController::new();
        assert!(!ctl.is_signaled());
        assert!(ctl.signal("test"));
        assert!(ctl.is_signaled());
        assert!(!ctl.signal("again"));
        assert!(ctl.is_signaled());
    }

    #[test]
    fn observer_sees_transition() {
        let ctl = ShutdownController::new();
        let obs = ctl.observer();
        assert!(!obs.is_signaled());
        ctl.signal("test");
        assert!(obs.is_signaled());
    }

    #[test]
    fn observer_can_request_shutdown() {
        let ctl = ShutdownController::new();
        let obs = ctl.observer();
        assert!(obs.request("from command"));
        assert!(ctl.is_signaled());
        assert!(!obs.request("twice"));
    }

    #[test]
    fn observer_does_not_keep_owner_alive() {
        let ctl = ShutdownController::new();
        let obs = ctl.observer();
        drop(ctl);
        assert!(obs.is_signaled());
        assert!(!obs.request("owner gone"));
    }

    #[tokio::test]
    async fn signaled_future_resolves_after_signal() {
        let ctl = ShutdownController::new();
        let obs = ctl.observer();
        let waiter = tokio::spawn(async move { obs.signaled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        ctl.signal("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("observer never woke")
            .unwrap();
    }
}
