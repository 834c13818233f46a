//! Cooperative cancellation for in-flight calls.
//!
//! Every data RPC is bound to a [`CancelToken`] supplied by the caller. The
//! matching [`CancelHandle`] fires it; waiters observe the cancellation either
//! by polling [`CancelToken::is_cancelled`] or by awaiting
//! [`CancelToken::cancelled`] inside a `select!`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Reasons for cancelling a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Deadline expired.
    DeadlineExceeded,
    /// The owning component is shutting down.
    Shutdown,
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
    /// A newer request supersedes this one.
    Superseded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Arc<CancelState>>>,
}

impl CancelState {
    fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.cancel(reason);
        }
    }
}

/// A cloneable view of a cancellation signal.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            state: Arc::new(CancelState::default()),
        }
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.state.reason.lock()
    }

    /// Resolves once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return self.cancelled_reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when this one is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = Arc::new(CancelState::default());
        self.state.children.lock().push(state.clone());
        // Parent may already have drained its children.
        if self.is_cancelled() {
            state.cancel(self.cancelled_reason().unwrap_or_default());
        }
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.cancelled_reason())
            .finish()
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// A token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: self.state.clone(),
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::default());
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_token_new() {
        let (token, _handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert_eq!(token.cancelled_reason(), None);
    }

    #[test]
    fn test_cancel_handle_cancels_token() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_token_clone() {
        let (token, handle) = new_cancel_pair();
        let token_clone = token.clone();
        handle.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert!(token_clone.is_cancelled());
    }

    #[test]
    fn test_double_cancel_keeps_first_reason() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(token.cancelled_reason(), Some(CancelReason::UserRequested));
    }

    #[test]
    fn test_child_token_cancelled_by_parent() {
        let (token, handle) = new_cancel_pair();
        let (child, _child_handle) = token.child();
        handle.cancel(CancelReason::DeadlineExceeded);
        assert!(child.is_cancelled());
        assert_eq!(child.cancelled_reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_parent_not_cancelled_by_child() {
        let (token, _handle) = new_cancel_pair();
        let (child, child_handle) = token.child();
        child_handle.cancel(CancelReason::Superseded);
        assert!(child.is_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        let (child, _) = token.child();
        assert!(child.is_cancelled());
        assert_eq!(child.cancelled_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_never_token() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let (token, handle) = new_cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(CancelReason::UserRequested);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(reason, CancelReason::UserRequested);
    }

    #[tokio::test]
    async fn test_cancelled_future_ready_when_already_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::DeadlineExceeded);
        assert_eq!(token.cancelled().await, CancelReason::DeadlineExceeded);
    }
}
