//! Request-scoped call context.
//!
//! A [`Context`] carries an optional deadline, a cancellation signal and a small set of
//! values attached under crate-private keys. Contexts are immutable: every `with_*`
//! method returns a child and leaves the parent untouched, so sibling branches forked
//! from one parent never observe each other's values.

use crate::error::{KitError, KitResult};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Key under which a value is attached to a context.
///
/// Only this crate can mint keys, and each key is unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScopeKey(u64);

impl ScopeKey {
    pub(crate) fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Scope {
    key: ScopeKey,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Scope>>,
}

#[derive(Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    scope: Option<Arc<Scope>>,
}

impl Context {
    /// Root context: no deadline, never cancelled unless [`Context::cancel`] is called.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            scope: None,
        }
    }

    /// Child context that expires after `timeout`, or at the parent's deadline if sooner.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context that expires at `deadline`, or at the parent's deadline if sooner.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
            scope: self.scope.clone(),
        }
    }

    /// Child context with its own cancellation signal.
    ///
    /// Cancelling the child leaves the parent running; cancelling the parent cancels the child.
    pub fn with_cancel(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            scope: self.scope.clone(),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the context is cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `TimedOut` when the context is done.
    pub fn check(&self) -> KitResult<()> {
        if self.is_cancelled() {
            return Err(KitError::timed_out().with_field("reason", "context cancelled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(KitError::timed_out().with_field("reason", "deadline exceeded"));
        }
        Ok(())
    }

    /// Resolve once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a background context nobody cancels.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Cancellation token of this context.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn with_value<T>(&self, key: ScopeKey, value: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            scope: Some(Arc::new(Scope {
                key,
                value,
                parent: self.scope.clone(),
            })),
        }
    }

    pub(crate) fn value<T>(&self, key: ScopeKey) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut current = self.scope.as_ref();
        while let Some(scope) = current {
            if scope.key == key {
                return Arc::clone(&scope.value).downcast::<T>().ok();
            }
            current = scope.parent.as_ref();
        }
        None
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("has_values", &self.scope.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_background_has_no_deadline() {
        let ctx = Context::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn test_child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_expired_deadline_checks_as_timed_out() {
        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        ctx.done().await;
        let err = ctx.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(err.field("reason"), Some("deadline exceeded"));
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.with_cancel();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());

        let other = parent.with_cancel();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_values_are_scoped_by_key() {
        let key = ScopeKey::unique();
        let other = ScopeKey::unique();
        let root = Context::background();
        let ctx = root.with_value(key, Arc::new(7_u32));

        assert_eq!(ctx.value::<u32>(key).as_deref(), Some(&7));
        assert!(ctx.value::<u32>(other).is_none());
        assert!(ctx.value::<String>(key).is_none());
        assert!(root.value::<u32>(key).is_none());
    }

    #[test]
    fn test_sibling_branches_do_not_share_values() {
        let key = ScopeKey::unique();
        let root = Context::background();
        let left = root.with_cancel().with_value(key, Arc::new("left"));
        let right = root.with_cancel();
        assert!(left.value::<&str>(key).is_some());
        assert!(right.value::<&str>(key).is_none());
    }
}
