//! Deadline-bounded execution.
//!
//! [`run`] gives callers bounded latency: when the context deadline passes (or the context
//! is cancelled) it returns `TimedOut` immediately and leaves the operation behind. The
//! operation is told through its token but is never forcibly stopped, so anything it does
//! after being abandoned must be harmless. A connection that finishes dialing late is
//! closed and dropped, never handed to a client.

use crate::context::Context;
use crate::error::{KitError, KitResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

/// Run `operation` within the deadline carried by `ctx`.
///
/// Without a deadline the operation runs inline to completion and its result is returned
/// unchanged. With one, it runs on a separate task; whichever comes first, completion or
/// expiry, decides the outcome. The token handed to the operation is cancelled on expiry.
/// Errors produced by the operation are returned as they are, even `TimedOut` ones, and a
/// panic inside it is resumed on the caller.
pub async fn run<T, F, Fut>(ctx: &Context, operation: F) -> KitResult<T>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = KitResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let exceeded = ctx.token().child_token();

    if ctx.deadline().is_none() {
        return operation(exceeded).await;
    }

    let mut task = tokio::spawn(operation(exceeded.clone()).in_current_span());

    tokio::select! {
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(KitError::generic().with_message("operation task aborted").caused_by(e)),
        },
        _ = ctx.done() => {
            exceeded.cancel();
            debug!("Deadline exceeded, abandoning operation");
            Err(ctx
                .check()
                .err()
                .unwrap_or_else(|| KitError::timed_out().with_field("reason", "deadline exceeded")))
        }
    }
}

/// Wait for `operation` within the deadline carried by `ctx`, without spawning it.
///
/// For operations that borrow from the caller and so cannot outlive it. On expiry the
/// operation is dropped, which is the only way to stop it; drivers built on cancel-safe
/// futures (like a pooled SQL connection) discard the interrupted session.
pub async fn bound<T, Fut>(ctx: &Context, operation: Fut) -> KitResult<T>
where
    Fut: Future<Output = KitResult<T>>,
{
    tokio::select! {
        biased;
        result = operation => result,
        _ = ctx.done() => {
            debug!("Deadline exceeded, dropping operation");
            Err(ctx
                .check()
                .err()
                .unwrap_or_else(|| KitError::timed_out().with_field("reason", "deadline exceeded")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_without_deadline_returns_result_unchanged() {
        let ctx = Context::background();
        let result = run(&ctx, |_| async { Ok::<_, KitError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let err = run(&ctx, |_| async {
            Err::<(), _>(KitError::not_found().with_message("no row"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), Some("no row"));
    }

    #[tokio::test]
    async fn test_operation_failure_is_not_reported_as_timeout() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let err = run(&ctx, |_| async {
            Err::<(), _>(KitError::integrity_violation())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    }

    #[tokio::test]
    async fn test_expiry_returns_without_waiting_for_operation() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let signalled = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&signalled);

        let started = Instant::now();
        let err = run(&ctx, move |exceeded| async move {
            exceeded.cancelled().await;
            seen.store(true, Ordering::SeqCst);
            // Keep running well past the deadline; the caller must not wait for this.
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, KitError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signalled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_waiting() {
        let ctx = Context::background().with_timeout(Duration::from_secs(30));
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = run(&ctx, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, KitError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(err.field("reason"), Some("context cancelled"));
    }

    #[tokio::test]
    async fn test_bound_drops_slow_borrowed_operation() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let mut rows = vec![1, 2, 3];
        let err = bound(&ctx, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            rows.push(4);
            Ok::<_, KitError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(rows.len(), 3);

        let value = bound(&Context::background(), async { Ok::<_, KitError>(rows.len()) }).await;
        assert_eq!(value.unwrap(), 3);
    }

    fn should_explode() -> bool {
        true
    }

    #[tokio::test]
    #[should_panic(expected = "dial exploded")]
    async fn test_panic_is_resumed_on_caller() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let _ = run(&ctx, |_| async {
            if should_explode() {
                panic!("dial exploded");
            }
            Ok::<_, KitError>(())
        })
        .await;
    }
}
