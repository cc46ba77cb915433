//! Lifecycle steps shared by every resource client.

use crate::context::Context;
use crate::error::{ErrorKind, KitError, KitResult, Resource};
use crate::util::RetryConfig;
use crate::util::{deadline, retry};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Establish a connection to `resource`: the dial is retried per `retry`, and the
/// whole sequence is bounded by the deadline carried by `ctx`.
///
/// `dial` receives the attempt number and the deadline token. A dial that completes
/// after the token fired must release what it built instead of returning it; the
/// result would be discarded anyway.
///
/// Returns `TimedOut` when the deadline fires first, otherwise the classified error of
/// the last attempt with the number of attempts made.
pub async fn establish<T, F, Fut>(
    ctx: &Context,
    resource: Resource,
    target: &str,
    retry: &RetryConfig,
    dial: F,
) -> KitResult<T>
where
    F: Fn(u32, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KitResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let retry = retry.clone();
    let target = target.to_string();

    let label = target.clone();
    let result = deadline::run(ctx, move |exceeded| async move {
        let attempts = retry.attempts.max(1);
        retry::execute(&retry, &exceeded, |attempt| {
            info!(
                resource = %resource,
                attempt,
                attempts,
                "Trying to connect to the {} {} {}/{}",
                label,
                resource,
                attempt,
                attempts
            );
            dial(attempt, exceeded.clone())
        })
        .await
    })
    .await;

    match result {
        Ok(value) => {
            info!(resource = %resource, "Connected to the {} {}", target, resource);
            Ok(value)
        }
        Err(err) if err.kind() == ErrorKind::TimedOut => Err(KitError::timed_out()
            .for_resource(resource)
            .with_field("target", &target)
            .caused_by(err)),
        Err(err) => Err(err.for_resource(resource).with_field("target", &target)),
    }
}

/// Decide whether a resource is healthy.
///
/// All three checks must pass: the pool holds at least `minimum` connections, the
/// liveness `probe` succeeds, and `ctx` is not cancelled. Any failure is `Unhealthy`.
pub async fn assess_health<Fut>(
    ctx: &Context,
    resource: Resource,
    current: u32,
    minimum: u32,
    probe: Fut,
) -> KitResult<()>
where
    Fut: Future<Output = KitResult<()>>,
{
    if current < minimum {
        return Err(KitError::unhealthy()
            .for_resource(resource)
            .with_message(format!(
                "current conns {} below minimum {}",
                current, minimum
            )));
    }

    probe.await.map_err(|e| {
        KitError::unhealthy()
            .for_resource(resource)
            .with_message("liveness probe failed")
            .caused_by(e)
    })?;

    ctx.check().map_err(|e| {
        KitError::unhealthy()
            .for_resource(resource)
            .caused_by(e)
    })
}

/// Run a health assessment under the deadline of `ctx`.
///
/// A context that is already cancelled is reported as `Unhealthy`; a deadline that
/// expires while the checks are running is reported as `TimedOut`.
pub async fn check_health<F, Fut>(ctx: &Context, resource: Resource, checks: F) -> KitResult<()>
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = KitResult<()>> + Send + 'static,
{
    if let Err(e) = ctx.check() {
        return Err(KitError::unhealthy().for_resource(resource).caused_by(e));
    }

    let inner = ctx.clone();
    match deadline::run(ctx, move |_| checks(inner)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::Unhealthy => Err(err.for_resource(resource)),
        Err(err) if err.kind() == ErrorKind::TimedOut => {
            Err(KitError::timed_out().for_resource(resource).caused_by(err))
        }
        Err(err) => Err(KitError::unhealthy().for_resource(resource).caused_by(err)),
    }
}
