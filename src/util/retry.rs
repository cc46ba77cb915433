//! Bounded exponential retry.

use crate::error::{ErrorKind, KitError, KitResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 1;

/// Share of the nominal delay added at most as random jitter.
const JITTER_RATIO: f64 = 0.1;

/// How a connection attempt is retried.
///
/// The default makes a single attempt and never waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of tries, including the first one (a value of 0 behaves as 1)
    pub attempts: u32,
    /// Delay before the second try; doubles for every further try
    pub initial_delay: Duration,
    /// Upper bound for a single delay (0 = unbounded)
    pub limit_delay: Duration,
    /// Kinds that may trigger another try; empty means every failure does
    #[serde(default)]
    pub retriables: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay: Duration::ZERO,
            limit_delay: Duration::ZERO,
            retriables: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Retry up to `attempts` times with the given delay bounds.
    pub fn new(attempts: u32, initial_delay: Duration, limit_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            limit_delay,
            retriables: Vec::new(),
        }
    }

    /// Restrict retrying to failures of the listed kinds.
    pub fn retrying_only(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retriables = kinds.into_iter().collect();
        self
    }

    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn is_retriable(&self, err: &KitError) -> bool {
        self.retriables.is_empty() || self.retriables.contains(&err.kind())
    }

    /// Nominal delay after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        self.cap(delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        if self.limit_delay.is_zero() {
            delay
        } else {
            delay.min(self.limit_delay)
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let ceiling = delay.mul_f64(JITTER_RATIO);
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=ceiling);
        self.cap(delay.saturating_add(jitter))
    }
}

/// Run `attempt` until it succeeds, the attempts are exhausted, a non-retriable error shows
/// up, or `exceeded` is cancelled.
///
/// Attempts are numbered from 1. Only the last error is surfaced, with the number of
/// attempts made attached as the `attempts` field.
pub async fn execute<T, F, Fut>(
    config: &RetryConfig,
    exceeded: &CancellationToken,
    mut attempt: F,
) -> KitResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = KitResult<T>>,
{
    let attempts = config.max_attempts();
    let mut current = 1;

    loop {
        let err = match attempt(current).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if current >= attempts || !config.is_retriable(&err) || exceeded.is_cancelled() {
            return Err(err.with_field("attempts", current));
        }

        let delay = config.jittered(config.backoff(current));
        debug!(
            attempt = current,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = exceeded.cancelled() => {
                    return Err(err.with_field("attempts", current));
                }
            }
        }

        current += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig::new(5, Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(3), Duration::from_millis(35));
        assert_eq!(config.backoff(10), Duration::from_millis(35));
    }

    #[test]
    fn test_backoff_without_limit_is_unbounded() {
        let config = RetryConfig::new(5, Duration::from_millis(10), Duration::ZERO);
        assert_eq!(config.backoff(4), Duration::from_millis(80));
        assert!(config.backoff(64) > Duration::from_secs(86_400));
    }

    #[test]
    fn test_zero_delays_never_wait() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(1), Duration::ZERO);
        assert_eq!(config.jittered(config.backoff(3)), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = RetryConfig::new(5, Duration::from_millis(10), Duration::from_millis(100));
        for attempt in 1..8 {
            let nominal = config.backoff(attempt);
            let delay = config.jittered(nominal);
            assert!(delay >= nominal);
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_always_failing_makes_exactly_n_attempts() {
        let mut calls = 0;
        let err = execute(&RetryConfig::new(4, Duration::ZERO, Duration::ZERO), &never(), |_| {
            calls += 1;
            async { Err::<(), _>(KitError::generic()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 4);
        assert_eq!(err.field("attempts"), Some("4"));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt_after_two_increasing_delays() {
        let config = RetryConfig::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let stamps = Mutex::new(Vec::new());

        let result = execute(&config, &never(), |attempt| {
            stamps.lock().unwrap().push(Instant::now());
            async move {
                if attempt < 3 {
                    Err(KitError::generic())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 3);
        let first = stamps[1] - stamps[0];
        let second = stamps[2] - stamps[1];
        assert!(first >= Duration::from_millis(10));
        assert!(second >= Duration::from_millis(20));
        assert!(config.backoff(2) > config.backoff(1));

        for attempt in 1..=2 {
            for _ in 0..100 {
                let delay = config.jittered(config.backoff(attempt));
                assert!(delay >= config.backoff(attempt));
                assert!(delay <= Duration::from_millis(100));
            }
        }
    }

    #[tokio::test]
    async fn test_non_retriable_kind_aborts_immediately() {
        let config = RetryConfig::new(5, Duration::ZERO, Duration::ZERO)
            .retrying_only([ErrorKind::TimedOut]);
        let mut calls = 0;
        let err = execute(&config, &never(), |_| {
            calls += 1;
            async { Err::<(), _>(KitError::integrity_violation()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    }

    #[tokio::test]
    async fn test_retriable_kind_keeps_retrying() {
        let config = RetryConfig::new(3, Duration::ZERO, Duration::ZERO)
            .retrying_only([ErrorKind::TimedOut]);
        let mut calls = 0;
        let _ = execute(&config, &never(), |_| {
            calls += 1;
            async { Err::<(), _>(KitError::timed_out()) }
        })
        .await;
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let mut calls = 0;
        let err = execute(
            &RetryConfig::new(10, Duration::from_secs(1), Duration::ZERO),
            &token,
            |_| {
                calls += 1;
                async { Err::<(), _>(KitError::generic()) }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.field("attempts"), Some("1"));
    }
}
