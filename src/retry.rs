//! Retry with capped exponential backoff and jitter.
//!
//! Delay for attempt `k` (1-indexed) is `min(max, base * 2^(k-1))`, then
//! jittered, then raised to any `retry_after` hint carried by the error.
//! Cancellation during backoff surfaces `Canceled`, not the prior error.
//! `BreakerOpen` is retried only when the raw delay for the upcoming sleep
//! covers the breaker's remaining open window, so the next attempt has a
//! chance of being admitted.

use crate::error::{Error, ErrorKind};
use crate::jitter::Jitter;
use crate::sleeper::Sleeper;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Default::default() }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before jitter for a 1-indexed attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base
            .checked_mul(multiplier)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    /// The sleep before the next attempt, or `None` when `error` should be
    /// surfaced as-is (non-retryable kind, attempts exhausted, or a breaker
    /// window the backoff cannot outlast).
    pub(crate) fn delay_for(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match error.kind {
            ErrorKind::Canceled => None,
            ErrorKind::BreakerOpen => {
                let remaining = error.retry_after.unwrap_or(Duration::ZERO);
                let raw = self.raw_delay(attempt);
                if raw < remaining {
                    return None;
                }
                Some(self.jitter.apply(raw).max(remaining))
            }
            kind if kind.is_retryable() => {
                let mut delay = self.jitter.apply(self.raw_delay(attempt));
                if let Some(hint) = error.retry_after {
                    delay = delay.max(hint);
                }
                Some(delay)
            }
            _ => None,
        }
    }

    /// Run `operation` until success, exhaustion, or a non-retryable error.
    /// `on_retry(attempt, wait, error)` fires before each backoff sleep.
    pub(crate) async fn execute<T, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        sleeper: &dyn Sleeper,
        mut on_retry: impl FnMut(u32, Duration, &Error),
        mut operation: Op,
    ) -> Result<T, Error>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => match self.delay_for(attempt, &error) {
                    None => return Err(error.with_attempts(attempt)),
                    Some(wait) => {
                        on_retry(attempt, wait, &error);
                        tracing::debug!(
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            kind = %error.kind,
                            "retrying after transient error"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(Error::canceled().with_attempts(attempt))
                            }
                            _ = sleeper.sleep(wait) => {}
                        }
                        attempt += 1;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_base(Duration::from_millis(base_ms))
            .with_max(Duration::from_millis(max_ms))
            .with_jitter(Jitter::None)
    }

    #[test]
    fn raw_delay_doubles_and_caps() {
        let p = policy(5, 100, 1000);
        assert_eq!(p.raw_delay(1), Duration::from_millis(100));
        assert_eq!(p.raw_delay(2), Duration::from_millis(200));
        assert_eq!(p.raw_delay(3), Duration::from_millis(400));
        assert_eq!(p.raw_delay(4), Duration::from_millis(800));
        assert_eq!(p.raw_delay(5), Duration::from_millis(1000));
        assert_eq!(p.raw_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn retry_after_hint_raises_the_delay() {
        let p = policy(3, 100, 1000);
        let err = Error::from_status(429, "slow down")
            .with_retry_after(Duration::from_millis(750));
        assert_eq!(p.delay_for(1, &err), Some(Duration::from_millis(750)));
        // Hint below the computed delay does not lower it.
        let err = Error::from_status(429, "slow down")
            .with_retry_after(Duration::from_millis(50));
        assert_eq!(p.delay_for(2, &err), Some(Duration::from_millis(200)));
    }

    #[test]
    fn breaker_open_retries_only_when_window_elapses_first() {
        let p = policy(3, 100, 1000);
        let short = Error::breaker_open(Duration::from_millis(80));
        assert_eq!(p.delay_for(1, &short), Some(Duration::from_millis(100)));
        let long = Error::breaker_open(Duration::from_millis(5000));
        assert_eq!(p.delay_for(1, &long), None);
    }

    #[test]
    fn exhaustion_and_non_retryable_return_none() {
        let p = policy(3, 100, 1000);
        let server = Error::from_status(500, "boom");
        assert!(p.delay_for(3, &server).is_none(), "last attempt");
        let auth = Error::from_status(401, "no");
        assert!(p.delay_for(1, &auth).is_none());
        assert!(p.delay_for(1, &Error::canceled()).is_none());
    }

    #[tokio::test]
    async fn executes_until_success() {
        let p = policy(5, 10, 100);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let cancel = CancellationToken::new();

        let result = p
            .execute(&cancel, &InstantSleeper, |_, _, _| {}, move |_| {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::from_status(503, "busy"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_with_attempts_on_exhaustion() {
        let p = policy(3, 10, 100);
        let cancel = CancellationToken::new();
        let err = p
            .execute(&cancel, &InstantSleeper, |_, _, _| {}, |attempt| async move {
                Err::<(), _>(Error::from_status(500, format!("fail {attempt}")))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.message.contains("fail 3"));
    }

    #[tokio::test]
    async fn sleeps_follow_the_backoff_series() {
        let p = policy(4, 100, 10_000);
        let sleeper = TrackingSleeper::new();
        let cancel = CancellationToken::new();
        let _ = p
            .execute(&cancel, &sleeper, |_, _, _| {}, |_| async {
                Err::<(), _>(Error::from_status(500, "always"))
            })
            .await;
        assert_eq!(
            sleeper.recorded(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_during_backoff_returns_canceled() {
        let p = policy(3, 50, 1000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // TokioSleeper would park; the pre-cancelled token must win the race.
        let err = p
            .execute(
                &cancel,
                &crate::sleeper::TokioSleeper,
                |_, _, _| {},
                |_| async { Err::<(), _>(Error::from_status(500, "boom")) },
            )
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn on_retry_sees_each_attempt() {
        let p = policy(3, 10, 100);
        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _ = p
            .execute(
                &cancel,
                &InstantSleeper,
                move |attempt, wait, error| {
                    seen_clone.lock().unwrap().push((attempt, wait, error.kind));
                },
                |_| async { Err::<(), _>(Error::from_status(500, "boom")) },
            )
            .await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert!(seen.iter().all(|(_, _, k)| *k == ErrorKind::ServerError));
    }
}
