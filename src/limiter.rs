//! Per-binding token-bucket admission control.
//!
//! Buckets refill continuously at `rps` tokens per second up to `burst`.
//! `acquire` blocks (cancellably) until a token is available; bindings with
//! no configured rule pass through untouched. State updates are mutually
//! exclusive per binding, but waiting happens outside the bucket lock so
//! concurrent callers queue in parallel.

use crate::clock::Clock;
use crate::error::Error;
use crate::sleeper::Sleeper;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Admission rule for one binding key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub rps: f64,
    pub burst: f64,
}

impl RateLimit {
    /// Burst defaults to `rps`.
    pub fn new(rps: f64) -> Self {
        Self { rps, burst: rps }
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_millis: u64,
}

#[derive(Debug)]
pub(crate) struct RateLimiter {
    rules: HashMap<String, RateLimit>,
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiter {
    pub(crate) fn new(
        rules: HashMap<String, RateLimit>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { rules, buckets: Mutex::new(HashMap::new()), clock, sleeper }
    }

    /// Block until one token is available for `key`. `on_wait` is invoked
    /// with the computed wait before each sleep. Cancellation while waiting
    /// returns `Canceled` and consumes no token.
    pub(crate) async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
        on_wait: impl Fn(Duration),
    ) -> Result<(), Error> {
        let Some(rule) = self.rules.get(key) else {
            return Ok(());
        };
        let bucket = self.bucket(key, rule);

        loop {
            let wait = {
                let mut b = bucket.lock().unwrap_or_else(|p| p.into_inner());
                let now = self.clock.now_millis();
                let elapsed_secs =
                    now.saturating_sub(b.last_refill_millis) as f64 / 1000.0;
                b.tokens = (b.tokens + elapsed_secs * rule.rps).min(rule.burst);
                b.last_refill_millis = now;
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    None
                } else {
                    let wait_ms = ((1.0 - b.tokens) / rule.rps * 1000.0).ceil();
                    Some(Duration::from_millis(wait_ms as u64))
                }
            };

            match wait {
                None => return Ok(()),
                Some(delay) => {
                    on_wait(delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::canceled()),
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn bucket(&self, key: &str, rule: &RateLimit) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: rule.burst,
                    last_refill_millis: self.clock.now_millis(),
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TokioSleeper;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock advanced manually by tests; paired with a sleeper that moves
    /// it forward instead of sleeping.
    #[derive(Debug, Clone, Default)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone)]
    struct AdvancingSleeper {
        clock: ManualClock,
        slept: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for AdvancingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
            self.clock
                .now
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    fn limiter_with(rps: f64, burst: f64) -> (RateLimiter, Arc<Mutex<Vec<Duration>>>) {
        let clock = ManualClock::default();
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sleeper = AdvancingSleeper { clock: clock.clone(), slept: slept.clone() };
        let mut rules = HashMap::new();
        rules.insert("x:m".to_string(), RateLimit::new(rps).with_burst(burst));
        (
            RateLimiter::new(rules, Arc::new(clock), Arc::new(sleeper)),
            slept,
        )
    }

    #[tokio::test]
    async fn unknown_binding_passes_through() {
        let (limiter, slept) = limiter_with(1.0, 1.0);
        let cancel = CancellationToken::new();
        for _ in 0..50 {
            limiter.acquire("other:m", &cancel, |_| {}).await.unwrap();
        }
        assert!(slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn burst_admits_without_waiting_then_queues() {
        let (limiter, slept) = limiter_with(2.0, 2.0);
        let cancel = CancellationToken::new();

        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        assert!(slept.lock().unwrap().is_empty());

        // Third token: bucket empty, 1 token at 2 rps is 500ms away.
        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        let waits = slept.lock().unwrap().clone();
        assert_eq!(waits, vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn wait_callback_sees_computed_delay() {
        let (limiter, _slept) = limiter_with(1.0, 1.0);
        let cancel = CancellationToken::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        let observed_clone = observed.clone();
        limiter
            .acquire("x:m", &cancel, move |d| observed_clone.lock().unwrap().push(d))
            .await
            .unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_returns_canceled() {
        let mut rules = HashMap::new();
        rules.insert("x:m".to_string(), RateLimit::new(1.0));
        let limiter = RateLimiter::new(
            rules,
            Arc::new(crate::clock::MonotonicClock::default()),
            Arc::new(TokioSleeper),
        );
        let cancel = CancellationToken::new();

        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        cancel.cancel();
        let err = limiter.acquire("x:m", &cancel, |_| {}).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn tokens_never_exceed_burst() {
        let (limiter, slept) = limiter_with(10.0, 3.0);
        let cancel = CancellationToken::new();

        // Burst of 3: exactly three immediate tokens regardless of rps.
        for _ in 0..3 {
            limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        }
        assert!(slept.lock().unwrap().is_empty());
        // Bucket is now empty; the next acquire must wait.
        limiter.acquire("x:m", &cancel, |_| {}).await.unwrap();
        assert_eq!(slept.lock().unwrap().len(), 1);
    }
}
