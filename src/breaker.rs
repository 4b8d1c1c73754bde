//! Per-binding circuit breaking.
//!
//! State machine: closed → (threshold consecutive failures) → open →
//! (open window elapsed, lazily on next attempt) → half-open →
//! (probe success) → closed, or (probe failure) → open again.
//!
//! The breaker itself only logs; the caller receives transitions from
//! `record_*` and owns event emission. Errors classified as non-failures
//! must be recorded with [`CircuitBreaker::record_ignored`] so they release
//! a half-open probe slot without moving the state machine.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub open_duration: Duration,
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// State change reported by `record_success` / `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BreakerTransition {
    Opened { failures: usize },
    Closed,
}

/// Proof that `before_pass` admitted this call; must be handed back to
/// exactly one `record_*` so half-open probe slots are released.
#[must_use]
#[derive(Debug)]
pub(crate) struct BreakerPass {
    half_open: bool,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicUsize,
}

#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    shared: Arc<Shared>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicUsize::new(0),
            }),
            config,
            clock,
        }
    }

    /// Admit or reject a call. Rejection carries the remaining open window
    /// (zero when half-open probes are saturated).
    pub(crate) fn before_pass(&self) -> Result<BreakerPass, Duration> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(BreakerPass { half_open: false }),
                STATE_OPEN => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let open_ms = self.config.open_duration.as_millis() as u64;
                    if elapsed < open_ms {
                        return Err(Duration::from_millis(open_ms - elapsed));
                    }
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.shared.half_open_in_flight.store(1, Ordering::Release);
                            tracing::info!("circuit breaker half-open, probing");
                            return Ok(BreakerPass { half_open: true });
                        }
                        // Lost the transition race; re-read the state.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.shared.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_probes {
                        self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        return Err(Duration::ZERO);
                    }
                    return Ok(BreakerPass { half_open: true });
                }
                _ => unreachable!("invalid breaker state"),
            }
        }
    }

    pub(crate) fn record_success(&self, pass: BreakerPass) -> Option<BreakerTransition> {
        if pass.half_open {
            self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
            if self
                .shared
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.shared.failures.store(0, Ordering::Release);
                self.shared.opened_at_millis.store(0, Ordering::Release);
                tracing::info!("circuit breaker closed");
                return Some(BreakerTransition::Closed);
            }
            return None;
        }
        if self.shared.state.load(Ordering::Acquire) == STATE_CLOSED {
            self.shared.failures.store(0, Ordering::Release);
        }
        None
    }

    pub(crate) fn record_failure(&self, pass: BreakerPass) -> Option<BreakerTransition> {
        let failures = self.shared.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if pass.half_open {
            self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
            if self
                .shared
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.shared
                    .opened_at_millis
                    .store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!(failures, "circuit breaker probe failed, reopening");
                return Some(BreakerTransition::Opened { failures });
            }
            return None;
        }
        if failures >= self.config.failure_threshold
            && self
                .shared
                .state
                .compare_exchange(
                    STATE_CLOSED,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.shared
                .opened_at_millis
                .store(self.clock.now_millis(), Ordering::Release);
            tracing::warn!(
                failures,
                threshold = self.config.failure_threshold,
                "circuit breaker open"
            );
            return Some(BreakerTransition::Opened { failures });
        }
        None
    }

    /// Release the pass without counting the outcome (cancellation, client
    /// errors, and other non-failures per the classification table).
    pub(crate) fn record_ignored(&self, pass: BreakerPass) {
        if pass.half_open {
            self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    #[cfg(test)]
    fn failures(&self) -> usize {
        self.shared.failures.load(Ordering::Acquire)
    }
}

/// Lazily-populated breaker map keyed by binding key.
#[derive(Debug)]
pub(crate) struct BreakerRegistry {
    inner: Mutex<HashMap<String, CircuitBreaker>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub(crate) fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(HashMap::new()), config, clock }
    }

    pub(crate) fn get_or_create(&self, key: &str) -> CircuitBreaker {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config, self.clock.clone()))
            .clone()
    }

    /// Breaker state for a binding, if any call has touched it.
    pub(crate) fn state(&self, key: &str) -> Option<CircuitState> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(key).map(|b| b.state())
    }
}
