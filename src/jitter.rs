//! Backoff jitter to spread retries from concurrent callers.

use rand::Rng;
use std::time::Duration;

/// Jitter applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Sleep exactly the computed delay.
    None,
    /// Sleep a uniform random duration in `[0, delay]`.
    Full,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Like [`apply`](Self::apply) but with a caller-supplied RNG, so tests
    /// can seed it.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }
}
