//! Cumulative USD accounting across concurrent calls.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotone non-decreasing cost counter. Stores f64 bits in an atomic and
/// adds with a CAS loop so concurrent calls never lose an increment.
#[derive(Debug, Default)]
pub(crate) struct CostCounter {
    bits: AtomicU64,
}

impl CostCounter {
    pub(crate) fn add(&self, amount: f64) {
        if !(amount > 0.0) {
            return;
        }
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + amount;
            match self.bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn total(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
