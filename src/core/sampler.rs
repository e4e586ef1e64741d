//! Decides which allocations get redzones.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free xorshift sampler against a fixed guard rate.
pub struct GuardSampler {
    rate: f64,
    state: AtomicU64,
}

impl GuardSampler {
    /// Sample with probability `rate`, clamped to `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next(&self) -> u64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = current;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            match self
                .state
                .compare_exchange_weak(current, x, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return x,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether the next allocation should be guarded.
    pub fn should_guard(&self) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        let sample = (self.next() >> 11) as f64 / (1u64 << 53) as f64;
        sample < self.rate
    }
}
