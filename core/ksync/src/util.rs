//! Adaptive spinning shared by the blocking primitives.

use ktask::yield_now;

/// How long a contended acquire keeps retrying before it queues a waiter.
///
/// # Valid Ranges
///
/// - `max_spins`: at most 100; 0 queues on the first collision
/// - `spin_before_yield`: at most `max_spins` and at most 10, since the
///   busy rounds back off exponentially
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Retries before queueing
    pub max_spins: u32,
    /// Busy retries before the remaining ones yield the CPU
    pub spin_before_yield: u32,
}

impl SpinConfig {
    /// Ten retries, the first three busy.
    pub const DEFAULT: Self = Self {
        max_spins: 10,
        spin_before_yield: 3,
    };

    /// Never spin: contention queues immediately.
    pub const NONE: Self = Self {
        max_spins: 0,
        spin_before_yield: 0,
    };
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub(crate) struct Spin {
    count: u32,
    config: SpinConfig,
}

impl Spin {
    #[inline]
    pub(crate) fn new(config: SpinConfig) -> Self {
        Self { count: 0, config }
    }

    /// One retry round. Returns `false` once the budget is spent.
    #[inline]
    pub(crate) fn spin(&mut self) -> bool {
        if self.count >= self.config.max_spins {
            return false;
        }
        self.count += 1;
        if self.count <= self.config.spin_before_yield {
            for _ in 0..(1u32 << self.count.min(10)) {
                core::hint::spin_loop();
            }
        } else {
            yield_now();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_bounded() {
        let mut spin = Spin::new(SpinConfig {
            max_spins: 2,
            spin_before_yield: 2,
        });
        assert!(spin.spin());
        assert!(spin.spin());
        assert!(!spin.spin());
        assert!(!Spin::new(SpinConfig::NONE).spin());
    }
}
