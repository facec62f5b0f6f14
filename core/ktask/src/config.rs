//! Scheduler configuration.

use kerrno::{KResult, ensure, k_err};

/// Number of priority buckets in each run queue.
pub const PRIORITY_LEVELS: usize = 32;

/// Largest supported CPU count.
pub const MAX_CPUS: usize = 64;

/// Default bound on recycled unit storage kept per CPU.
pub const CACHE_NTHREADS: usize = 6;

/// Default clock interrupt frequency.
pub const DEFAULT_HZ: u32 = 100;

/// Priority of the per-CPU idle unit. Ordinary units may share it.
pub const PRIO_IDLE: u8 = 0;
/// Default priority of spawned units.
pub const PRIO_NORMAL: u8 = 16;
/// Priority for kernel service units.
pub const PRIO_KERNEL: u8 = 24;
/// Priority for software interrupt units.
pub const PRIO_SOFTINT: u8 = 28;
/// Highest priority.
pub const PRIO_MAX: u8 = (PRIORITY_LEVELS - 1) as u8;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Boot-time configuration of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KtaskConfig {
    /// Number of logical CPUs to bring up.
    pub ncpus: usize,
    /// Clock interrupt frequency driving `hardclock`.
    pub hz: u32,
    /// Bound on each CPU's free-unit cache.
    pub free_cache: usize,
    /// Ticks a unit may run before equal-priority work asks it to yield.
    pub quantum_ticks: u32,
    /// Diagnostic registry slots per CPU.
    pub registry_slots: usize,
}

impl Default for KtaskConfig {
    fn default() -> Self {
        Self {
            ncpus: 4,
            hz: DEFAULT_HZ,
            free_cache: CACHE_NTHREADS,
            quantum_ticks: 2,
            registry_slots: 256,
        }
    }
}

impl KtaskConfig {
    /// Rejects configurations the scheduler cannot run with.
    pub fn validate(&self) -> KResult {
        ensure!(
            self.ncpus > 0 && self.ncpus <= MAX_CPUS,
            k_err!(InvalidInput, "cpu count out of range")
        );
        ensure!(
            self.hz > 0 && u64::from(self.hz) <= NANOS_PER_SEC,
            k_err!(InvalidInput, "hz out of range")
        );
        ensure!(self.quantum_ticks > 0, k_err!(InvalidInput));
        Ok(())
    }

    /// Length of one clock tick in nanoseconds.
    pub const fn tick_ns(&self) -> u64 {
        NANOS_PER_SEC / self.hz as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = KtaskConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tick_ns(), 10_000_000);
    }

    #[test]
    fn rejects_bad_values() {
        let zero_cpus = KtaskConfig {
            ncpus: 0,
            ..Default::default()
        };
        assert_eq!(zero_cpus.validate(), Err(kerrno::KError::InvalidInput));

        let too_many = KtaskConfig {
            ncpus: MAX_CPUS + 1,
            ..Default::default()
        };
        assert!(too_many.validate().is_err());

        let no_hz = KtaskConfig {
            hz: 0,
            ..Default::default()
        };
        assert!(no_hz.validate().is_err());
    }
}
