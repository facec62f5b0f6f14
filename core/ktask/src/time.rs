//! Time base.

use core::time::Duration;

/// A monotonic nanosecond time source driving systimers.
pub trait ClockSource: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;
}

/// Current time on the system clock, in nanoseconds.
#[inline]
pub fn now_ns() -> u64 {
    crate::host::clock().now_ns()
}

/// Clock interrupt frequency.
pub fn hz() -> u32 {
    crate::percpu::table().config.hz
}

/// Converts clock ticks to nanoseconds at the configured `hz`.
pub fn ticks_to_ns(ticks: u64) -> u64 {
    ticks.saturating_mul(crate::percpu::table().config.tick_ns())
}

/// Converts a duration to an absolute deadline on the system clock.
pub fn deadline_after(dur: Duration) -> u64 {
    now_ns().saturating_add(dur.as_nanos().min(u64::MAX as u128) as u64)
}
