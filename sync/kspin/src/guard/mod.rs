//! RAII guards for critical sections.
//!
//! A guard is entered before the lock word is taken and left after it is
//! released, so a spinlock holder is never switched out while other units on
//! the same CPU could spin on it.

/// Hooks into the scheduler's critical-section accounting.
///
/// Implemented once per kernel image (the task crate provides it).
#[crate_interface::def_interface]
pub trait KernelGuardIf {
    /// Leave one level of critical section.
    fn enable_preempt();

    /// Enter one level of critical section.
    fn disable_preempt();

    /// Mask interrupt-context work, returning the previous mask state.
    fn local_irq_save_and_disable() -> usize;

    /// Restore the interrupt mask saved by `local_irq_save_and_disable`.
    fn local_irq_restore(flags: usize);
}

/// Base trait for all guard types.
pub trait BaseGuard {
    /// State saved when entering the critical section.
    type State: Clone + Copy;

    /// Enter the critical section, returning saved state.
    fn acquire() -> Self::State;

    /// Exit the critical section, restoring state.
    fn release(state: Self::State);
}

mod types;

pub use types::{NoOp, NoPreempt, NoPreemptIrqSave};
