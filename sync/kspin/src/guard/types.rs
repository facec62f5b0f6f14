//! Concrete guard types.

use super::BaseGuard;

/// Guard that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl BaseGuard for NoOp {
    type State = ();

    #[inline(always)]
    fn acquire() -> Self::State {}

    #[inline(always)]
    fn release(_state: Self::State) {}
}

/// Guard that keeps the holder on its CPU until dropped.
#[derive(Debug)]
pub struct NoPreempt(());

impl BaseGuard for NoPreempt {
    type State = ();

    #[inline]
    fn acquire() -> Self::State {
        crate_interface::call_interface!(crate::guard::KernelGuardIf::disable_preempt);
    }

    #[inline]
    fn release(_state: Self::State) {
        crate_interface::call_interface!(crate::guard::KernelGuardIf::enable_preempt);
    }
}

impl NoPreempt {
    /// Enter the critical section.
    #[inline]
    pub fn new() -> Self {
        <Self as BaseGuard>::acquire();
        Self(())
    }
}

impl Drop for NoPreempt {
    #[inline]
    fn drop(&mut self) {
        <Self as BaseGuard>::release(())
    }
}

impl Default for NoPreempt {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that keeps the holder on its CPU and masks interrupt-context work.
#[derive(Debug)]
pub struct NoPreemptIrqSave(usize);

impl BaseGuard for NoPreemptIrqSave {
    type State = usize;

    #[inline]
    fn acquire() -> Self::State {
        // preemption first, then interrupts
        crate_interface::call_interface!(crate::guard::KernelGuardIf::disable_preempt);
        crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_save_and_disable)
    }

    #[inline]
    fn release(state: Self::State) {
        crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_restore, state);
        crate_interface::call_interface!(crate::guard::KernelGuardIf::enable_preempt);
    }
}

impl NoPreemptIrqSave {
    /// Enter the critical section.
    #[inline]
    pub fn new() -> Self {
        Self(<Self as BaseGuard>::acquire())
    }
}

impl Drop for NoPreemptIrqSave {
    #[inline]
    fn drop(&mut self) {
        <Self as BaseGuard>::release(self.0)
    }
}

impl Default for NoPreemptIrqSave {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
