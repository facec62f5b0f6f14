//! Critical sections.
//!
//! A critical section pins the running unit to its CPU: no switch may happen
//! until it is left. The spinlock guards of `kspin` enter one through
//! [`KernelGuardIf`], which is implemented here.

use core::marker::PhantomData;

use kspin::KernelGuardIf;

use crate::{UnitRef, sched};

/// An entered critical section, left on drop.
///
/// Not `Send`: it must be dropped by the unit that entered it.
#[must_use = "the critical section is left immediately if the guard is dropped"]
pub struct CritSection {
    unit: Option<UnitRef>,
    _not_send: PhantomData<*const ()>,
}

/// Enters a critical section on the calling unit.
///
/// Outside a unit the guard does nothing.
pub fn crit_enter() -> CritSection {
    let unit = sched::try_current();
    if let Some(unit) = &unit {
        unit.crit_inc();
    }
    CritSection {
        unit,
        _not_send: PhantomData,
    }
}

impl CritSection {
    /// Nesting depth including this section.
    pub fn depth(&self) -> u32 {
        self.unit.as_ref().map_or(0, |u| u.crit_depth())
    }
}

impl Drop for CritSection {
    fn drop(&mut self) {
        if let Some(unit) = &self.unit {
            unit.crit_dec();
        }
    }
}

struct KernelGuardImpl;

#[crate_interface::impl_interface]
impl KernelGuardIf for KernelGuardImpl {
    fn enable_preempt() {
        sched::with_current(|unit| unit.crit_dec());
    }

    fn disable_preempt() {
        sched::with_current(|unit| unit.crit_inc());
    }

    // Interrupt-context work only runs at safe points, and those are already
    // held off by the critical section the guard entered first.
    fn local_irq_save_and_disable() -> usize {
        0
    }

    fn local_irq_restore(_flags: usize) {}
}
