use alloc::{sync::Arc, vec::Vec};

use kspin::SpinNoIrq;
use slab::Slab;

use crate::{UnitRef, UnitState, WeakUnitRef, percpu};

/// Per-CPU record of the units a CPU created.
///
/// Entries are weak, so the registry never keeps unit storage alive. The
/// owning CPU's reaper sweeps out entries whose storage is gone.
pub(crate) struct Registry {
    slots: SpinNoIrq<Slab<WeakUnitRef>>,
    limit: usize,
}

impl Registry {
    pub fn new(nslots: usize) -> Self {
        Self {
            slots: SpinNoIrq::new(Slab::with_capacity(nslots)),
            limit: nslots,
        }
    }

    pub fn insert(&self, unit: &UnitRef) {
        let mut slots = self.slots.lock();
        if slots.len() >= self.limit {
            drop(slots);
            warn!("unit registry full, unit {} not recorded", unit.id());
            return;
        }
        slots.insert(Arc::downgrade(unit));
    }

    pub fn sweep(&self) {
        self.slots.lock().retain(|_, weak| weak.strong_count() != 0);
    }

    /// Clones of the recorded handles, taken under the lock.
    pub fn snapshot(&self) -> Vec<WeakUnitRef> {
        self.slots.lock().iter().map(|(_, w)| w.clone()).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Live units created on `cpu`, in no particular order.
///
/// Units that migrated away are still listed under the CPU that created them.
pub fn all_units(cpu: usize) -> Vec<UnitRef> {
    percpu::cpu(cpu)
        .registry
        .snapshot()
        .iter()
        .filter_map(WeakUnitRef::upgrade)
        .filter(|u| u.state() != UnitState::Dead)
        .collect()
}
