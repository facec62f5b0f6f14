//! Schedulable units.

use alloc::{
    string::String,
    sync::{Arc, Weak},
};
use core::{
    fmt,
    sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use cpumask::CpuMask;
use kspin::{SpinNoIrq, SpinRaw};

use crate::{
    config::{MAX_CPUS, PRIORITY_LEVELS},
    host::Baton,
};

/// A shared handle to a [`Unit`].
pub type UnitRef = Arc<Unit>;

/// A non-owning handle to a [`Unit`].
pub type WeakUnitRef = Weak<Unit>;

/// CPU affinity of a unit.
pub type AffinityMask = CpuMask<MAX_CPUS>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn alloc_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Scheduling state of a unit.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Ready to run, either queued or in flight to its CPU.
    Runnable = 1,
    /// The `current` unit of its CPU.
    Running = 2,
    /// Suspended until woken.
    Blocked = 3,
    /// Exited; storage may be recycled.
    Dead = 4,
}

impl From<u8> for UnitState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Dead,
            _ => panic!("corrupt unit state {v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    None,
    Woken,
    Timeout,
    Signal,
}

/// Wakeup interlock.
///
/// `token` is set by any wakeup and consumed by the next block, so a wakeup
/// that lands between `sleep_interlock` and `block_current` is never lost.
pub(crate) struct WakeState {
    pub token: bool,
    pub reason: WakeReason,
    pub interruptible: bool,
    pub signal_pending: bool,
}

impl WakeState {
    const fn new() -> Self {
        Self {
            token: false,
            reason: WakeReason::None,
            interruptible: false,
            signal_pending: false,
        }
    }
}

/// A lightweight kernel thread bound to one CPU at a time.
pub struct Unit {
    id: AtomicU64,
    name: SpinNoIrq<String>,
    priority: AtomicU8,
    state: AtomicU8,
    cpu: AtomicUsize,
    affinity: SpinNoIrq<AffinityMask>,
    is_idle: bool,
    crit: AtomicU32,
    run_ticks: AtomicU64,
    slice_ticks: AtomicU32,
    // never held across a switch or a wakeup of another unit
    pub(crate) wake: SpinRaw<WakeState>,
    pub(crate) baton: Baton,
}

impl Unit {
    pub(crate) fn new(name: String, priority: u8, cpu: usize, affinity: AffinityMask) -> UnitRef {
        assert!((priority as usize) < PRIORITY_LEVELS, "priority {priority} out of range");
        Arc::new(Self {
            id: AtomicU64::new(alloc_id()),
            name: SpinNoIrq::new(name),
            priority: AtomicU8::new(priority),
            state: AtomicU8::new(UnitState::Runnable as u8),
            cpu: AtomicUsize::new(cpu),
            affinity: SpinNoIrq::new(affinity),
            is_idle: false,
            crit: AtomicU32::new(0),
            run_ticks: AtomicU64::new(0),
            slice_ticks: AtomicU32::new(0),
            wake: SpinRaw::new(WakeState::new()),
            baton: Baton::new(false),
        })
    }

    /// Creates a unit that has no continuation of its own.
    ///
    /// Such a unit can be queued and picked like any other, which is what
    /// run-queue bookkeeping and tests need, but it must never be switched to.
    pub fn new_detached(name: &str, priority: u8, cpu: usize) -> UnitRef {
        Self::new(name.into(), priority, cpu, AffinityMask::full())
    }

    pub(crate) fn new_idle(cpu: usize) -> UnitRef {
        Arc::new(Self {
            id: AtomicU64::new(alloc_id()),
            name: SpinNoIrq::new(alloc::format!("idle/{cpu}")),
            priority: AtomicU8::new(crate::config::PRIO_IDLE),
            state: AtomicU8::new(UnitState::Running as u8),
            cpu: AtomicUsize::new(cpu),
            affinity: SpinNoIrq::new(AffinityMask::one_shot(cpu)),
            is_idle: true,
            crit: AtomicU32::new(0),
            run_ticks: AtomicU64::new(0),
            slice_ticks: AtomicU32::new(0),
            wake: SpinRaw::new(WakeState::new()),
            baton: Baton::new(true),
        })
    }

    /// Reinitializes cached storage for a new lifetime under a fresh id.
    pub(crate) fn recycle(&self, name: String, priority: u8, cpu: usize, affinity: AffinityMask) {
        debug_assert_eq!(self.state(), UnitState::Dead);
        self.id.store(alloc_id(), Ordering::Release);
        *self.name.lock() = name;
        self.priority.store(priority, Ordering::Release);
        self.cpu.store(cpu, Ordering::Release);
        *self.affinity.lock() = affinity;
        self.crit.store(0, Ordering::Relaxed);
        self.run_ticks.store(0, Ordering::Relaxed);
        self.slice_ticks.store(0, Ordering::Relaxed);
        *self.wake.lock() = WakeState::new();
        self.baton.reset();
        self.state
            .store(UnitState::Runnable as u8, Ordering::Release);
    }

    /// Unique id of this unit's current lifetime. Never 0.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Name given at spawn.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Scheduling priority, `0..PRIORITY_LEVELS`.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority_raw(&self, priority: u8) {
        self.priority.store(priority, Ordering::Release);
    }

    /// Current scheduling state.
    #[inline]
    pub fn state(&self) -> UnitState {
        self.state.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: UnitState, to: UnitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CPU whose run queue and timers own this unit.
    #[inline]
    pub fn owning_cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_owning_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// CPUs this unit may be migrated to.
    pub fn affinity(&self) -> AffinityMask {
        self.affinity.lock().clone()
    }

    /// Whether this is a per-CPU idle unit.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Nesting depth of critical sections held by this unit.
    #[inline]
    pub fn crit_depth(&self) -> u32 {
        self.crit.load(Ordering::Relaxed)
    }

    pub(crate) fn crit_inc(&self) {
        self.crit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn crit_dec(&self) {
        let old = self.crit.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "critical section underflow on unit {}", self.id());
    }

    pub(crate) fn crit_reset(&self) {
        self.crit.store(0, Ordering::Relaxed);
    }

    /// Clock ticks charged to this unit.
    pub fn run_ticks(&self) -> u64 {
        self.run_ticks.load(Ordering::Relaxed)
    }

    /// Charges one tick and returns the ticks used in the current slice.
    pub(crate) fn charge_tick(&self) -> u32 {
        self.run_ticks.fetch_add(1, Ordering::Relaxed);
        self.slice_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn new_slice(&self) {
        self.slice_ticks.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id())
            .field("name", &*self.name.lock())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .field("cpu", &self.owning_cpu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let a = Unit::new_detached("a", 1, 0);
        let b = Unit::new_detached("b", 1, 0);
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn state_transitions_are_checked() {
        let u = Unit::new_detached("u", 3, 0);
        assert_eq!(u.state(), UnitState::Runnable);
        assert!(!u.transition(UnitState::Blocked, UnitState::Runnable));
        assert!(u.transition(UnitState::Runnable, UnitState::Running));
        assert_eq!(u.state(), UnitState::Running);
    }

    #[test]
    fn recycle_assigns_fresh_identity() {
        let u = Unit::new_detached("old", 3, 0);
        let old_id = u.id();
        u.set_state(UnitState::Dead);
        u.recycle("new".into(), 7, 1, AffinityMask::one_shot(1));
        assert_ne!(u.id(), old_id);
        assert_eq!(u.name(), "new");
        assert_eq!(u.priority(), 7);
        assert_eq!(u.owning_cpu(), 1);
        assert_eq!(u.state(), UnitState::Runnable);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn priority_is_bounded() {
        let _ = Unit::new_detached("bad", PRIORITY_LEVELS as u8, 0);
    }
}
