//! Per-CPU scheduler context.
//!
//! Each logical CPU owns a [`PerCpu`]: its run queue, free-unit cache,
//! inbound message queue, systimer queue and ABI-stable counters. Only the
//! owning CPU mutates its scheduling state; every other CPU goes through
//! [`PerCpu::send`].

use alloc::{sync::Arc, vec::Vec};
use core::{
    mem::offset_of,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use bitflags::bitflags;
use kspin::SpinNoIrq;
use lazyinit::LazyInit;

use crate::{
    UnitRef, UnitState,
    config::KtaskConfig,
    ipi::{IpiMsg, IpiQueue},
    registry::Registry,
    run_queue::RunQueue,
    systimer::{SysTimer, SysTimerQueue, SysTimerRef},
    time::now_ns,
    unit::Unit,
};

bitflags! {
    /// Work a CPU owes itself at its next safe point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingFlags: u32 {
        /// A higher-priority unit became runnable, or the slice ran out.
        const RESCHED = 1 << 0;
        /// A clock tick was accounted.
        const PROF_TICK = 1 << 2;
        /// A signal is waiting for the running unit.
        const SIGNAL = 1 << 3;
    }
}

/// Scheduler counters read by code outside this crate.
///
/// The layout is part of the ABI: four 32-bit words at offsets 0, 4, 8, 12.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SchedCounters {
    /// Number of queued runnable units.
    pub runq_depth: AtomicU32,
    /// Units owned by this CPU that have not exited.
    pub active_units: AtomicU32,
    /// Exponential average of `runq_depth`, scaled by 100.
    pub load: AtomicU32,
    /// Run queue presence mask.
    pub queue_mask: AtomicU32,
}

const _: () = {
    assert!(offset_of!(SchedCounters, runq_depth) == 0);
    assert!(offset_of!(SchedCounters, active_units) == 4);
    assert!(offset_of!(SchedCounters, load) == 8);
    assert!(offset_of!(SchedCounters, queue_mask) == 12);
    assert!(size_of::<SchedCounters>() == 16);
};

/// A plain copy of [`SchedCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub runq_depth: u32,
    pub active_units: u32,
    pub load: u32,
    pub queue_mask: u32,
}

impl SchedCounters {
    /// Reads all four counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            runq_depth: self.runq_depth.load(Ordering::Relaxed),
            active_units: self.active_units.load(Ordering::Relaxed),
            load: self.load.load(Ordering::Relaxed),
            queue_mask: self.queue_mask.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct SchedState {
    pub current: UnitRef,
    pub run_queue: RunQueue,
    pub free_cache: Vec<UnitRef>,
    pub zombies: Vec<UnitRef>,
}

/// Scheduling context of one logical CPU.
pub struct PerCpu {
    id: usize,
    idle: UnitRef,
    pub(crate) sched: SpinNoIrq<SchedState>,
    pending: AtomicU32,
    intr_nesting: AtomicU32,
    pub(crate) ipiq: SpinNoIrq<IpiQueue>,
    pub(crate) systimers: SpinNoIrq<SysTimerQueue>,
    counters: SchedCounters,
    ticks: AtomicU64,
    switches: AtomicU64,
    pub(crate) registry: Registry,
    hardclock: LazyInit<SysTimerRef>,
    free_cache_limit: usize,
    quantum_ticks: u32,
}

/// Marks the CPU as being in interrupt context until dropped.
pub struct IntrGuard<'a>(&'a PerCpu);

impl Drop for IntrGuard<'_> {
    fn drop(&mut self) {
        self.0.intr_nesting.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PerCpu {
    fn new(id: usize, config: &KtaskConfig) -> Self {
        let idle = Unit::new_idle(id);
        Self {
            id,
            idle: idle.clone(),
            sched: SpinNoIrq::new(SchedState {
                current: idle,
                run_queue: RunQueue::new(),
                free_cache: Vec::with_capacity(config.free_cache),
                zombies: Vec::new(),
            }),
            pending: AtomicU32::new(0),
            intr_nesting: AtomicU32::new(0),
            ipiq: SpinNoIrq::new(IpiQueue::default()),
            systimers: SpinNoIrq::new(SysTimerQueue::for_cpu(id)),
            counters: SchedCounters::default(),
            ticks: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            registry: Registry::new(config.registry_slots),
            hardclock: LazyInit::new(),
            free_cache_limit: config.free_cache,
            quantum_ticks: config.quantum_ticks,
        }
    }

    /// Logical CPU number.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The idle unit, which runs when the run queue is empty.
    pub fn idle(&self) -> &UnitRef {
        &self.idle
    }

    /// The unit this CPU is running.
    pub fn current(&self) -> UnitRef {
        self.sched.lock().current.clone()
    }

    /// Whether the caller runs on this CPU.
    pub fn is_local(&self) -> bool {
        current_cpu_id() == Some(self.id)
    }

    #[track_caller]
    pub(crate) fn assert_local(&self) {
        assert!(
            self.is_local(),
            "cpu{} state touched from {:?}",
            self.id,
            current_cpu_id()
        );
    }

    /// Puts a runnable unit owned by this CPU at the tail of its bucket.
    ///
    /// # Panics
    ///
    /// Panics when called from another CPU, for a unit owned elsewhere, or for
    /// a unit that is not runnable.
    pub fn enqueue(&self, unit: UnitRef) {
        self.assert_local();
        let mut st = self.sched.lock();
        self.enqueue_locked(&mut st, unit);
    }

    pub(crate) fn enqueue_locked(&self, st: &mut SchedState, unit: UnitRef) {
        assert_eq!(
            unit.owning_cpu(),
            self.id,
            "unit {} queued on a cpu that does not own it",
            unit.id()
        );
        assert_eq!(unit.state(), UnitState::Runnable, "queueing unit {}", unit.id());
        if unit.priority() > st.current.priority() {
            self.pending
                .fetch_or(PendingFlags::RESCHED.bits(), Ordering::AcqRel);
        }
        st.run_queue.enqueue(unit);
        self.sync_counters(st);
    }

    /// Removes a queued unit that has not run yet.
    pub fn dequeue(&self, unit: &UnitRef) -> bool {
        self.assert_local();
        let mut st = self.sched.lock();
        let found = st.run_queue.remove(unit);
        self.sync_counters(&st);
        found
    }

    /// Pops the next unit to run, or the idle unit if nothing is queued.
    pub fn pick_next(&self) -> UnitRef {
        self.assert_local();
        let mut st = self.sched.lock();
        self.pick_next_locked(&mut st)
    }

    pub(crate) fn pick_next_locked(&self, st: &mut SchedState) -> UnitRef {
        let next = st.run_queue.pick_next();
        self.sync_counters(st);
        next.unwrap_or_else(|| self.idle.clone())
    }

    /// Changes the priority of a unit owned by this CPU, re-queueing it if
    /// it is waiting to run.
    pub(crate) fn reprioritize(&self, unit: &UnitRef, priority: u8) {
        self.assert_local();
        let mut st = self.sched.lock();
        if st.run_queue.remove(unit) {
            unit.set_priority_raw(priority);
            self.enqueue_locked(&mut st, unit.clone());
        } else {
            unit.set_priority_raw(priority);
            let top = st.run_queue.highest_priority();
            if Arc::ptr_eq(&st.current, unit) && top.is_some_and(|p| p > priority) {
                self.pending
                    .fetch_or(PendingFlags::RESCHED.bits(), Ordering::AcqRel);
            }
        }
    }

    fn sync_counters(&self, st: &SchedState) {
        self.counters
            .runq_depth
            .store(st.run_queue.len() as u32, Ordering::Relaxed);
        self.counters
            .queue_mask
            .store(st.run_queue.mask(), Ordering::Relaxed);
    }

    /// Posts `flags` to this CPU. Safe from any CPU.
    pub fn request_reschedule(&self, flags: PendingFlags) {
        self.pending.fetch_or(flags.bits(), Ordering::AcqRel);
        if !self.is_local() {
            self.kick();
        }
    }

    /// Consumes all pending flags. Owner only.
    pub fn take_pending(&self) -> PendingFlags {
        self.assert_local();
        PendingFlags::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn clear_pending(&self, flags: PendingFlags) {
        self.pending.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Flags posted and not yet consumed.
    pub fn pending(&self) -> PendingFlags {
        PendingFlags::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    /// Queues `msg` for this CPU and kicks it.
    pub fn send(&self, msg: IpiMsg) {
        trace!("ipi -> cpu{}: {:?}", self.id, msg);
        self.ipiq.lock().push(current_cpu_id(), msg);
        self.kick();
    }

    /// Wakes this CPU's idle loop.
    pub(crate) fn kick(&self) {
        self.idle.baton.kick();
    }

    /// Drains the inbound message queue in arrival order.
    pub fn process_ipiq(&self) -> usize {
        self.assert_local();
        let _intr = self.enter_interrupt();
        let mut handled = 0;
        loop {
            let Some(event) = self.ipiq.lock().pop_one() else {
                break;
            };
            trace!("cpu{}: ipi from {:?}: {:?}", self.id, event.src_cpu, event.msg);
            match event.msg {
                IpiMsg::Schedule(unit) => self.enqueue(unit),
                IpiMsg::Call(callback) => callback.call(),
            }
            handled += 1;
        }
        handled
    }

    /// Messages waiting for this CPU.
    pub fn ipiq_len(&self) -> usize {
        self.ipiq.lock().len()
    }

    pub(crate) fn enter_interrupt(&self) -> IntrGuard<'_> {
        self.intr_nesting.fetch_add(1, Ordering::AcqRel);
        IntrGuard(self)
    }

    /// Interrupt nesting depth; non-zero while servicing interrupt work.
    pub fn intr_depth(&self) -> u32 {
        self.intr_nesting.load(Ordering::Acquire)
    }

    /// Runs all interrupt-context work due on this CPU.
    pub(crate) fn service_interrupts(&self) {
        self.process_ipiq();
        self.systimer_intr(now_ns());
        self.reap();
    }

    /// Moves exited units into the free cache, dropping those the cache
    /// cannot take or that are still referenced elsewhere.
    fn reap(&self) {
        let zombies = {
            let mut st = self.sched.lock();
            if st.zombies.is_empty() {
                return;
            }
            core::mem::take(&mut st.zombies)
        };
        let mut dropped = Vec::new();
        {
            let mut st = self.sched.lock();
            for unit in zombies {
                if Arc::strong_count(&unit) == 1 && st.free_cache.len() < self.free_cache_limit {
                    st.free_cache.push(unit);
                } else {
                    dropped.push(unit);
                }
            }
        }
        drop(dropped);
        self.registry.sweep();
    }

    /// Takes a cached unit for reuse.
    pub(crate) fn take_cached(&self) -> Option<UnitRef> {
        self.assert_local();
        self.sched.lock().free_cache.pop()
    }

    /// Units parked in the free cache.
    pub fn free_cache_len(&self) -> usize {
        self.sched.lock().free_cache.len()
    }

    /// ABI-stable scheduler counters.
    pub fn counters(&self) -> &SchedCounters {
        &self.counters
    }

    /// Clock ticks seen by this CPU.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Context switches performed by this CPU.
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub(crate) fn count_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Earliest armed systimer on this CPU.
    pub fn next_deadline(&self) -> Option<u64> {
        self.next_timer_deadline()
    }

    fn start_hardclock(&self, hz: u32) {
        let id = self.id;
        let period = 1_000_000_000 / u64::from(hz);
        let timer = SysTimer::new(now_ns() + period, period, move |_| cpu(id).hardclock());
        self.systimers.lock().add(&timer);
        self.hardclock.init_once(timer);
    }

    /// Periodic clock interrupt body.
    fn hardclock(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut flags = PendingFlags::PROF_TICK;
        let (current, top, depth) = {
            let st = self.sched.lock();
            (
                st.current.clone(),
                st.run_queue.highest_priority(),
                st.run_queue.len() as u32,
            )
        };
        if !current.is_idle() {
            let used = current.charge_tick();
            if used >= self.quantum_ticks && top.is_some_and(|p| p >= current.priority()) {
                flags |= PendingFlags::RESCHED;
            }
        }
        self.pending.fetch_or(flags.bits(), Ordering::AcqRel);
        let _ = self
            .counters
            .load
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |load| {
                Some((load * 7 + depth * 100) / 8)
            });
    }
}

impl core::fmt::Debug for PerCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpu")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("counters", &self.counters.snapshot())
            .finish()
    }
}

pub(crate) struct CpuTable {
    pub config: KtaskConfig,
    cpus: Vec<PerCpu>,
}

static CPUS: LazyInit<CpuTable> = LazyInit::new();

/// Builds every CPU context and arms the clock interrupts.
pub(crate) fn init(config: KtaskConfig) {
    let cpus = (0..config.ncpus).map(|id| PerCpu::new(id, &config)).collect();
    CPUS.init_once(CpuTable { config, cpus });
    for cpu in &table().cpus {
        cpu.start_hardclock(config.hz);
    }
}

pub(crate) fn is_initialized() -> bool {
    CPUS.is_inited()
}

pub(crate) fn table() -> &'static CpuTable {
    match CPUS.get() {
        Some(table) => table,
        None => panic!("scheduler not initialized"),
    }
}

/// Number of logical CPUs.
pub fn ncpus() -> usize {
    table().cpus.len()
}

/// Context of CPU `id`.
///
/// # Panics
///
/// Panics if `id` is not a configured CPU.
pub fn cpu(id: usize) -> &'static PerCpu {
    match table().cpus.get(id) {
        Some(cpu) => cpu,
        None => panic!("cpu{id} does not exist"),
    }
}

/// CPU the calling unit runs on, or `None` outside any unit.
pub fn current_cpu_id() -> Option<usize> {
    crate::sched::with_current(|unit| unit.owning_cpu())
}

/// Context of the CPU the calling unit runs on.
///
/// # Panics
///
/// Panics outside a scheduling unit.
pub fn this_cpu() -> &'static PerCpu {
    match current_cpu_id() {
        Some(id) => cpu(id),
        None => panic!("not running on a scheduler cpu"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let c = SchedCounters::default();
        c.runq_depth.store(3, Ordering::Relaxed);
        c.queue_mask.store(1 << 5, Ordering::Relaxed);
        assert_eq!(
            c.snapshot(),
            CountersSnapshot {
                runq_depth: 3,
                active_units: 0,
                load: 0,
                queue_mask: 32,
            }
        );
    }

    #[test]
    fn pending_flags_are_distinct_bits() {
        let all = PendingFlags::all();
        assert_eq!(all.bits().count_ones(), 4);
        assert_eq!(PendingFlags::from_bits_truncate(0xff), all);
    }
}
