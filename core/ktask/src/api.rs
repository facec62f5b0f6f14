//! Task APIs for multi-task configuration.

use alloc::{
    string::{String, ToString},
    sync::Arc,
};
use core::sync::atomic::Ordering;
use std::{panic, thread};

use kerrno::{KResult, ensure, k_err};
use kspin::{SpinNoIrq, SpinRaw};

pub use crate::{
    callout::{Callout, CalloutFlags},
    crit::{CritSection, crit_enter},
    ipi::{Callback, IpiMsg, run_on_cpu, run_on_each_cpu},
    percpu::{
        CountersSnapshot, IntrGuard, PendingFlags, PerCpu, SchedCounters, cpu, current_cpu_id,
        ncpus, this_cpu,
    },
    registry::all_units,
    run_queue::RunQueue,
    sched::{
        Waiter, block_current, current, current_id, migrate_self, preempt_point, set_priority,
        signal, sleep, sleep_interlock, sleep_until, try_current, wakeup, yield_now,
    },
    systimer::{
        SysTimer, SysTimerQueue, SysTimerRef, systimer_add, systimer_del, systimer_init_oneshot,
        systimer_init_periodic,
    },
    unit::{AffinityMask, Unit, UnitRef, UnitState, WeakUnitRef},
    wait_queue::WaitQueue,
};
use crate::{
    config::{KtaskConfig, PRIO_NORMAL, PRIORITY_LEVELS},
    host, percpu, sched,
};

static INIT_LOCK: SpinRaw<()> = SpinRaw::new(());

/// Initializes the scheduler with the default configuration.
///
/// Later calls do nothing.
pub fn init_scheduler() {
    if let Err(e) = init_scheduler_with(KtaskConfig::default()) {
        panic!("default scheduler configuration rejected: {e:?}");
    }
}

/// Initializes the scheduler: builds every CPU context, arms the clock
/// interrupts and starts the idle loops.
///
/// Fails with `InvalidInput` if `config` is unusable. Once the scheduler is
/// up, later calls do nothing.
pub fn init_scheduler_with(config: KtaskConfig) -> KResult {
    config.validate()?;
    let _guard = INIT_LOCK.lock();
    if percpu::is_initialized() {
        return Ok(());
    }
    host::init_clock();
    percpu::init(config);
    for id in 0..config.ncpus {
        let idle = percpu::cpu(id).idle();
        host::start_thread(idle.name(), idle, move || sched::idle_loop(id));
    }
    info!(
        "scheduler up: {} cpus, hz {}, free cache {}",
        config.ncpus, config.hz, config.free_cache
    );
    Ok(())
}

/// Whether [`init_scheduler`] has run.
pub fn is_initialized() -> bool {
    percpu::is_initialized()
}

struct ExitSlot<T> {
    result: SpinNoIrq<Option<thread::Result<T>>>,
    done: WaitQueue,
}

/// An owned permission to join on a unit.
///
/// Dropping the handle detaches the unit.
pub struct JoinHandle<T> {
    unit: WeakUnitRef,
    id: u64,
    slot: Arc<ExitSlot<T>>,
}

impl<T> JoinHandle<T> {
    /// Id of the unit.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The unit, while it has not exited.
    pub fn unit(&self) -> Option<UnitRef> {
        self.unit
            .upgrade()
            .filter(|u| u.id() == self.id && u.state() != UnitState::Dead)
    }

    /// Whether the unit body has returned.
    pub fn is_finished(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Waits for the unit to exit and returns its result.
    ///
    /// A panic in the unit is returned as `Err` with the panic payload.
    pub fn join(self) -> thread::Result<T> {
        self.slot.done.wait_until(|| self.slot.result.lock().is_some());
        match self.slot.result.lock().take() {
            Some(result) => result,
            None => unreachable!("unit {} joined twice", self.id),
        }
    }
}

/// Unit factory, which can be used in order to configure the properties of a
/// new unit.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: Option<String>,
    priority: u8,
    cpu: Option<usize>,
    affinity: Option<AffinityMask>,
}

impl UnitBuilder {
    /// Generates the base configuration for spawning a unit.
    pub fn new() -> Self {
        Self {
            name: None,
            priority: PRIO_NORMAL,
            cpu: None,
            affinity: None,
        }
    }

    /// Names the unit.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the scheduling priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the CPU the unit starts on. Defaults to the calling CPU, or to
    /// CPU 0 off the scheduler.
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Restricts the CPUs the unit may migrate to.
    pub fn affinity(mut self, affinity: AffinityMask) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Spawns a new unit running `f`.
    ///
    /// Fails with `InvalidInput` for an unknown CPU, an out-of-range
    /// priority, or a start CPU outside the affinity.
    pub fn spawn<F, T>(self, f: F) -> KResult<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        ensure!(
            (self.priority as usize) < PRIORITY_LEVELS,
            k_err!(InvalidInput, "priority out of range")
        );
        let cpu_id = self.cpu.or_else(current_cpu_id).unwrap_or(0);
        ensure!(cpu_id < ncpus(), k_err!(InvalidInput, "no such cpu"));
        let affinity = self.affinity.unwrap_or_else(AffinityMask::full);
        ensure!(
            affinity.get(cpu_id),
            k_err!(InvalidInput, "start cpu outside affinity")
        );

        let name = self.name.unwrap_or_else(|| "unit".to_string());
        let unit = alloc_unit(name, self.priority, cpu_id, affinity);
        let slot = Arc::new(ExitSlot {
            result: SpinNoIrq::new(None),
            done: WaitQueue::new(),
        });
        let handle = JoinHandle {
            unit: Arc::downgrade(&unit),
            id: unit.id(),
            slot: slot.clone(),
        };

        let body_unit = unit.clone();
        let thread_name = alloc::format!("{}#{}", unit.name(), unit.id());
        host::start_thread(thread_name, &unit, move || {
            sched::set_current(Some(body_unit.clone()));
            body_unit.baton.wait();
            let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
            if result.is_err() {
                warn!("unit {} panicked", body_unit.id());
            }
            *slot.result.lock() = Some(result);
            slot.done.notify_all();
            sched::exit_current(body_unit);
        });

        let cpu = percpu::cpu(cpu_id);
        cpu.counters().active_units.fetch_add(1, Ordering::Relaxed);
        debug!("spawned unit {} ({}) on cpu{}", unit.id(), unit.name(), cpu_id);
        sched::schedule(unit);
        Ok(handle)
    }
}

impl Default for UnitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Takes storage from the local free cache when spawning on the calling CPU,
/// otherwise allocates a fresh unit.
fn alloc_unit(name: String, priority: u8, cpu_id: usize, affinity: AffinityMask) -> UnitRef {
    let cpu = percpu::cpu(cpu_id);
    if let Some(unit) = cpu.is_local().then(|| cpu.take_cached()).flatten() {
        unit.recycle(name, priority, cpu_id, affinity);
        return unit;
    }
    let unit = Unit::new(name, priority, cpu_id, affinity);
    cpu.registry.insert(&unit);
    unit
}

/// Spawns a new unit on the calling CPU with the default parameters.
///
/// # Panics
///
/// Panics if the scheduler is not initialized.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match UnitBuilder::new().spawn(f) {
        Ok(handle) => handle,
        Err(e) => panic!("spawn failed: {e:?}"),
    }
}

/// Spawns a new unit on `cpu`.
pub fn spawn_on<F, T>(cpu: usize, f: F) -> KResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    UnitBuilder::new().cpu(cpu).spawn(f)
}
