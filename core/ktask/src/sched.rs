//! Context switching, blocking and wakeups.

use alloc::sync::Arc;
use core::{
    cell::{Cell, RefCell},
    mem,
    time::Duration,
};
use std::thread::Thread;

use kerrno::{KError, KResult, ensure, k_err};

use crate::{
    IpiMsg, UnitRef, UnitState,
    config::PRIORITY_LEVELS,
    host,
    percpu::{self, PendingFlags, cpu},
    systimer::{SysTimer, systimer_del},
    time::{deadline_after, now_ns},
    unit::WakeReason,
};

std::thread_local! {
    static CURRENT: RefCell<Option<UnitRef>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(unit: Option<UnitRef>) {
    let old = CURRENT.with(|c| c.replace(unit));
    drop(old);
}

/// Runs `f` on the calling unit without cloning its handle.
pub(crate) fn with_current<R>(f: impl FnOnce(&UnitRef) -> R) -> Option<R> {
    CURRENT
        .try_with(|c| c.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

/// The calling unit, or `None` on a thread the scheduler does not run.
pub fn try_current() -> Option<UnitRef> {
    with_current(Arc::clone)
}

/// The calling unit.
///
/// # Panics
///
/// Panics outside a scheduling unit.
pub fn current() -> UnitRef {
    match try_current() {
        Some(unit) => unit,
        None => panic!("not running in a scheduling unit"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchKind {
    Yield,
    Block,
    Exit,
    Migrate(usize),
}

/// Gives the CPU of `prev` to the next unit and resumes `prev` when it is
/// picked again.
pub(crate) fn switch(prev: UnitRef, kind: SwitchKind) {
    let cpu = cpu(prev.owning_cpu());
    assert_eq!(
        prev.crit_depth(),
        0,
        "unit {} switched inside a critical section",
        prev.id()
    );
    assert_eq!(cpu.intr_depth(), 0, "switch from interrupt context");
    cpu.service_interrupts();

    let next = {
        let mut st = cpu.sched.lock();
        assert!(
            Arc::ptr_eq(&st.current, &prev),
            "cpu{} switching away from a unit it is not running",
            cpu.id()
        );
        match kind {
            SwitchKind::Yield => {
                prev.set_state(UnitState::Runnable);
                // idle is never queued; it is the fallback of pick_next
                if !prev.is_idle() {
                    cpu.enqueue_locked(&mut st, prev.clone());
                }
            }
            SwitchKind::Exit => st.zombies.push(prev.clone()),
            SwitchKind::Migrate(_) => prev.set_state(UnitState::Runnable),
            SwitchKind::Block => {}
        }
        cpu.clear_pending(PendingFlags::RESCHED);
        let next = cpu.pick_next_locked(&mut st);
        if Arc::ptr_eq(&next, &prev) {
            prev.set_state(UnitState::Running);
            return;
        }
        next.set_state(UnitState::Running);
        next.new_slice();
        st.current = next.clone();
        switch_trace!(
            "cpu{}: runq depth {} mask {:#x}",
            cpu.id(),
            st.run_queue.len(),
            st.run_queue.mask()
        );
        next
    };
    cpu.count_switch();
    trace!(
        "cpu{}: switch {} -> {} ({:?})",
        cpu.id(),
        prev.id(),
        next.id(),
        kind
    );

    prev.baton.release();
    match kind {
        SwitchKind::Exit => {
            set_current(None);
            drop(prev);
            next.baton.resume();
        }
        SwitchKind::Migrate(target) => {
            prev.set_owning_cpu(target);
            next.baton.resume();
            drop(next);
            percpu::cpu(target).send(IpiMsg::Schedule(prev.clone()));
            prev.baton.wait();
        }
        SwitchKind::Yield | SwitchKind::Block => {
            next.baton.resume();
            // a suspended unit must not pin the one it handed over to
            drop(next);
            prev.baton.wait();
        }
    }
}

/// Arms the wakeup interlock.
///
/// Any wakeup delivered to the calling unit from now on makes the next
/// [`block_current`] return immediately, so a caller may check its wait
/// condition between the two calls without losing a wakeup.
///
/// Off the scheduler this does nothing: the host thread's park token plays the
/// same role.
pub fn sleep_interlock() {
    with_current(|unit| unit.wake.lock().token = false);
}

/// Suspends the calling unit until it is woken, `deadline_ns` passes, or (if
/// `interruptible`) it is signalled.
///
/// Returns `WouldBlock` on timeout and `Interrupted` on a signal. Off the
/// scheduler the host thread parks instead and may return spuriously.
///
/// # Panics
///
/// Panics inside a critical section or in interrupt context.
pub fn block_current(deadline_ns: Option<u64>, interruptible: bool) -> KResult {
    let Some(unit) = try_current() else {
        return host::park_until(deadline_ns);
    };
    assert_eq!(
        unit.crit_depth(),
        0,
        "unit {} blocked inside a critical section",
        unit.id()
    );
    assert!(!unit.is_idle(), "idle unit cannot block");
    let cpu = cpu(unit.owning_cpu());
    assert_eq!(cpu.intr_depth(), 0, "blocking in interrupt context");

    {
        let mut w = unit.wake.lock();
        if interruptible && w.signal_pending {
            w.signal_pending = false;
            return Err(KError::Interrupted);
        }
        if w.token {
            w.token = false;
            w.reason = WakeReason::None;
            return Ok(());
        }
        w.reason = WakeReason::None;
        w.interruptible = interruptible;
        unit.set_state(UnitState::Blocked);
    }

    let timer = deadline_ns.map(|deadline| {
        let weak = Arc::downgrade(&unit);
        let id = unit.id();
        let timer = SysTimer::new(deadline, 0, move |_| {
            if let Some(unit) = weak.upgrade().filter(|u| u.id() == id) {
                let _ = wake_with(&unit, WakeReason::Timeout);
            }
        });
        cpu.systimers.lock().add(&timer);
        timer
    });

    switch(unit.clone(), SwitchKind::Block);

    if let Some(timer) = timer {
        systimer_del(&timer);
    }
    let mut w = unit.wake.lock();
    w.token = false;
    w.interruptible = false;
    match mem::replace(&mut w.reason, WakeReason::None) {
        WakeReason::Timeout => Err(KError::WouldBlock),
        WakeReason::Signal => {
            w.signal_pending = false;
            Err(KError::Interrupted)
        }
        WakeReason::None | WakeReason::Woken => Ok(()),
    }
}

pub(crate) fn wake_with(unit: &UnitRef, reason: WakeReason) -> KResult {
    let mut w = unit.wake.lock();
    let state = unit.state();
    if state == UnitState::Dead {
        drop(w);
        warn!("wakeup of exited unit {}", unit.id());
        return Err(KError::NoSuchProcess);
    }
    match reason {
        WakeReason::Signal => {
            w.signal_pending = true;
            if !(w.interruptible && state == UnitState::Blocked) {
                return Ok(());
            }
        }
        WakeReason::Timeout if state != UnitState::Blocked => return Ok(()),
        _ => {}
    }
    w.token = true;
    if w.reason == WakeReason::None {
        w.reason = reason;
    }
    let was_blocked = unit.transition(UnitState::Blocked, UnitState::Runnable);
    drop(w);
    if was_blocked {
        schedule(unit.clone());
    }
    Ok(())
}

/// Something blocked that can be woken from anywhere: a unit, or a host
/// thread the scheduler does not run.
#[derive(Debug, Clone)]
pub enum Waiter {
    Unit(UnitRef),
    Host { thread: Thread, id: u64 },
}

impl Waiter {
    /// The calling context.
    pub fn current() -> Self {
        match try_current() {
            Some(unit) => Self::Unit(unit),
            None => Self::Host {
                thread: std::thread::current(),
                id: current_id(),
            },
        }
    }

    /// Id of the waiting context, as returned by [`current_id`].
    pub fn id(&self) -> u64 {
        match self {
            Self::Unit(unit) => unit.id(),
            Self::Host { id, .. } => *id,
        }
    }

    /// Wakes the waiter. Fails with `NoSuchProcess` for an exited unit.
    pub fn wake(&self) -> KResult {
        match self {
            Self::Unit(unit) => wakeup(unit),
            Self::Host { thread, .. } => {
                thread.unpark();
                Ok(())
            }
        }
    }
}

std::thread_local! {
    static HOST_ID: Cell<u64> = const { Cell::new(0) };
}

/// Identity of the calling context: the unit id, or a stable id of the host
/// thread drawn from the same space. Never 0.
pub fn current_id() -> u64 {
    if let Some(id) = with_current(|unit| unit.id()) {
        return id;
    }
    HOST_ID.with(|id| {
        if id.get() == 0 {
            id.set(crate::unit::alloc_id());
        }
        id.get()
    })
}

/// Makes a runnable unit eligible to run on its owning CPU.
pub(crate) fn schedule(unit: UnitRef) {
    let target = cpu(unit.owning_cpu());
    if target.is_local() {
        target.enqueue(unit);
    } else {
        target.send(IpiMsg::Schedule(unit));
    }
}

/// Wakes `unit` if it is blocked, or makes its next block return at once.
///
/// Fails with `NoSuchProcess` if the unit has exited.
pub fn wakeup(unit: &UnitRef) -> KResult {
    wake_with(unit, WakeReason::Woken)
}

/// Interrupts an interruptible wait of `unit`, or marks a signal pending for
/// its next one.
pub fn signal(unit: &UnitRef) -> KResult {
    let res = wake_with(unit, WakeReason::Signal);
    if res.is_ok() {
        cpu(unit.owning_cpu()).request_reschedule(PendingFlags::SIGNAL);
    }
    res
}

/// Voluntarily gives up the CPU to queued units of equal or higher priority.
///
/// Outside a unit this yields the host thread.
pub fn yield_now() {
    match try_current() {
        Some(unit) => switch(unit, SwitchKind::Yield),
        None => std::thread::yield_now(),
    }
}

/// Explicit preemption point.
///
/// Services pending interrupt work and switches away if a reschedule was
/// requested. Does nothing inside a critical section or interrupt context.
pub fn preempt_point() {
    let Some(unit) = try_current() else {
        return;
    };
    if unit.crit_depth() > 0 {
        return;
    }
    let cpu = cpu(unit.owning_cpu());
    if cpu.intr_depth() > 0 {
        return;
    }
    cpu.service_interrupts();
    if cpu.take_pending().contains(PendingFlags::RESCHED) {
        switch(unit, SwitchKind::Yield);
    }
}

/// Marks the calling unit dead and switches away for good.
pub(crate) fn exit_current(unit: UnitRef) {
    unit.crit_reset();
    {
        let _w = unit.wake.lock();
        unit.set_state(UnitState::Dead);
    }
    let cpu = cpu(unit.owning_cpu());
    cpu.counters()
        .active_units
        .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
    debug!("unit {} ({}) exited on cpu{}", unit.id(), unit.name(), cpu.id());
    switch(unit, SwitchKind::Exit);
}

/// Moves the calling unit to `target`.
///
/// The unit leaves its CPU at once and resumes on `target`. Fails with
/// `InvalidInput` if `target` does not exist or is outside the unit's
/// affinity.
pub fn migrate_self(target: usize) -> KResult {
    ensure!(target < percpu::ncpus(), k_err!(InvalidInput, "no such cpu"));
    let unit = current();
    ensure!(!unit.is_idle(), k_err!(InvalidInput, "idle unit cannot migrate"));
    ensure!(
        unit.affinity().get(target),
        k_err!(InvalidInput, "target cpu outside affinity")
    );
    let src = unit.owning_cpu();
    if src == target {
        return Ok(());
    }
    debug!("unit {} migrating cpu{} -> cpu{}", unit.id(), src, target);
    cpu(src)
        .counters()
        .active_units
        .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
    cpu(target)
        .counters()
        .active_units
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    switch(unit, SwitchKind::Migrate(target));
    Ok(())
}

/// Changes the priority of `unit`.
///
/// The owning CPU applies the change, so a remote call takes effect at that
/// CPU's next interrupt point.
pub fn set_priority(unit: &UnitRef, priority: u8) -> KResult {
    ensure!(
        (priority as usize) < PRIORITY_LEVELS,
        k_err!(InvalidInput, "priority out of range")
    );
    ensure!(!unit.is_idle(), k_err!(InvalidInput, "idle priority is fixed"));
    ensure!(unit.state() != UnitState::Dead, k_err!(NoSuchProcess));
    let owner = cpu(unit.owning_cpu());
    if owner.is_local() {
        owner.reprioritize(unit, priority);
    } else {
        let unit = unit.clone();
        owner.send(IpiMsg::Call(
            (move || {
                let owner = cpu(unit.owning_cpu());
                if owner.is_local() {
                    owner.reprioritize(&unit, priority);
                } else {
                    let _ = set_priority(&unit, priority);
                }
            })
            .into(),
        ));
    }
    Ok(())
}

/// Suspends the calling unit for at least `dur`.
pub fn sleep(dur: Duration) {
    if try_current().is_none() {
        std::thread::sleep(dur);
        return;
    }
    sleep_until(deadline_after(dur));
}

/// Suspends the calling unit until the system clock reaches `deadline_ns`.
pub fn sleep_until(deadline_ns: u64) {
    while now_ns() < deadline_ns {
        sleep_interlock();
        if block_current(Some(deadline_ns), false) == Err(KError::WouldBlock) {
            break;
        }
    }
}

/// Body of a CPU's idle host thread.
pub(crate) fn idle_loop(cpu_id: usize) -> ! {
    let cpu = cpu(cpu_id);
    let idle = cpu.idle().clone();
    set_current(Some(idle.clone()));
    idle.baton.wait();
    loop {
        switch(idle.clone(), SwitchKind::Yield);
        if cpu.counters().runq_depth.load(core::sync::atomic::Ordering::Relaxed) == 0
            && cpu.ipiq_len() == 0
        {
            host::idle_park(now_ns(), cpu.next_deadline());
        }
    }
}
