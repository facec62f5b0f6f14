//! Per-CPU systimers.
//!
//! A systimer is a callback armed at an absolute nanosecond time on exactly
//! one CPU's queue. The clock interrupt pops every due node, runs it, and
//! puts periodic nodes back at `old_time + period`, so a periodic timer never
//! accumulates drift from late servicing.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use kspin::SpinNoIrq;

use crate::{ipi::IpiMsg, percpu, time::now_ns};

/// Shared handle to a [`SysTimer`].
pub type SysTimerRef = Arc<SysTimer>;

type SysTimerFn = dyn Fn(u64) + Send + Sync;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

const DETACHED: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct QueueSlot {
    cpu: usize,
    key: (u64, u64),
}

struct SysTimerState {
    time: u64,
    periodic: u64,
    queued: Option<QueueSlot>,
    running: bool,
    cancelled: bool,
}

/// A deadline callback.
///
/// The callback receives the time the firing was scheduled for, not the time
/// it actually ran.
pub struct SysTimer {
    state: SpinNoIrq<SysTimerState>,
    func: Box<SysTimerFn>,
}

impl SysTimer {
    /// Creates an unarmed timer due at `time`, repeating every `periodic`
    /// nanoseconds if non-zero.
    pub fn new<F>(time: u64, periodic: u64, func: F) -> SysTimerRef
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: SpinNoIrq::new(SysTimerState {
                time,
                periodic,
                queued: None,
                running: false,
                cancelled: false,
            }),
            func: Box::new(func),
        })
    }

    /// Absolute expiration time.
    pub fn time(&self) -> u64 {
        self.state.lock().time
    }

    /// Moves the expiration. Only valid while the timer is not queued.
    pub fn set_time(&self, time: u64) {
        let mut st = self.state.lock();
        assert!(st.queued.is_none(), "re-timing a queued systimer");
        st.time = time;
    }

    /// Period in nanoseconds, 0 for one-shot.
    pub fn periodic(&self) -> u64 {
        self.state.lock().periodic
    }

    /// Whether the timer sits on some queue.
    pub fn is_queued(&self) -> bool {
        self.state.lock().queued.is_some()
    }

    /// Whether the callback is executing right now.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// CPU whose queue holds the timer, if any.
    pub fn queued_cpu(&self) -> Option<usize> {
        self.state
            .lock()
            .queued
            .map(|slot| slot.cpu)
            .filter(|&cpu| cpu != DETACHED)
    }
}

/// Armed timers of one CPU, ordered by expiration.
pub struct SysTimerQueue {
    cpu: usize,
    nodes: BTreeMap<(u64, u64), SysTimerRef>,
}

impl SysTimerQueue {
    /// Creates a queue that belongs to no CPU.
    pub fn new() -> Self {
        Self::for_cpu(DETACHED)
    }

    pub(crate) fn for_cpu(cpu: usize) -> Self {
        Self {
            cpu,
            nodes: BTreeMap::new(),
        }
    }

    /// Arms `timer` at its current expiration time.
    ///
    /// # Panics
    ///
    /// Panics if the timer is queued on a different CPU.
    pub fn add(&mut self, timer: &SysTimerRef) {
        let mut st = timer.state.lock();
        st.cancelled = false;
        self.insert_locked(&mut st, timer);
    }

    /// Arms `timer` unless it was deleted after it was created or last
    /// armed. Returns whether it was armed.
    pub(crate) fn arm(&mut self, timer: &SysTimerRef) -> bool {
        let mut st = timer.state.lock();
        if st.cancelled {
            return false;
        }
        self.insert_locked(&mut st, timer);
        true
    }

    fn insert_locked(&mut self, st: &mut SysTimerState, timer: &SysTimerRef) {
        if let Some(slot) = st.queued.take() {
            assert_eq!(slot.cpu, self.cpu, "systimer armed on another cpu");
            self.nodes.remove(&slot.key);
        }
        let key = (st.time, NEXT_SEQ.fetch_add(1, Ordering::Relaxed));
        st.queued = Some(QueueSlot { cpu: self.cpu, key });
        self.nodes.insert(key, timer.clone());
    }

    /// Disarms `timer`, returning whether it was queued.
    ///
    /// A periodic timer whose callback is running is not re-armed afterwards.
    pub fn del(&mut self, timer: &SysTimerRef) -> bool {
        let mut st = timer.state.lock();
        st.cancelled = true;
        match st.queued.take() {
            Some(slot) => {
                assert_eq!(slot.cpu, self.cpu, "systimer armed on another cpu");
                self.nodes.remove(&slot.key);
                true
            }
            None => false,
        }
    }

    /// Earliest expiration time.
    pub fn next_deadline(&self) -> Option<u64> {
        self.nodes.keys().next().map(|&(time, _)| time)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Detaches the earliest timer due at or before `now` and marks it running.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<(SysTimerRef, u64)> {
        let (&key, _) = self.nodes.first_key_value()?;
        if key.0 > now {
            return None;
        }
        let timer = self.nodes.remove(&key)?;
        let time = {
            let mut st = timer.state.lock();
            st.queued = None;
            st.running = true;
            st.time
        };
        Some((timer, time))
    }

    /// Completes a firing: re-arms a periodic timer at `old + period`.
    pub(crate) fn finish(&mut self, timer: &SysTimerRef) {
        let rearm = {
            let mut st = timer.state.lock();
            st.running = false;
            let rearm = st.periodic != 0 && !st.cancelled && st.queued.is_none();
            if rearm {
                st.time += st.periodic;
            }
            rearm
        };
        if rearm {
            self.arm(timer);
        }
    }

    /// Fires every timer due at or before `now`, returning how many ran.
    ///
    /// Periodic timers that fell several periods behind fire once per missed
    /// period, each with its own scheduled time.
    pub fn run_due(&mut self, now: u64) -> usize {
        let mut fired = 0;
        while let Some((timer, time)) = self.pop_due(now) {
            (timer.func)(time);
            self.finish(&timer);
            fired += 1;
        }
        fired
    }
}

impl Default for SysTimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl percpu::PerCpu {
    /// Clock interrupt: fires every due systimer on this CPU.
    ///
    /// Callbacks run without the queue lock held, so they may add or delete
    /// timers, including themselves.
    pub fn systimer_intr(&self, now: u64) -> usize {
        self.assert_local();
        let _intr = self.enter_interrupt();
        let mut fired = 0;
        loop {
            let Some((timer, time)) = self.systimers.lock().pop_due(now) else {
                break;
            };
            trace!("cpu{}: systimer due {} at {}", self.id(), time, now);
            (timer.func)(time);
            self.systimers.lock().finish(&timer);
            fired += 1;
        }
        fired
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<u64> {
        self.systimers.lock().next_deadline()
    }
}

/// Arms `timer` on the calling CPU at its expiration time.
pub fn systimer_add(timer: &SysTimerRef) {
    let cpu = percpu::this_cpu();
    if let Some(owner) = timer.queued_cpu() {
        assert_eq!(owner, cpu.id(), "systimer armed on another cpu");
    }
    cpu.systimers.lock().add(timer);
    cpu.kick();
}

/// Disarms `timer`.
///
/// On its owning CPU the node is removed immediately and the return value
/// says whether it was queued. From anywhere else the removal is sent to the
/// owner as a message and the return value is whether it was queued when the
/// message was sent.
pub fn systimer_del(timer: &SysTimerRef) -> bool {
    let owner = {
        let mut st = timer.state.lock();
        match st.queued {
            Some(slot) if slot.cpu != DETACHED => slot.cpu,
            _ => {
                st.cancelled = true;
                return false;
            }
        }
    };
    if percpu::current_cpu_id() == Some(owner) {
        percpu::cpu(owner).systimers.lock().del(timer)
    } else {
        let timer = timer.clone();
        percpu::cpu(owner).send(IpiMsg::Call(
            (move || {
                percpu::cpu(owner).systimers.lock().del(&timer);
            })
            .into(),
        ));
        true
    }
}

/// Creates and arms a timer on the calling CPU firing `hz` times a second,
/// first one period from now.
pub fn systimer_init_periodic<F>(hz: u32, func: F) -> SysTimerRef
where
    F: Fn(u64) + Send + Sync + 'static,
{
    assert!(hz > 0, "periodic systimer needs a non-zero frequency");
    let period = 1_000_000_000 / u64::from(hz);
    let timer = SysTimer::new(now_ns() + period, period, func);
    systimer_add(&timer);
    timer
}

/// Creates and arms a one-shot timer on the calling CPU, `delay` from now.
pub fn systimer_init_oneshot<F>(delay: Duration, func: F) -> SysTimerRef
where
    F: Fn(u64) + Send + Sync + 'static,
{
    let timer = SysTimer::new(crate::time::deadline_after(delay), 0, func);
    systimer_add(&timer);
    timer
}
