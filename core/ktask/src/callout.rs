//! Deferred callbacks.
//!
//! A [`Callout`] runs a closure a number of clock ticks in the future on the
//! CPU that armed it, optionally repeating. It is built on a systimer plus a
//! generation number: every `reset` or `stop` bumps the generation, and a
//! firing whose generation is stale does nothing.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use kspin::SpinNoIrq;

use crate::{
    IpiMsg, WaitQueue,
    percpu::{self, current_cpu_id},
    systimer::{SysTimer, SysTimerRef, systimer_del},
    time::{now_ns, ticks_to_ns},
};

bitflags! {
    /// Callout status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CalloutFlags: u32 {
        /// Armed by `reset` and not stopped or deactivated since.
        const ACTIVE = 1 << 0;
        /// A firing is queued.
        const PENDING = 1 << 1;
        /// The callback is executing.
        const RUNNING = 1 << 2;
        /// The callback needs no serialization with other callouts.
        const MPSAFE = 1 << 3;
        /// Somebody waits for the callback to finish.
        const WAITING = 1 << 4;
    }
}

type CalloutFn = dyn Fn() + Send + Sync;

struct CalloutState {
    generation: u64,
    cpu: Option<usize>,
    timer: Option<SysTimerRef>,
    expire_ticks: u64,
    period_ticks: u64,
    func: Option<Arc<CalloutFn>>,
}

struct CalloutInner {
    flags: AtomicU32,
    state: SpinNoIrq<CalloutState>,
    drain: WaitQueue,
}

/// A deferred, optionally periodic callback.
///
/// Dropping a callout stops it but does not wait for a running callback;
/// use [`stop_sync`](Self::stop_sync) before freeing anything the callback
/// touches.
pub struct Callout {
    inner: Arc<CalloutInner>,
}

impl Callout {
    /// Creates an idle callout.
    pub fn new() -> Self {
        Self::with_flags(CalloutFlags::empty())
    }

    /// Creates an idle callout marked `MPSAFE`.
    pub fn new_mpsafe() -> Self {
        Self::with_flags(CalloutFlags::MPSAFE)
    }

    fn with_flags(flags: CalloutFlags) -> Self {
        Self {
            inner: Arc::new(CalloutInner {
                flags: AtomicU32::new(flags.bits()),
                state: SpinNoIrq::new(CalloutState {
                    generation: 0,
                    cpu: None,
                    timer: None,
                    expire_ticks: 0,
                    period_ticks: 0,
                    func: None,
                }),
                drain: WaitQueue::new(),
            }),
        }
    }

    /// Current status bits.
    pub fn flags(&self) -> CalloutFlags {
        CalloutFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    /// Whether a firing is queued.
    pub fn pending(&self) -> bool {
        self.flags().contains(CalloutFlags::PENDING)
    }

    /// Whether the callout was armed and not stopped or deactivated since.
    pub fn active(&self) -> bool {
        self.flags().contains(CalloutFlags::ACTIVE)
    }

    /// Clears `ACTIVE` without touching a queued firing.
    pub fn deactivate(&self) {
        self.inner
            .flags
            .fetch_and(!CalloutFlags::ACTIVE.bits(), Ordering::AcqRel);
    }

    /// CPU the callout was last armed on.
    pub fn owning_cpu(&self) -> Option<usize> {
        self.inner.state.lock().cpu
    }

    /// Absolute expiration, in clock ticks of the owning CPU.
    pub fn expire_ticks(&self) -> u64 {
        self.inner.state.lock().expire_ticks
    }

    /// Arms the callout to run `func` once, `ticks` clock ticks from now.
    ///
    /// Any earlier arming is cancelled first. A zero delay is treated as one
    /// tick.
    pub fn reset<F>(&self, ticks: u64, func: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.arm(ticks, 0, Arc::new(func));
    }

    /// Arms the callout to run `func` after `ticks` clock ticks and then
    /// every `period` ticks, each firing `period` after the previous
    /// expiration.
    pub fn reset_periodic<F>(&self, ticks: u64, period: u64, func: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(period > 0, "periodic callout needs a non-zero period");
        self.arm(ticks, period, Arc::new(func));
    }

    fn arm(&self, ticks: u64, period: u64, func: Arc<CalloutFn>) {
        self.stop();
        let ticks = ticks.max(1);
        let cpu_id = current_cpu_id().unwrap_or(0);
        let cpu = percpu::cpu(cpu_id);
        let timer = {
            let mut st = self.inner.state.lock();
            st.generation += 1;
            let generation = st.generation;
            let weak = Arc::downgrade(&self.inner);
            let timer = SysTimer::new(
                now_ns() + ticks_to_ns(ticks),
                ticks_to_ns(period),
                move |_| dispatch(&weak, generation),
            );
            st.cpu = Some(cpu_id);
            st.timer = Some(timer.clone());
            st.expire_ticks = cpu.ticks() + ticks;
            st.period_ticks = period;
            st.func = Some(func);
            self.inner.flags.fetch_or(
                (CalloutFlags::ACTIVE | CalloutFlags::PENDING).bits(),
                Ordering::AcqRel,
            );
            timer
        };
        if cpu.is_local() {
            cpu.systimers.lock().arm(&timer);
        } else {
            cpu.send(IpiMsg::Call(
                (move || {
                    percpu::cpu(cpu_id).systimers.lock().arm(&timer);
                })
                .into(),
            ));
        }
    }

    /// Cancels a queued firing, returning whether one was queued.
    ///
    /// Does not wait for a callback that is already running.
    pub fn stop(&self) -> bool {
        let (timer, was_pending) = {
            let mut st = self.inner.state.lock();
            st.generation += 1;
            let old = self.inner.flags.fetch_and(
                !(CalloutFlags::ACTIVE | CalloutFlags::PENDING).bits(),
                Ordering::AcqRel,
            );
            (
                st.timer.take(),
                CalloutFlags::from_bits_truncate(old).contains(CalloutFlags::PENDING),
            )
        };
        if let Some(timer) = timer {
            systimer_del(&timer);
        }
        was_pending
    }

    /// Cancels a queued firing and waits until no callback is running.
    ///
    /// Afterwards the callback does not run again until the next `reset`.
    ///
    /// # Panics
    ///
    /// Panics if called from the callout's own callback.
    pub fn stop_sync(&self) -> bool {
        let was_pending = self.stop();
        self.wait_idle();
        was_pending
    }

    /// Same as [`stop_sync`](Self::stop_sync).
    pub fn drain(&self) -> bool {
        self.stop_sync()
    }

    fn wait_idle(&self) {
        if !self.flags().contains(CalloutFlags::RUNNING) {
            return;
        }
        let owner = self.inner.state.lock().cpu;
        if let Some(cpu) = owner.filter(|&c| current_cpu_id() == Some(c)) {
            assert_eq!(
                percpu::cpu(cpu).intr_depth(),
                0,
                "callout drained from its own callback"
            );
        }
        debug!("draining running callout on cpu{:?}", owner);
        self.inner
            .flags
            .fetch_or(CalloutFlags::WAITING.bits(), Ordering::AcqRel);
        self.inner
            .drain
            .wait_until(|| !self.flags().contains(CalloutFlags::RUNNING));
    }
}

impl Default for Callout {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Callout {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for Callout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callout")
            .field("flags", &self.flags())
            .field("cpu", &self.owning_cpu())
            .finish()
    }
}

fn dispatch(weak: &Weak<CalloutInner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let func = {
        let st = inner.state.lock();
        if st.generation != generation {
            return;
        }
        let mut set = CalloutFlags::RUNNING.bits();
        if st.period_ticks == 0 {
            inner
                .flags
                .fetch_and(!CalloutFlags::PENDING.bits(), Ordering::AcqRel);
        } else {
            set |= CalloutFlags::PENDING.bits();
        }
        inner.flags.fetch_or(set, Ordering::AcqRel);
        st.func.clone()
    };
    if let Some(func) = func {
        func();
    }
    {
        let mut st = inner.state.lock();
        if st.generation == generation && st.period_ticks != 0 {
            st.expire_ticks += st.period_ticks;
        }
    }
    let old = inner.flags.fetch_and(
        !(CalloutFlags::RUNNING | CalloutFlags::WAITING).bits(),
        Ordering::AcqRel,
    );
    if CalloutFlags::from_bits_truncate(old).contains(CalloutFlags::WAITING) {
        inner.drain.notify_all();
    }
}
