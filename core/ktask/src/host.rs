//! Host execution backend.
//!
//! Every unit is carried by a host thread that only executes while it holds
//! its CPU's baton. `switch` hands the baton from one unit to the next, so
//! each logical CPU runs exactly one unit at a time and a suspended unit's
//! host stack is its saved continuation.

use alloc::string::String;
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    thread::{self, Thread},
    time::Instant,
};

use kspin::SpinRaw;
use lazyinit::LazyInit;

use crate::time::ClockSource;

/// Longest the idle loop sleeps without rechecking its inbound queue.
const IDLE_PARK_MAX: Duration = Duration::from_millis(10);

/// Ownership of a CPU for one unit.
pub(crate) struct Baton {
    on_cpu: AtomicBool,
    thread: SpinRaw<Option<Thread>>,
}

impl Baton {
    pub(crate) const fn new(on_cpu: bool) -> Self {
        Self {
            on_cpu: AtomicBool::new(on_cpu),
            thread: SpinRaw::new(None),
        }
    }

    pub(crate) fn bind(&self, thread: Thread) {
        *self.thread.lock() = Some(thread);
    }

    pub(crate) fn reset(&self) {
        self.on_cpu.store(false, Ordering::Release);
        *self.thread.lock() = None;
    }

    /// Gives the CPU up. The caller must not touch CPU state afterwards.
    pub(crate) fn release(&self) {
        self.on_cpu.store(false, Ordering::Release);
    }

    /// Hands the CPU to this unit's host thread.
    pub(crate) fn resume(&self) {
        self.on_cpu.store(true, Ordering::Release);
        self.kick();
    }

    /// Wakes the host thread without handing it the CPU.
    pub(crate) fn kick(&self) {
        if let Some(t) = self.thread.lock().as_ref() {
            t.unpark();
        }
    }

    /// Parks until the CPU is handed back.
    pub(crate) fn wait(&self) {
        while !self.on_cpu.load(Ordering::Acquire) {
            thread::park();
        }
    }
}

/// Monotonic clock backed by [`Instant`].
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    /// Starts a clock whose zero is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for HostClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

static CLOCK: LazyInit<HostClock> = LazyInit::new();

pub(crate) fn init_clock() {
    clock();
}

/// The process-wide host clock, started on first use.
pub(crate) fn clock() -> &'static HostClock {
    loop {
        if let Some(clock) = CLOCK.get() {
            return clock;
        }
        if let Some(clock) = CLOCK.call_once(HostClock::new) {
            return clock;
        }
        core::hint::spin_loop();
    }
}

/// Starts a host thread that waits for its baton before running `body`.
pub(crate) fn start_thread<F>(name: String, baton_owner: &crate::UnitRef, body: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let handle = match thread::Builder::new().name(name).spawn(body) {
        Ok(handle) => handle,
        Err(e) => panic!("cannot start host thread for unit {}: {e}", baton_owner.id()),
    };
    baton_owner.baton.bind(handle.thread().clone());
    handle
}

/// Parks a host thread the scheduler does not run, until unparked or until
/// `deadline_ns` passes.
pub(crate) fn park_until(deadline_ns: Option<u64>) -> kerrno::KResult {
    let Some(deadline) = deadline_ns else {
        thread::park();
        return Ok(());
    };
    let now = clock().now_ns();
    if now >= deadline {
        return Err(kerrno::KError::WouldBlock);
    }
    thread::park_timeout(Duration::from_nanos(deadline - now));
    if clock().now_ns() >= deadline {
        return Err(kerrno::KError::WouldBlock);
    }
    Ok(())
}

/// Parks an idle host thread until kicked or until `deadline_ns` nears.
pub(crate) fn idle_park(now_ns: u64, deadline_ns: Option<u64>) {
    let wait = match deadline_ns {
        Some(d) if d <= now_ns => return,
        Some(d) => Duration::from_nanos(d - now_ns).min(IDLE_PARK_MAX),
        None => IDLE_PARK_MAX,
    };
    thread::park_timeout(wait);
}
