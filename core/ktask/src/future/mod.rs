//! Future support.
//!
//! Suspends the calling unit on a future. This is a single-future adapter
//! used by wait queues and join, not an executor.

use alloc::{sync::Arc, task::Wake};
use core::{
    pin::pin,
    task::{Context, Poll, Waker},
};
use std::thread::{self, Thread};

use kerrno::{KError, KResult};

use crate::{UnitRef, WeakUnitRef, sched, time::now_ns};

struct KWaker {
    unit: WeakUnitRef,
    id: u64,
}

impl KWaker {
    fn new(unit: &UnitRef) -> Arc<Self> {
        Arc::new(KWaker {
            unit: Arc::downgrade(unit),
            id: unit.id(),
        })
    }
}

impl Wake for KWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // storage may have been recycled for another unit
        if let Some(unit) = self.unit.upgrade().filter(|u| u.id() == self.id) {
            let _ = sched::wakeup(&unit);
        }
    }
}

struct HostWaker(Thread);

impl Wake for HostWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

fn run<F: IntoFuture>(f: F, deadline_ns: Option<u64>, interruptible: bool) -> KResult<F::Output> {
    let mut fut = pin!(f.into_future());

    let Some(unit) = sched::try_current() else {
        let waker = Waker::from(Arc::new(HostWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            match deadline_ns {
                Some(deadline) => {
                    let now = now_ns();
                    if now >= deadline {
                        return Err(KError::WouldBlock);
                    }
                    thread::park_timeout(core::time::Duration::from_nanos(deadline - now));
                }
                None => thread::park(),
            }
        }
    };

    let waker = Waker::from(KWaker::new(&unit));
    let mut cx = Context::from_waker(&waker);
    loop {
        sched::sleep_interlock();
        if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
            return Ok(output);
        }
        sched::block_current(deadline_ns, interruptible)?;
    }
}

/// Blocks the calling unit until the given future is resolved.
///
/// Off the scheduler the host thread parks instead.
pub fn block_on<F: IntoFuture>(f: F) -> F::Output {
    match run(f, None, false) {
        Ok(output) => output,
        Err(e) => unreachable!("uninterruptible wait failed: {e:?}"),
    }
}

/// Like [`block_on`], but a signal ends the wait with `Interrupted`.
pub fn block_on_interruptible<F: IntoFuture>(f: F) -> KResult<F::Output> {
    run(f, None, true)
}

/// Like [`block_on`], but gives up with `WouldBlock` once the system clock
/// reaches `deadline_ns`.
pub fn block_on_timeout<F: IntoFuture>(
    f: F,
    deadline_ns: u64,
    interruptible: bool,
) -> KResult<F::Output> {
    run(f, Some(deadline_ns), interruptible)
}
