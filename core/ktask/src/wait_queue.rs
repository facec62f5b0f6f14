use core::sync::atomic::{AtomicU64, Ordering};

use event_listener::{Event, listener};
use kerrno::KResult;

use crate::future::{block_on, block_on_interruptible, block_on_timeout};

/// A generation-counted wait queue.
///
/// A waiter records [`generation`](Self::generation), re-checks its condition,
/// then [`block`](Self::block)s. A [`signal`](Self::signal) that happened after
/// the recorded generation makes the block return at once, so the re-check
/// cannot race with the signal.
pub struct WaitQueue {
    generation: AtomicU64,
    event: Event,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            event: Event::new(),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Blocks until the generation moves past `*generation`, then stores the
    /// new generation there.
    pub fn block(&self, generation: &mut u64) {
        loop {
            listener!(self.event => listener);
            let now = self.generation();
            if now != *generation {
                *generation = now;
                return;
            }
            block_on(listener);
        }
    }

    /// Like [`block`](Self::block), but gives up with `Interrupted` on a
    /// signal and with `WouldBlock` once `deadline_ns` passes.
    pub fn block_until(
        &self,
        generation: &mut u64,
        deadline_ns: Option<u64>,
        interruptible: bool,
    ) -> KResult {
        loop {
            listener!(self.event => listener);
            let now = self.generation();
            if now != *generation {
                *generation = now;
                return Ok(());
            }
            match (deadline_ns, interruptible) {
                (Some(deadline), _) => block_on_timeout(listener, deadline, interruptible)?,
                (None, true) => block_on_interruptible(listener)?,
                (None, false) => block_on(listener),
            }
        }
    }

    /// Bumps the generation and wakes up to `n` waiters.
    pub fn signal(&self, n: usize) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.event.notify(n);
    }

    /// Bumps the generation and wakes every waiter.
    pub fn notify_all(&self) {
        self.signal(usize::MAX);
    }

    /// Blocks until `condition` holds. It is re-evaluated after every signal.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut condition: F) {
        let mut generation = self.generation();
        while !condition() {
            self.block(&mut generation);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
