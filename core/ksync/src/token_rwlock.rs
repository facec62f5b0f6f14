//! A recursive exclusive / counting shared lock on a generation wait queue.

use core::time::Duration;

use kerrno::{KError, KResult};
use kspin::{SpinNoIrq, SpinNoIrqGuard};
use ktask::{WaitQueue, current_id, deadline_after};

#[derive(Debug, Default)]
struct TokenState {
    /// Exclusive holder, 0 when not held exclusively
    owner: u64,
    /// Exclusive recursion depth, or the number of shared holders
    count: u32,
    /// Contexts waiting for the lock
    pending: u32,
}

impl TokenState {
    fn try_exclusive(&mut self, me: u64) -> bool {
        if self.owner == me {
            self.count += 1;
            true
        } else if self.owner == 0 && self.count == 0 {
            self.owner = me;
            self.count = 1;
            true
        } else {
            false
        }
    }

    fn try_shared(&mut self) -> bool {
        if self.owner == 0 {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// A reader-writer lock in the style of the classic token locks.
///
/// The exclusive side is recursive for its owner. A release that frees the
/// lock wakes a single waiter; woken waiters re-check the lock and go back to
/// sleep if somebody else got there first. A waiter that gets a shared hold
/// wakes the next one in turn.
pub struct TokenRwLock {
    state: SpinNoIrq<TokenState>,
    wait: WaitQueue,
}

impl TokenRwLock {
    /// Creates a free lock.
    pub const fn new() -> Self {
        Self {
            state: SpinNoIrq::new(TokenState {
                owner: 0,
                count: 0,
                pending: 0,
            }),
            wait: WaitQueue::new(),
        }
    }

    fn acquire(
        &self,
        shared: bool,
        take: impl Fn(&mut TokenState, u64) -> bool,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> KResult {
        let me = current_id();
        let deadline = timeout.map(deadline_after);
        let mut state = self.state.lock();
        loop {
            if take(&mut state, me) {
                // shared holds are compatible: pass the wakeup on
                if shared {
                    self.release_one(state);
                }
                return Ok(());
            }
            state.pending += 1;
            let mut generation = self.wait.generation();
            drop(state);
            let res = self.wait.block_until(&mut generation, deadline, interruptible);
            state = self.state.lock();
            state.pending -= 1;
            if let Err(e) = res {
                // the wakeup we may have taken belongs to the next waiter
                if state.owner == 0 {
                    self.release_one(state);
                }
                return Err(e);
            }
        }
    }

    /// Acquires the lock exclusively, recursively if the caller owns it.
    pub fn exclusive_lock(&self) {
        if let Err(e) = self.exclusive_lock_timeout(None, false) {
            panic!("uninterruptible token wait failed: {e:?}");
        }
    }

    /// Acquires a shared hold. Waits while the lock is held exclusively.
    pub fn shared_lock(&self) {
        if let Err(e) = self.shared_lock_timeout(None, false) {
            panic!("uninterruptible token wait failed: {e:?}");
        }
    }

    /// Like [`exclusive_lock`](Self::exclusive_lock), but gives up with
    /// `WouldBlock` after `timeout` and, if `interruptible`, with
    /// `Interrupted` when the waiting unit is signalled.
    pub fn exclusive_lock_timeout(
        &self,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> KResult {
        self.acquire(false, TokenState::try_exclusive, timeout, interruptible)
    }

    /// Shared counterpart of [`exclusive_lock_timeout`](Self::exclusive_lock_timeout).
    pub fn shared_lock_timeout(&self, timeout: Option<Duration>, interruptible: bool) -> KResult {
        self.acquire(true, |state, _| state.try_shared(), timeout, interruptible)
    }

    /// Acquires the lock exclusively if that is possible without waiting.
    pub fn try_exclusive_lock(&self) -> KResult {
        if self.state.lock().try_exclusive(current_id()) {
            Ok(())
        } else {
            Err(KError::WouldBlock)
        }
    }

    /// Acquires a shared hold if that is possible without waiting.
    pub fn try_shared_lock(&self) -> KResult {
        if self.state.lock().try_shared() {
            Ok(())
        } else {
            Err(KError::WouldBlock)
        }
    }

    /// Drops one exclusive hold.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the lock exclusively.
    pub fn exclusive_unlock(&self) {
        let me = current_id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, me, "exclusive unlock by non-owner");
        state.count -= 1;
        if state.count == 0 {
            state.owner = 0;
            self.release_one(state);
        }
    }

    /// Drops one shared hold.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held shared.
    pub fn shared_unlock(&self) {
        let mut state = self.state.lock();
        assert!(
            state.owner == 0 && state.count > 0,
            "shared unlock of a lock not held shared"
        );
        state.count -= 1;
        if state.count == 0 {
            self.release_one(state);
        }
    }

    fn release_one(&self, state: SpinNoIrqGuard<'_, TokenState>) {
        let pending = state.pending;
        drop(state);
        if pending > 0 {
            self.wait.signal(1);
        }
    }

    /// Whether the caller holds the lock exclusively.
    pub fn is_exclusively_held(&self) -> bool {
        self.state.lock().owner == current_id()
    }

    /// Whether the lock is held at all.
    pub fn is_locked(&self) -> bool {
        self.state.lock().count > 0
    }

    /// Exclusive recursion depth, or the number of shared holders.
    pub fn hold_count(&self) -> u32 {
        self.state.lock().count
    }
}

impl Default for TokenRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_is_recursive() {
        let lock = TokenRwLock::new();
        lock.exclusive_lock();
        lock.exclusive_lock();
        assert!(lock.is_exclusively_held());
        assert_eq!(lock.hold_count(), 2);
        assert_eq!(lock.try_shared_lock(), Err(KError::WouldBlock));
        lock.exclusive_unlock();
        assert!(lock.is_exclusively_held());
        lock.exclusive_unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn shared_holders_count() {
        let lock = TokenRwLock::new();
        lock.shared_lock();
        lock.try_shared_lock().unwrap();
        assert_eq!(lock.hold_count(), 2);
        assert!(!lock.is_exclusively_held());
        assert_eq!(lock.try_exclusive_lock(), Err(KError::WouldBlock));
        lock.shared_unlock();
        lock.shared_unlock();
        lock.try_exclusive_lock().unwrap();
        lock.exclusive_unlock();
    }

    #[test]
    #[should_panic(expected = "exclusive unlock by non-owner")]
    fn unlock_by_non_owner_panics() {
        let lock = TokenRwLock::new();
        lock.shared_lock();
        lock.exclusive_unlock();
    }
}
