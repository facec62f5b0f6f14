//! A [`lock_api`] reader-writer lock over [`Mtx`].

use crate::mtx::Mtx;

/// A [`lock_api::RawRwLock`] implementation.
///
/// Allows multiple readers or a single writer. Writers are preferred: once a
/// writer is queued, new readers wait behind it.
pub struct RawRwLock {
    mtx: Mtx,
}

impl RawRwLock {
    /// Creates a new [`RawRwLock`].
    pub const fn new() -> Self {
        Self {
            mtx: Mtx::new("rwlock"),
        }
    }

    /// The underlying mutex.
    pub fn mtx(&self) -> &Mtx {
        &self.mtx
    }

    fn assert_not_writer(&self) {
        assert!(
            !self.mtx.is_owned(),
            "context {} already holds this rwlock for writing",
            ktask::current_id()
        );
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawRwLock for RawRwLock {
    type GuardMarker = lock_api::GuardNoSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawRwLock::new();

    #[inline]
    fn lock_shared(&self) {
        self.assert_not_writer();
        if let Err(e) = self.mtx.lock_shared(None, false) {
            panic!("uninterruptible rwlock wait failed: {e:?}");
        }
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.mtx.try_lock_shared().is_ok()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.mtx.unlock();
    }

    #[inline]
    fn lock_exclusive(&self) {
        self.assert_not_writer();
        if let Err(e) = self.mtx.lock_exclusive(None, false) {
            panic!("uninterruptible rwlock wait failed: {e:?}");
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        !self.mtx.is_owned() && self.mtx.try_lock_exclusive().is_ok()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        self.mtx.unlock();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.mtx.is_locked()
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        self.mtx.is_exclusive()
    }
}

unsafe impl lock_api::RawRwLockDowngrade for RawRwLock {
    #[inline]
    unsafe fn downgrade(&self) {
        self.mtx.downgrade();
    }
}

/// A reader-writer lock.
pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
/// A read guard for a [`RwLock`].
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
/// A write guard for a [`RwLock`].
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_and_writer_excludes() {
        let lock = RwLock::new(1);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a + *b, 2);
            assert!(lock.try_write().is_none());
        }
        {
            let mut w = lock.write();
            *w = 7;
            assert!(lock.try_read().is_none());
        }
        assert_eq!(*lock.read(), 7);
        assert!(!lock.is_locked());
    }

    #[test]
    fn downgrade_keeps_reader() {
        let lock = RwLock::new(0);
        let mut w = lock.write();
        *w = 3;
        let r = RwLockWriteGuard::downgrade(w);
        assert_eq!(*r, 3);
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
        drop(r);
        assert!(lock.try_write().is_some());
    }
}
