//! A [`lock_api`] mutex over [`Mtx`].

use core::time::Duration;

use ktask::now_ns;

use crate::{mtx::Mtx, util::SpinConfig};

/// A [`lock_api::RawMutex`] implementation.
///
/// Contended lockers spin for a while, then queue on the underlying [`Mtx`]
/// and sleep until the holder hands the lock over on release. Unlike the bare
/// [`Mtx`] it is not recursive: locking it twice from the same context
/// panics instead of deadlocking.
pub struct RawMutex {
    mtx: Mtx,
}

impl RawMutex {
    /// Creates a [`RawMutex`] with default spin configuration.
    #[inline(always)]
    pub const fn new() -> Self {
        Self::with_config(SpinConfig::DEFAULT)
    }

    /// Creates a [`RawMutex`] with custom spin configuration.
    #[inline(always)]
    pub const fn with_config(config: SpinConfig) -> Self {
        Self {
            mtx: Mtx::with_config("mutex", config),
        }
    }

    /// The underlying mutex.
    pub fn mtx(&self) -> &Mtx {
        &self.mtx
    }

    /// Whether the calling context holds the lock.
    pub fn is_owned_by_current(&self) -> bool {
        self.mtx.is_owned()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    /// Initial value for an unlocked mutex.
    ///
    /// A “non-constant” const item is a legacy way to supply an initialized
    /// value to downstream static items. Can hopefully be replaced with
    /// `const fn new() -> Self` at some point.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawMutex::new();

    type GuardMarker = lock_api::GuardNoSend;

    #[inline(always)]
    fn lock(&self) {
        assert!(
            !self.mtx.is_owned(),
            "context {} tried to acquire a mutex it already owns",
            ktask::current_id()
        );
        if let Err(e) = self.mtx.lock_exclusive(None, false) {
            panic!("uninterruptible mutex wait failed: {e:?}");
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        !self.mtx.is_owned() && self.mtx.try_lock_exclusive().is_ok()
    }

    #[inline(always)]
    unsafe fn unlock(&self) {
        assert!(
            self.mtx.is_owned(),
            "context {} tried to release a mutex it doesn't own",
            ktask::current_id()
        );
        self.mtx.unlock();
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.mtx.is_locked()
    }
}

unsafe impl lock_api::RawMutexTimed for RawMutex {
    type Duration = Duration;
    /// Monotonic nanoseconds, as returned by [`ktask::now_ns`].
    type Instant = u64;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        !self.mtx.is_owned() && self.mtx.lock_exclusive(Some(timeout), false).is_ok()
    }

    fn try_lock_until(&self, deadline: u64) -> bool {
        self.try_lock_for(Duration::from_nanos(deadline.saturating_sub(now_ns())))
    }
}

/// An alias of [`lock_api::Mutex`].
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
/// An alias of [`lock_api::MutexGuard`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
