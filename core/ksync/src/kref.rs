//! A plain reference count with a one-time finalizer.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// A reference count that runs a finalizer when the last reference goes.
///
/// Misuse is fatal: acquiring after finalization, releasing more references
/// than were taken and finalizing twice all panic.
#[derive(Debug)]
pub struct KRef {
    count: AtomicI32,
    finalized: AtomicBool,
}

impl KRef {
    /// Creates a counter holding `count` references.
    pub const fn new(count: i32) -> Self {
        Self {
            count: AtomicI32::new(count),
            finalized: AtomicBool::new(false),
        }
    }

    /// Re-initializes the counter to `count` references.
    ///
    /// Only valid while nobody else can reach the counter.
    pub fn init(&self, count: i32) {
        self.count.store(count, Ordering::Relaxed);
        self.finalized.store(false, Ordering::Release);
    }

    /// Current number of references.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the finalizer has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Takes another reference.
    ///
    /// # Panics
    ///
    /// Panics if the object is finalized, or has no reference left to copy.
    pub fn acquire(&self) {
        assert!(!self.is_finalized(), "kref acquired after finalize");
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(old > 0, "kref acquired with count {old}");
    }

    /// Drops a reference. The release that drops the last one calls
    /// `finalize(a, b)` and returns `true`.
    ///
    /// # Panics
    ///
    /// Panics on underflow or a second finalization.
    pub fn release<A, B, F>(&self, finalize: F, a: A, b: B) -> bool
    where
        F: FnOnce(A, B),
    {
        let old = self.count.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "kref released with count {old}");
        if old != 1 {
            return false;
        }
        core::sync::atomic::fence(Ordering::Acquire);
        let first = !self.finalized.swap(true, Ordering::AcqRel);
        assert!(first, "kref finalized twice");
        finalize(a, b);
        true
    }
}

impl Default for KRef {
    fn default() -> Self {
        Self::new(1)
    }
}
