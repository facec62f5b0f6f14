//! Registry-backed lifecycle reference counting.
//!
//! An object embedding a [`SysRef`] goes through four phases:
//!
//! ```text
//! Init --activate--> Active --last release--> Deactivating --last release--> Dead
//!   \______________________last release_____________________________________/
//! ```
//!
//! The release that ends the `Active` phase does not free the object. Its
//! reference is handed to the class's [`terminate`](SysRefClass::terminate)
//! hook, which tears the object down while temporary references may still
//! come and go, and gives the reference back when done. The release that
//! then drops the last reference frees it. Only `Active` objects can be found
//! through [`SysRefRegistry::lookup`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kspin::SpinNoIrq;
use slab::Slab;

const PHASE_SHIFT: u32 = 32;
const COUNT_MASK: u64 = u32::MAX as u64;
const COUNT_MAX: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init = 0,
    Active = 1,
    Deactivating = 2,
    Dead = 3,
}

fn pack(phase: Phase, count: u32) -> u64 {
    ((phase as u64) << PHASE_SHIFT) | u64::from(count)
}

fn unpack(word: u64) -> (Phase, u32) {
    let phase = match word >> PHASE_SHIFT {
        0 => Phase::Init,
        1 => Phase::Active,
        2 => Phase::Deactivating,
        _ => Phase::Dead,
    };
    (phase, (word & COUNT_MASK) as u32)
}

/// Observable state of a [`SysRef`], with its reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysRefState {
    /// Allocated, not yet visible to lookups.
    Init(u32),
    /// Live and visible to lookups.
    Active(u32),
    /// Being torn down; only already-held references remain.
    Deactivating(u32),
    /// Freed.
    Dead,
}

/// What the caller of [`SysRef::release`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysRefAction {
    /// Other references remain.
    Keep,
    /// The object left the active phase. The caller's reference now belongs
    /// to the termination path, which must release it when done.
    Terminate,
    /// The last reference is gone; free the object.
    Free,
}

/// A phase-tracking reference count.
#[derive(Debug)]
pub struct SysRef {
    word: AtomicU64,
    sysid: AtomicU64,
}

impl SysRef {
    /// A fresh count in the `Init` phase holding one reference.
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(1),
            sysid: AtomicU64::new(0),
        }
    }

    /// Resets to `Init` with one reference and records `sysid`.
    pub fn init(&self, sysid: u64) {
        self.sysid.store(sysid, Ordering::Relaxed);
        self.word.store(pack(Phase::Init, 1), Ordering::Release);
    }

    /// Registry id, 0 if never registered.
    pub fn sysid(&self) -> u64 {
        self.sysid.load(Ordering::Relaxed)
    }

    /// Current phase and count.
    pub fn state(&self) -> SysRefState {
        match unpack(self.word.load(Ordering::Acquire)) {
            (Phase::Init, n) => SysRefState::Init(n),
            (Phase::Active, n) => SysRefState::Active(n),
            (Phase::Deactivating, n) => SysRefState::Deactivating(n),
            (Phase::Dead, _) => SysRefState::Dead,
        }
    }

    fn update(&self, mut f: impl FnMut(Phase, u32) -> u64) -> (Phase, u32) {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let (phase, count) = unpack(word);
            match self.word.compare_exchange_weak(
                word,
                f(phase, count),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (phase, count),
                Err(actual) => word = actual,
            }
        }
    }

    /// Moves an `Init` object to `Active`.
    ///
    /// # Panics
    ///
    /// Panics in any other phase.
    pub fn activate(&self) {
        self.update(|phase, count| {
            assert_eq!(phase, Phase::Init, "sysref activated twice");
            pack(Phase::Active, count)
        });
    }

    /// Takes another reference. Allowed in every phase but `Dead`.
    ///
    /// # Panics
    ///
    /// Panics on a dead object.
    pub fn acquire(&self) {
        self.update(|phase, count| {
            assert!(phase != Phase::Dead, "sysref acquired after free");
            assert_ne!(count, COUNT_MAX, "sysref count overflow");
            pack(phase, count + 1)
        });
    }

    /// Takes a reference only while the object is `Active`.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow.
    pub fn try_acquire_active(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let (phase, count) = unpack(word);
            if phase != Phase::Active {
                return false;
            }
            assert_ne!(count, COUNT_MAX, "sysref count overflow");
            match self.word.compare_exchange_weak(
                word,
                pack(phase, count + 1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Drops a reference and says what has to happen next.
    ///
    /// # Panics
    ///
    /// Panics on underflow or on a dead object.
    pub fn release(&self) -> SysRefAction {
        let (phase, count) = self.update(|phase, count| {
            assert!(phase != Phase::Dead && count > 0, "sysref released after free");
            match (phase, count) {
                (Phase::Active, 1) => pack(Phase::Deactivating, 1),
                (Phase::Init | Phase::Deactivating, 1) => pack(Phase::Dead, 0),
                _ => pack(phase, count - 1),
            }
        });
        match (phase, count) {
            (Phase::Active, 1) => SysRefAction::Terminate,
            (_, 1) => SysRefAction::Free,
            _ => SysRefAction::Keep,
        }
    }

    /// Whether the object is live.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), SysRefState::Active(_))
    }

    /// Whether the object is being torn down.
    pub fn is_deactivating(&self) -> bool {
        matches!(self.state(), SysRefState::Deactivating(_))
    }

    /// Whether only the termination path's reference is left.
    pub fn is_last_deactivation(&self) -> bool {
        self.state() == SysRefState::Deactivating(1)
    }
}

impl Default for SysRef {
    fn default() -> Self {
        Self::new()
    }
}

/// A class of objects tracked by a [`SysRefRegistry`].
pub trait SysRefClass: Send + Sync + Sized {
    /// Class name used in diagnostics.
    const NAME: &'static str;

    /// The embedded counter.
    fn sysref(&self) -> &SysRef;

    /// Tears down an object that left the active phase. Owns one reference,
    /// which it must give back through [`SysRefRegistry::release`].
    fn terminate(registry: &SysRefRegistry<Self>, obj: &Arc<Self>) {
        registry.release(obj);
    }

    /// Final destruction once the last reference is gone.
    fn destroy(obj: Arc<Self>) {
        drop(obj);
    }
}

/// Id-indexed registry of [`SysRefClass`] objects.
///
/// Ids are never reused while the registry lives: each carries a sequence
/// number beside its slot index.
pub struct SysRefRegistry<T: SysRefClass> {
    objects: SpinNoIrq<Slab<Arc<T>>>,
    seq: AtomicU32,
}

impl<T: SysRefClass> SysRefRegistry<T> {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            objects: SpinNoIrq::new(Slab::new()),
            seq: AtomicU32::new(1),
        }
    }

    fn slot_of(sysid: u64) -> usize {
        sysid as u32 as usize
    }

    /// Registers `obj` in the `Init` phase and returns it holding the
    /// caller's reference.
    pub fn alloc(&self, obj: T) -> Arc<T> {
        let seq = u64::from(self.seq.fetch_add(1, Ordering::Relaxed));
        let mut objects = self.objects.lock();
        let entry = objects.vacant_entry();
        let sysid = (seq << PHASE_SHIFT) | entry.key() as u64;
        obj.sysref().init(sysid);
        let obj = Arc::new(obj);
        entry.insert(obj.clone());
        trace!("{}: allocated sysid {:#x}", T::NAME, sysid);
        obj
    }

    /// Makes `obj` visible to lookups.
    pub fn activate(&self, obj: &Arc<T>) {
        obj.sysref().activate();
    }

    /// Finds an active object by id and takes a reference on it.
    pub fn lookup(&self, sysid: u64) -> Option<Arc<T>> {
        let objects = self.objects.lock();
        let obj = objects.get(Self::slot_of(sysid))?;
        (obj.sysref().sysid() == sysid && obj.sysref().try_acquire_active()).then(|| obj.clone())
    }

    /// Takes another reference on `obj`.
    pub fn acquire(&self, obj: &Arc<T>) {
        obj.sysref().acquire();
    }

    /// Drops a reference on `obj`, running the termination or destruction
    /// path when it was the last one.
    pub fn release(&self, obj: &Arc<T>) {
        match obj.sysref().release() {
            SysRefAction::Keep => {}
            SysRefAction::Terminate => {
                debug!("{}: terminating sysid {:#x}", T::NAME, obj.sysref().sysid());
                T::terminate(self, obj);
            }
            SysRefAction::Free => {
                let sysid = obj.sysref().sysid();
                let removed = {
                    let mut objects = self.objects.lock();
                    let slot = Self::slot_of(sysid);
                    match objects.get(slot) {
                        Some(o) if Arc::ptr_eq(o, obj) => Some(objects.remove(slot)),
                        _ => None,
                    }
                };
                match removed {
                    Some(removed) => T::destroy(removed),
                    None => warn!("{}: freed sysid {:#x} was not registered", T::NAME, sysid),
                }
            }
        }
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether no object is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: SysRefClass> Default for SysRefRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    #[should_panic(expected = "sysref count overflow")]
    fn active_acquire_overflow_panics() {
        let r = SysRef::new();
        r.activate();
        r.word.store(pack(Phase::Active, COUNT_MAX), Ordering::Relaxed);
        r.try_acquire_active();
    }

    #[test]
    fn phases_follow_releases() {
        let r = SysRef::new();
        assert_eq!(r.state(), SysRefState::Init(1));
        r.activate();
        r.acquire();
        assert_eq!(r.state(), SysRefState::Active(2));
        assert_eq!(r.release(), SysRefAction::Keep);
        assert!(r.is_active());

        assert_eq!(r.release(), SysRefAction::Terminate);
        assert!(r.is_deactivating());
        assert!(r.is_last_deactivation());
        assert!(!r.try_acquire_active());

        r.acquire();
        assert!(!r.is_last_deactivation());
        assert_eq!(r.release(), SysRefAction::Keep);
        assert_eq!(r.release(), SysRefAction::Free);
        assert_eq!(r.state(), SysRefState::Dead);
    }

    #[test]
    fn never_activated_is_freed_directly() {
        let r = SysRef::new();
        assert_eq!(r.release(), SysRefAction::Free);
        assert_eq!(r.state(), SysRefState::Dead);
    }

    #[test]
    #[should_panic(expected = "acquired after free")]
    fn acquire_dead_panics() {
        let r = SysRef::new();
        r.release();
        r.acquire();
    }

    #[test]
    #[should_panic(expected = "activated twice")]
    fn double_activate_panics() {
        let r = SysRef::new();
        r.activate();
        r.activate();
    }

    static TERMINATED: AtomicUsize = AtomicUsize::new(0);
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    struct Vnode {
        sysref: SysRef,
    }

    impl SysRefClass for Vnode {
        const NAME: &'static str = "vnode";

        fn sysref(&self) -> &SysRef {
            &self.sysref
        }

        fn terminate(registry: &SysRefRegistry<Self>, obj: &Arc<Self>) {
            TERMINATED.fetch_add(1, Ordering::Relaxed);
            assert!(registry.lookup(obj.sysref().sysid()).is_none());
            registry.release(obj);
        }

        fn destroy(obj: Arc<Self>) {
            assert_eq!(obj.sysref().state(), SysRefState::Dead);
            DESTROYED.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn registry_lookup_and_teardown() {
        let reg = SysRefRegistry::<Vnode>::new();
        let v = reg.alloc(Vnode {
            sysref: SysRef::new(),
        });
        let id = v.sysref().sysid();
        assert!(reg.lookup(id).is_none());
        reg.activate(&v);

        let found = reg.lookup(id).unwrap();
        assert!(Arc::ptr_eq(&found, &v));
        assert_eq!(v.sysref().state(), SysRefState::Active(2));
        reg.release(&found);
        drop(found);

        reg.release(&v);
        assert_eq!(TERMINATED.load(Ordering::Relaxed), 1);
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 1);
        assert!(reg.is_empty());
        assert!(reg.lookup(id).is_none());

        // the freed slot comes back under a different id
        let w = reg.alloc(Vnode {
            sysref: SysRef::new(),
        });
        assert_ne!(w.sysref().sysid(), id);
        assert_eq!(
            SysRefRegistry::<Vnode>::slot_of(w.sysref().sysid()),
            SysRefRegistry::<Vnode>::slot_of(id)
        );
        assert!(reg.lookup(id).is_none());
        reg.release(&w);
        assert!(reg.is_empty());
    }
}
