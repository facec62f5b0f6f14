//! Exclusive/shared mutex with queued waiter links.
//!
//! The whole lock state lives in one word:
//!
//! | bits  | meaning                                             |
//! |-------|-----------------------------------------------------|
//! | 31    | `EXCLUSIVE`: the count is an exclusive (recursive) hold |
//! | 30    | `SHWANTED`: shared requests are queued              |
//! | 29    | `EXWANTED`: exclusive requests are queued           |
//! | 28    | `LINKSPIN`: somebody is editing the waiter lists    |
//! | 0..28 | hold count                                          |
//!
//! Uncontended acquires and releases are a single compare-and-swap. A
//! contended request queues a [`MtxLink`] while holding `LINKSPIN`, setting the
//! matching `WANTED` bit in the same swap. The last release hands the lock
//! straight to the first exclusive link, or to every shared link at once, so a
//! woken waiter never has to race for it.
//!
//! Writers are preferred: while `EXCLUSIVE` or `EXWANTED` is set new shared
//! requests queue, and a release grants a queued exclusive request before any
//! shared one.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use kerrno::{KError, KResult, k_err};
use kspin::{Backoff, SpinRaw};
use ktask::{
    CritSection, Waiter, block_current, crit_enter, current_id, deadline_after, sleep_interlock,
};

use crate::util::{Spin, SpinConfig};

const EXCLUSIVE: u32 = 1 << 31;
const SHWANTED: u32 = 1 << 30;
const EXWANTED: u32 = 1 << 29;
const LINKSPIN: u32 = 1 << 28;
const COUNT_MASK: u32 = LINKSPIN - 1;

/// Progress of one lock request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not queued.
    Idle = 0,
    /// Queued for an exclusive hold.
    LinkedEx = 1,
    /// Queued for a shared hold.
    LinkedSh = 2,
    /// The lock was handed to the waiter.
    Acquired = 3,
    /// The completion callback has run.
    CalledBack = 4,
    /// Cancelled before the lock was handed over.
    Aborted = 5,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::LinkedEx,
            2 => Self::LinkedSh,
            3 => Self::Acquired,
            4 => Self::CalledBack,
            _ => Self::Aborted,
        }
    }

    /// Whether the request sits on a waiter list.
    pub fn is_linked(self) -> bool {
        matches!(self, Self::LinkedEx | Self::LinkedSh)
    }
}

type LinkCallback = dyn Fn(KResult) + Send + Sync;

struct LinkInner {
    state: AtomicU8,
    waiter: SpinRaw<Option<Waiter>>,
    callback: Option<Box<LinkCallback>>,
}

impl LinkInner {
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Reports the outcome of a queued request to whoever waits for it.
    fn complete(&self, result: KResult) {
        let waiter = self.waiter.lock().take();
        match &self.callback {
            Some(callback) => {
                self.set_state(LinkState::CalledBack);
                callback(result);
                if let Some(waiter) = waiter {
                    let _ = waiter.wake();
                }
            }
            None => {
                self.set_state(if result.is_ok() {
                    LinkState::Acquired
                } else {
                    LinkState::Aborted
                });
                if let Some(waiter) = waiter {
                    let _ = waiter.wake();
                }
            }
        }
    }
}

/// A lock request that can be queued, waited on, or aborted.
///
/// Plain [`Mtx::lock_exclusive`] and [`Mtx::lock_shared`] use a private link.
/// A link made with [`with_callback`](Self::with_callback) is asynchronous:
/// queueing it returns `InProgress` and the callback later receives `Ok(())`
/// once the lock is held, or `NoLock` if the request was aborted. The callback
/// runs with the waiter lists locked and must not block.
#[derive(Clone)]
pub struct MtxLink {
    inner: Arc<LinkInner>,
}

impl MtxLink {
    /// Creates a synchronous link.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an asynchronous link completed through `callback`.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(KResult) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(callback)))
    }

    fn build(callback: Option<Box<LinkCallback>>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                state: AtomicU8::new(LinkState::Idle as u8),
                waiter: SpinRaw::new(None),
                callback,
            }),
        }
    }

    /// Current progress of the request.
    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    fn is_async(&self) -> bool {
        self.inner.callback.is_some()
    }
}

impl Default for MtxLink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MtxLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtxLink")
            .field("state", &self.state())
            .field("async", &self.is_async())
            .finish()
    }
}

type LinkList = VecDeque<Arc<LinkInner>>;

struct WaitLists {
    ex: LinkList,
    sh: LinkList,
}

fn unlink(list: &mut LinkList, link: &Arc<LinkInner>) {
    if let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, link)) {
        list.remove(pos);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Exclusive,
    Shared,
}

impl Kind {
    fn wanted(self) -> u32 {
        match self {
            Self::Exclusive => EXWANTED,
            Self::Shared => SHWANTED,
        }
    }

    fn linked(self) -> LinkState {
        match self {
            Self::Exclusive => LinkState::LinkedEx,
            Self::Shared => LinkState::LinkedSh,
        }
    }

    fn of(state: LinkState) -> Option<Self> {
        match state {
            LinkState::LinkedEx => Some(Self::Exclusive),
            LinkState::LinkedSh => Some(Self::Shared),
            _ => None,
        }
    }

    fn list(self, lists: &mut WaitLists) -> &mut LinkList {
        match self {
            Self::Exclusive => &mut lists.ex,
            Self::Shared => &mut lists.sh,
        }
    }
}

/// Holds `LINKSPIN`, and with it the waiter lists.
///
/// Dropping the guard clears `LINKSPIN` together with the bits in `clear`.
struct LinkSpin<'a> {
    mtx: &'a Mtx,
    clear: u32,
    _crit: CritSection,
}

impl LinkSpin<'_> {
    fn lists(&mut self) -> &mut WaitLists {
        // SAFETY: the lists are only reached through a `LinkSpin`, and at most
        // one exists per mutex because creating one sets `LINKSPIN` with a
        // compare-and-swap that requires it clear.
        unsafe { &mut *self.mtx.links.get() }
    }
}

impl Drop for LinkSpin<'_> {
    fn drop(&mut self) {
        self.mtx
            .word
            .fetch_and(!(LINKSPIN | self.clear), Ordering::Release);
    }
}

/// Contention counters (available with the `stats` feature).
#[cfg(feature = "stats")]
#[derive(Debug, Default)]
pub struct MtxStats {
    /// Times a waiter went to sleep
    pub contention: AtomicU64,
    /// Compare-and-swap retries on the lock word
    pub collision: AtomicU64,
    /// Requests granted by hand-off, or aborted, while queued
    pub wakeup: AtomicU64,
}

#[derive(Clone, Copy)]
enum Stat {
    Contention,
    Collision,
    Wakeup,
}

/// A blocking mutex that can be held exclusively (recursively) or shared.
///
/// Blocking acquires take an optional timeout and an `interruptible` flag and
/// fail with `WouldBlock` or `Interrupted`; a failed wait is always removed
/// from the waiter lists before the call returns.
pub struct Mtx {
    word: AtomicU32,
    owner: AtomicU64,
    links: UnsafeCell<WaitLists>,
    ident: &'static str,
    config: SpinConfig,
    #[cfg(feature = "stats")]
    stats: MtxStats,
}

// SAFETY: `links` is only touched under `LINKSPIN`, see `LinkSpin::lists`.
unsafe impl Sync for Mtx {}

impl Mtx {
    /// Creates an unlocked mutex named `ident`.
    pub const fn new(ident: &'static str) -> Self {
        Self::with_config(ident, SpinConfig::DEFAULT)
    }

    /// Creates an unlocked mutex with a custom spin budget.
    pub const fn with_config(ident: &'static str, config: SpinConfig) -> Self {
        Self {
            word: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            links: UnsafeCell::new(WaitLists {
                ex: VecDeque::new(),
                sh: VecDeque::new(),
            }),
            ident,
            config,
            #[cfg(feature = "stats")]
            stats: MtxStats {
                contention: AtomicU64::new(0),
                collision: AtomicU64::new(0),
                wakeup: AtomicU64::new(0),
            },
        }
    }

    /// Name given at construction.
    pub fn ident(&self) -> &'static str {
        self.ident
    }

    /// Whether the mutex is held at all.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) & COUNT_MASK != 0
    }

    /// Whether the mutex is held exclusively.
    pub fn is_exclusive(&self) -> bool {
        self.word.load(Ordering::Relaxed) & EXCLUSIVE != 0
    }

    /// Whether the caller holds the mutex exclusively.
    pub fn is_owned(&self) -> bool {
        self.is_exclusive() && self.owner.load(Ordering::Relaxed) == current_id()
    }

    /// Exclusive recursion depth or number of shared holders.
    pub fn hold_count(&self) -> u32 {
        self.word.load(Ordering::Relaxed) & COUNT_MASK
    }

    /// Queued `(exclusive, shared)` requests.
    pub fn waiter_counts(&self) -> (usize, usize) {
        let mut spin = self.link_spin();
        let lists = spin.lists();
        (lists.ex.len(), lists.sh.len())
    }

    /// Gets the contention counters (only available with the `stats` feature).
    ///
    /// Returns `(contention, collision, wakeup)`.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.contention.load(Ordering::Relaxed),
            self.stats.collision.load(Ordering::Relaxed),
            self.stats.wakeup.load(Ordering::Relaxed),
        )
    }

    /// Resets the contention counters (only available with the `stats`
    /// feature). The counters are cleared one by one.
    #[cfg(feature = "stats")]
    pub fn reset_stats(&self) {
        self.stats.contention.store(0, Ordering::Relaxed);
        self.stats.collision.store(0, Ordering::Relaxed);
        self.stats.wakeup.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    fn note(&self, _stat: Stat) {
        #[cfg(feature = "stats")]
        match _stat {
            Stat::Contention => &self.stats.contention,
            Stat::Collision => &self.stats.collision,
            Stat::Wakeup => &self.stats.wakeup,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    /// Sets `LINKSPIN` if the word still reads `old`, storing `new` with it.
    fn try_link_spin(&self, old: u32, new: u32) -> Option<LinkSpin<'_>> {
        let crit = crit_enter();
        self.word
            .compare_exchange(old, new | LINKSPIN, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        Some(LinkSpin {
            mtx: self,
            clear: 0,
            _crit: crit,
        })
    }

    fn link_spin(&self) -> LinkSpin<'_> {
        let mut backoff = Backoff::new();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if word & LINKSPIN == 0 {
                if let Some(spin) = self.try_link_spin(word, word) {
                    return spin;
                }
            }
            self.note(Stat::Collision);
            backoff.spin();
        }
    }

    fn try_acquire_ex(&self, me: u64) -> bool {
        loop {
            let word = self.word.load(Ordering::Relaxed);
            // a free word may still carry LINKSPIN from a queue inspection
            if word & !LINKSPIN == 0 {
                if self
                    .word
                    .compare_exchange(word, word | EXCLUSIVE | 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.owner.store(me, Ordering::Relaxed);
                    return true;
                }
            } else if word & EXCLUSIVE != 0 && self.owner.load(Ordering::Relaxed) == me {
                assert_ne!(word & COUNT_MASK, COUNT_MASK, "{}: hold count overflow", self.ident);
                if self
                    .word
                    .compare_exchange(word, word + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            } else {
                return false;
            }
            self.note(Stat::Collision);
            core::hint::spin_loop();
        }
    }

    fn try_acquire_sh(&self) -> bool {
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if word & (EXCLUSIVE | EXWANTED) != 0 {
                return false;
            }
            assert_ne!(word & COUNT_MASK, COUNT_MASK, "{}: hold count overflow", self.ident);
            if self
                .word
                .compare_exchange(word, word + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            self.note(Stat::Collision);
            core::hint::spin_loop();
        }
    }

    /// Whether `word` forces a `kind` request from `me` to queue.
    fn blocks(&self, word: u32, kind: Kind, me: u64) -> bool {
        match kind {
            Kind::Exclusive => {
                word & COUNT_MASK != 0
                    && !(word & EXCLUSIVE != 0 && self.owner.load(Ordering::Relaxed) == me)
            }
            Kind::Shared => word & (EXCLUSIVE | EXWANTED) != 0,
        }
    }

    /// Acquires an exclusive hold, recursively if the caller already owns it.
    pub fn lock_exclusive(&self, timeout: Option<Duration>, interruptible: bool) -> KResult {
        if self.try_acquire_ex(current_id()) {
            return Ok(());
        }
        self.lock_exclusive_link(&MtxLink::new(), timeout, interruptible)
    }

    /// Acquires a shared hold.
    pub fn lock_shared(&self, timeout: Option<Duration>, interruptible: bool) -> KResult {
        if self.try_acquire_sh() {
            return Ok(());
        }
        self.lock_shared_link(&MtxLink::new(), timeout, interruptible)
    }

    /// Acquires an exclusive hold through `link`.
    ///
    /// An asynchronous link returns `InProgress` instead of waiting. Fails with
    /// `InvalidInput` if `link` is already queued and with `NoLock` if it was
    /// aborted.
    pub fn lock_exclusive_link(
        &self,
        link: &MtxLink,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> KResult {
        self.lock_link(link, Kind::Exclusive, timeout.map(deadline_after), interruptible)
    }

    /// Acquires a shared hold through `link`. See
    /// [`lock_exclusive_link`](Self::lock_exclusive_link).
    pub fn lock_shared_link(
        &self,
        link: &MtxLink,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> KResult {
        self.lock_link(link, Kind::Shared, timeout.map(deadline_after), interruptible)
    }

    fn lock_link(
        &self,
        link: &MtxLink,
        kind: Kind,
        deadline: Option<u64>,
        interruptible: bool,
    ) -> KResult {
        match link.state() {
            state if state.is_linked() => {
                return k_err!(InvalidInput, "mutex link already queued");
            }
            LinkState::Aborted => {
                link.inner.set_state(LinkState::Idle);
                return Err(KError::NoLock);
            }
            _ => {}
        }

        let me = current_id();
        let mut spin = Spin::new(if link.is_async() {
            SpinConfig::NONE
        } else {
            self.config
        });
        let mut backoff = Backoff::new();
        loop {
            let acquired = match kind {
                Kind::Exclusive => self.try_acquire_ex(me),
                Kind::Shared => self.try_acquire_sh(),
            };
            if acquired {
                link.inner.set_state(LinkState::Acquired);
                return Ok(());
            }

            let word = self.word.load(Ordering::Relaxed);
            if word & LINKSPIN != 0 {
                self.note(Stat::Collision);
                backoff.spin();
                continue;
            }
            if spin.spin() {
                continue;
            }
            // WANTED goes up in the same swap that takes LINKSPIN, from a word
            // that was seen to block us.
            if !self.blocks(word, kind, me) {
                continue;
            }
            let Some(mut guard) = self.try_link_spin(word, word | kind.wanted()) else {
                continue;
            };

            if link.state() == LinkState::Aborted {
                if kind.list(guard.lists()).is_empty() {
                    guard.clear = kind.wanted();
                }
                drop(guard);
                link.inner.set_state(LinkState::Idle);
                return Err(KError::NoLock);
            }

            *link.inner.waiter.lock() = Some(Waiter::current());
            link.inner.set_state(kind.linked());
            kind.list(guard.lists()).push_back(link.inner.clone());
            drop(guard);

            if link.is_async() {
                return Err(KError::InProgress);
            }
            return self.wait_link_until(link, deadline, interruptible);
        }
    }

    /// Waits until a queued `link` is granted or aborted.
    ///
    /// On timeout or interruption the link is dequeued before returning.
    pub fn wait_link(
        &self,
        link: &MtxLink,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> KResult {
        self.wait_link_until(link, timeout.map(deadline_after), interruptible)
    }

    fn wait_link_until(
        &self,
        link: &MtxLink,
        deadline: Option<u64>,
        interruptible: bool,
    ) -> KResult {
        let mut res = Ok(());
        while link.state().is_linked() {
            sleep_interlock();
            if link.state().is_linked() {
                self.note(Stat::Contention);
                if let Err(e) = block_current(deadline, interruptible) {
                    res = Err(e);
                    break;
                }
            }
        }

        let res = match link.state() {
            LinkState::Acquired | LinkState::CalledBack => Ok(()),
            LinkState::Aborted => Err(KError::NoLock),
            LinkState::LinkedEx | LinkState::LinkedSh => match self.delete_link(link) {
                // granted between the failed wait and the dequeue
                LinkState::Acquired | LinkState::CalledBack => Ok(()),
                LinkState::Aborted => Err(KError::NoLock),
                _ => {
                    warn!("{}: wait ended with the request still queued", self.ident);
                    res.and(Err(KError::WouldBlock))
                }
            },
            LinkState::Idle => res.and(Err(KError::WouldBlock)),
        };
        link.inner.set_state(LinkState::Idle);
        res
    }

    /// Dequeues `link` if it is still queued and returns the state it had
    /// under `LINKSPIN`.
    fn delete_link(&self, link: &MtxLink) -> LinkState {
        let mut guard = self.link_spin();
        let state = link.state();
        let Some(kind) = Kind::of(state) else {
            return state;
        };
        let list = kind.list(guard.lists());
        unlink(list, &link.inner);
        if list.is_empty() {
            guard.clear = kind.wanted();
        }
        link.inner.waiter.lock().take();
        state
    }

    /// Cancels `link`.
    ///
    /// An idle link is marked so that its next lock attempt fails with
    /// `NoLock`. A queued link is dequeued and its waiter or callback gets
    /// `NoLock`. A link that already got the lock is left alone.
    pub fn abort_link(&self, link: &MtxLink) {
        let mut guard = self.link_spin();
        let state = link.state();
        match Kind::of(state) {
            None if state == LinkState::Idle => link.inner.set_state(LinkState::Aborted),
            None => {}
            Some(kind) => {
                let list = kind.list(guard.lists());
                unlink(list, &link.inner);
                if list.is_empty() {
                    guard.clear = kind.wanted();
                }
                debug!("{}: aborted queued {:?} request", self.ident, kind);
                link.inner.complete(Err(KError::NoLock));
                self.note(Stat::Wakeup);
            }
        }
    }

    /// Acquires an exclusive hold without waiting.
    pub fn try_lock_exclusive(&self) -> KResult {
        if self.try_acquire_ex(current_id()) {
            Ok(())
        } else {
            Err(KError::WouldBlock)
        }
    }

    /// Acquires a shared hold without waiting. Fails while an exclusive
    /// request is queued.
    pub fn try_lock_shared(&self) -> KResult {
        if self.try_acquire_sh() {
            Ok(())
        } else {
            Err(KError::WouldBlock)
        }
    }

    /// Busy-waits for an exclusive hold inside a critical section.
    ///
    /// Only for short sections that never block, on a mutex whose other
    /// holders never block while holding it either.
    pub fn spin_lock(&self) -> MtxSpinGuard<'_> {
        let crit = crit_enter();
        let me = current_id();
        let mut backoff = Backoff::new();
        while !self.try_acquire_ex(me) {
            self.note(Stat::Contention);
            backoff.spin();
        }
        MtxSpinGuard {
            mtx: self,
            _crit: crit,
        }
    }

    /// Busy-waits for a shared hold inside a critical section.
    pub fn spin_lock_shared(&self) -> MtxSpinGuard<'_> {
        let crit = crit_enter();
        let mut backoff = Backoff::new();
        while !self.try_acquire_sh() {
            self.note(Stat::Contention);
            backoff.spin();
        }
        MtxSpinGuard {
            mtx: self,
            _crit: crit,
        }
    }

    /// Takes an exclusive spin hold if it is free right now.
    pub fn spin_try(&self) -> KResult<MtxSpinGuard<'_>> {
        let crit = crit_enter();
        if self.try_acquire_ex(current_id()) {
            Ok(MtxSpinGuard {
                mtx: self,
                _crit: crit,
            })
        } else {
            Err(KError::WouldBlock)
        }
    }

    /// Converts the caller's exclusive hold into shared holds, waking every
    /// queued shared request along with it. A shared hold is left as is.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is unlocked, or held exclusively by someone else.
    pub fn downgrade(&self) {
        let word = self.word.load(Ordering::Relaxed);
        if word & EXCLUSIVE == 0 {
            assert_ne!(word & COUNT_MASK, 0, "{}: downgrade of an unlocked mutex", self.ident);
            return;
        }
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            current_id(),
            "{}: downgrade by a non-owner",
            self.ident
        );
        self.owner.store(0, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            let done = if word & SHWANTED != 0 {
                self.chain_link_sh(word, 1)
            } else {
                self.word
                    .compare_exchange(word, word & !EXCLUSIVE, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };
            if done {
                return;
            }
            self.note(Stat::Collision);
            backoff.spin();
        }
    }

    /// Turns the caller's single shared hold into an exclusive one.
    ///
    /// Fails with `WouldBlock`, leaving the lock unchanged, if anyone else
    /// holds it shared or shared requests are queued. Succeeds at once if the
    /// caller already holds it exclusively.
    pub fn try_upgrade(&self) -> KResult {
        let me = current_id();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if word & !EXWANTED == 1 {
                if self
                    .word
                    .compare_exchange(word, word | EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.owner.store(me, Ordering::Relaxed);
                    return Ok(());
                }
            } else if word & EXCLUSIVE != 0 {
                assert_eq!(
                    self.owner.load(Ordering::Relaxed),
                    me,
                    "{}: upgrade while another context holds it exclusively",
                    self.ident
                );
                return Ok(());
            } else {
                return Err(KError::WouldBlock);
            }
            self.note(Stat::Collision);
            core::hint::spin_loop();
        }
    }

    /// Drops one hold. The last release hands the lock to queued requests.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not held.
    pub fn unlock(&self) {
        let mut backoff = Backoff::new();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            let count = word & COUNT_MASK;
            assert_ne!(count, 0, "{}: unlock of an unlocked mutex", self.ident);
            let done = if count > 1 {
                self.word
                    .compare_exchange(word, word - 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            } else if word & LINKSPIN != 0 {
                false
            } else {
                if word & EXCLUSIVE != 0 {
                    self.owner.store(0, Ordering::Relaxed);
                }
                if word & EXWANTED != 0 {
                    self.chain_link_ex(word)
                } else if word & SHWANTED != 0 {
                    self.chain_link_sh(word, 0)
                } else {
                    self.word
                        .compare_exchange(word, 0, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                }
            };
            if done {
                return;
            }
            self.note(Stat::Collision);
            backoff.spin();
        }
    }

    /// Passes the releaser's count of one to the first exclusive request.
    fn chain_link_ex(&self, word: u32) -> bool {
        let word = word & !LINKSPIN;
        let Some(mut guard) = self.try_link_spin(word, word | EXCLUSIVE) else {
            return false;
        };
        let lists = guard.lists();
        let next = lists.ex.pop_front();
        let last = lists.ex.is_empty();
        let Some(link) = next else {
            panic!("{}: EXWANTED without an exclusive request", self.ident);
        };
        if last {
            guard.clear = EXWANTED;
        }
        assert_eq!(link.state(), LinkState::LinkedEx, "{}: bad exclusive link", self.ident);
        let owner = link.waiter.lock().as_ref().map_or(0, Waiter::id);
        self.owner.store(owner, Ordering::Relaxed);
        link.complete(Ok(()));
        self.note(Stat::Wakeup);
        true
    }

    /// Grants every queued shared request. With `add == 0` the first one
    /// inherits the count already in the word.
    fn chain_link_sh(&self, word: u32, mut add: u32) -> bool {
        let word = word & !LINKSPIN;
        let Some(mut guard) = self.try_link_spin(word, word & !EXCLUSIVE) else {
            return false;
        };
        guard.clear = SHWANTED;
        let links = core::mem::take(&mut guard.lists().sh);
        assert!(!links.is_empty(), "{}: SHWANTED without a shared request", self.ident);
        for link in links {
            assert_eq!(link.state(), LinkState::LinkedSh, "{}: bad shared link", self.ident);
            self.word.fetch_add(add, Ordering::Relaxed);
            add = 1;
            link.complete(Ok(()));
            self.note(Stat::Wakeup);
        }
        true
    }
}

impl Drop for Mtx {
    fn drop(&mut self) {
        let lists = self.links.get_mut();
        assert!(
            lists.ex.is_empty() && lists.sh.is_empty(),
            "{}: dropped with queued requests",
            self.ident
        );
    }
}

impl fmt::Debug for Mtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        f.debug_struct("Mtx")
            .field("ident", &self.ident)
            .field("exclusive", &(word & EXCLUSIVE != 0))
            .field("count", &(word & COUNT_MASK))
            .field("exwanted", &(word & EXWANTED != 0))
            .field("shwanted", &(word & SHWANTED != 0))
            .finish()
    }
}

/// A spin hold on a [`Mtx`]. The critical section ends with the hold.
pub struct MtxSpinGuard<'a> {
    mtx: &'a Mtx,
    _crit: CritSection,
}

impl Drop for MtxSpinGuard<'_> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn recursion_counts_up_and_down() {
        let m = Mtx::new("rec");
        m.lock_exclusive(None, false).unwrap();
        m.lock_exclusive(None, false).unwrap();
        assert!(m.is_owned());
        assert_eq!(m.hold_count(), 2);
        m.unlock();
        assert!(m.is_owned());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn shared_holds_stack() {
        let m = Mtx::new("sh");
        m.lock_shared(None, false).unwrap();
        m.try_lock_shared().unwrap();
        assert_eq!(m.hold_count(), 2);
        assert!(!m.is_exclusive());
        assert_eq!(m.try_lock_exclusive(), Err(KError::WouldBlock));
        m.unlock();
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn upgrade_needs_a_single_holder() {
        let m = Mtx::new("up");
        m.lock_shared(None, false).unwrap();
        m.lock_shared(None, false).unwrap();
        assert_eq!(m.try_upgrade(), Err(KError::WouldBlock));
        assert_eq!(m.hold_count(), 2);
        assert!(!m.is_exclusive());
        m.unlock();
        m.try_upgrade().unwrap();
        assert!(m.is_owned());
        m.downgrade();
        assert!(!m.is_exclusive());
        assert_eq!(m.hold_count(), 1);
        m.unlock();
    }

    #[test]
    fn downgrade_keeps_recursive_count() {
        let m = Mtx::new("down");
        m.lock_exclusive(None, false).unwrap();
        m.lock_exclusive(None, false).unwrap();
        m.downgrade();
        assert_eq!(m.hold_count(), 2);
        assert!(m.try_lock_shared().is_ok());
        m.unlock();
        m.unlock();
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn spin_guard_releases() {
        let m = Mtx::new("spin");
        {
            let _g = m.spin_lock();
            assert!(m.is_owned());
            let _again = m.spin_try().unwrap();
            assert_eq!(m.hold_count(), 2);
        }
        assert!(!m.is_locked());
        {
            let _a = m.spin_lock_shared();
            let _b = m.spin_lock_shared();
            assert!(m.spin_try().is_err());
        }
        assert!(!m.is_locked());
    }

    #[test]
    fn aborted_idle_link_fails_next_attempt() {
        let m = Mtx::new("abort");
        let link = MtxLink::new();
        m.abort_link(&link);
        assert_eq!(link.state(), LinkState::Aborted);
        assert_eq!(m.lock_exclusive_link(&link, None, false), Err(KError::NoLock));
        assert_eq!(link.state(), LinkState::Idle);
        m.lock_exclusive_link(&link, None, false).unwrap();
        assert_eq!(link.state(), LinkState::Acquired);
        m.unlock();
    }

    #[test]
    fn async_link_is_granted_on_release() {
        let m = Mtx::new("async");
        let granted = Arc::new(AtomicUsize::new(0));
        m.lock_shared(None, false).unwrap();

        let g = granted.clone();
        let link = MtxLink::with_callback(move |res| {
            assert_eq!(res, Ok(()));
            g.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(m.lock_exclusive_link(&link, None, false), Err(KError::InProgress));
        assert_eq!(
            m.lock_exclusive_link(&link, None, false),
            Err(KError::InvalidInput)
        );
        assert_eq!(m.waiter_counts(), (1, 0));
        // writers are preferred
        assert_eq!(m.try_lock_shared(), Err(KError::WouldBlock));

        m.unlock();
        assert_eq!(granted.load(Ordering::Relaxed), 1);
        assert_eq!(link.state(), LinkState::CalledBack);
        assert!(m.is_exclusive());
        assert_eq!(m.waiter_counts(), (0, 0));
        assert!(m.is_owned());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn aborting_a_queued_link_reports_nolock() {
        let m = Mtx::new("abort-queued");
        let seen = Arc::new(kspin::SpinRaw::new(None));
        m.lock_exclusive(None, false).unwrap();

        let s = seen.clone();
        let link = MtxLink::with_callback(move |res| *s.lock() = Some(res));
        assert_eq!(m.lock_shared_link(&link, None, false), Err(KError::InProgress));
        assert_eq!(m.waiter_counts(), (0, 1));
        m.abort_link(&link);
        assert_eq!(*seen.lock(), Some(Err(KError::NoLock)));
        assert_eq!(m.waiter_counts(), (0, 0));

        m.unlock();
        assert!(!m.is_locked());
        assert!(m.try_lock_shared().is_ok());
        m.unlock();
    }

    #[test]
    fn free_mutex_is_taken_while_the_queue_is_inspected() {
        let m = Mtx::new("linkspin");
        let inspecting = m.link_spin();
        m.try_lock_exclusive().unwrap();
        drop(inspecting);
        assert!(m.is_owned());
        assert_eq!(m.hold_count(), 1);
        m.unlock();
        assert!(!m.is_locked());
    }
}
