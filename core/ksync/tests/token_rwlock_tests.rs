use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use kerrno::KError;
use ksync::TokenRwLock;
use ktask::{self as thread, JoinHandle, UnitState};

static INIT: Once = Once::new();

fn may_interrupt() {
    // simulate interrupts
    if fastrand::u8(0..3) == 0 {
        thread::yield_now();
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_blocked<T>(h: &JoinHandle<T>) {
    wait_for("unit to block", || {
        h.unit().is_some_and(|u| u.state() == UnitState::Blocked)
    });
}

#[test]
fn exclusive_holders_never_overlap() {
    INIT.call_once(thread::init_scheduler);

    const NUM_TASKS: usize = 8;
    const NUM_ITERS: usize = 500;
    static LOCK: TokenRwLock = TokenRwLock::new();
    static INSIDE: AtomicBool = AtomicBool::new(false);
    static TOTAL: AtomicUsize = AtomicUsize::new(0);

    let handles: Vec<_> = (0..NUM_TASKS)
        .map(|i| {
            thread::spawn_on(i % thread::ncpus(), || {
                for n in 0..NUM_ITERS {
                    LOCK.exclusive_lock();
                    assert!(!INSIDE.swap(true, Ordering::AcqRel));
                    if n % 7 == 0 {
                        LOCK.exclusive_lock();
                        assert_eq!(LOCK.hold_count(), 2);
                        LOCK.exclusive_unlock();
                    }
                    TOTAL.fetch_add(1, Ordering::Relaxed);
                    may_interrupt();
                    INSIDE.store(false, Ordering::Release);
                    LOCK.exclusive_unlock();
                    may_interrupt();
                }
            })
            .unwrap()
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(TOTAL.load(Ordering::Relaxed), NUM_TASKS * NUM_ITERS);
    assert!(!LOCK.is_locked());
}

#[test]
fn writer_waits_for_readers() {
    INIT.call_once(thread::init_scheduler);

    let lock = Arc::new(TokenRwLock::new());
    let wrote = Arc::new(AtomicBool::new(false));
    lock.shared_lock();

    let (l, w) = (lock.clone(), wrote.clone());
    let writer = thread::spawn_on(1, move || {
        l.exclusive_lock();
        w.store(true, Ordering::Release);
        l.exclusive_unlock();
    })
    .unwrap();

    // readers still get in while nobody holds it exclusively
    lock.try_shared_lock().unwrap();
    lock.shared_unlock();
    std::thread::sleep(Duration::from_millis(20));
    assert!(!wrote.load(Ordering::Acquire));

    lock.shared_unlock();
    writer.join().unwrap();
    assert!(wrote.load(Ordering::Acquire));
    assert!(!lock.is_locked());
}

#[test]
fn readers_wait_for_writer() {
    INIT.call_once(thread::init_scheduler);

    let lock = Arc::new(TokenRwLock::new());
    let readers_in = Arc::new(AtomicUsize::new(0));
    lock.exclusive_lock();

    let readers: Vec<_> = (1..4)
        .map(|cpu| {
            let (l, r) = (lock.clone(), readers_in.clone());
            thread::spawn_on(cpu, move || {
                l.shared_lock();
                r.fetch_add(1, Ordering::AcqRel);
                // everyone gets in together
                while r.load(Ordering::Acquire) < 3 {
                    thread::sleep(Duration::from_millis(1));
                }
                l.shared_unlock();
            })
            .unwrap()
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(readers_in.load(Ordering::Acquire), 0);
    lock.exclusive_unlock();

    wait_for("readers", || readers_in.load(Ordering::Acquire) == 3);
    for r in readers {
        r.join().unwrap();
    }
    assert!(!lock.is_locked());
}

#[test]
fn timed_out_writer_does_not_strand_the_next_one() {
    INIT.call_once(thread::init_scheduler);

    let lock = Arc::new(TokenRwLock::new());
    lock.shared_lock();

    let l = lock.clone();
    let impatient = thread::spawn_on(1, move || {
        let start = thread::now_ns();
        let res = l.exclusive_lock_timeout(Some(Duration::from_millis(20)), false);
        (res, thread::now_ns() - start)
    })
    .unwrap();
    let l = lock.clone();
    let patient = thread::spawn_on(2, move || {
        l.exclusive_lock();
        l.exclusive_unlock();
    })
    .unwrap();
    wait_blocked(&patient);

    let (res, waited) = impatient.join().unwrap();
    assert_eq!(res, Err(KError::WouldBlock));
    assert!(waited >= 20_000_000);

    lock.shared_unlock();
    patient.join().unwrap();
    assert!(!lock.is_locked());
}

#[test]
fn signal_interrupts_waiting_writer() {
    INIT.call_once(thread::init_scheduler);

    let lock = Arc::new(TokenRwLock::new());
    lock.exclusive_lock();

    let l = lock.clone();
    let writer = thread::spawn_on(3, move || l.exclusive_lock_timeout(None, true)).unwrap();
    wait_blocked(&writer);
    thread::signal(&writer.unit().unwrap()).unwrap();
    assert_eq!(writer.join().unwrap(), Err(KError::Interrupted));

    // the lock is still ours, and a later reader gets in once it is released
    assert!(lock.is_exclusively_held());
    let l = lock.clone();
    let reader = thread::spawn_on(3, move || {
        l.shared_lock_timeout(Some(Duration::from_secs(5)), true)?;
        l.shared_unlock();
        Ok::<_, KError>(())
    })
    .unwrap();
    wait_blocked(&reader);
    lock.exclusive_unlock();
    assert_eq!(reader.join().unwrap(), Ok(()));
    assert!(!lock.is_locked());
}
