use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use kerrno::KError;
use ktask::{self as thread, AffinityMask, PendingFlags, UnitBuilder, UnitRef, UnitState};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(thread::init_scheduler);
}

fn run_on<T, F>(cpu: usize, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn_on(cpu, f).unwrap().join().unwrap()
}

/// Waits on the host thread until `unit` is blocked.
fn wait_blocked(unit: &UnitRef) {
    let start = Instant::now();
    while unit.state() != UnitState::Blocked {
        assert!(start.elapsed() < Duration::from_secs(5), "unit never blocked");
        std::thread::yield_now();
    }
}

fn wait_dead(unit: &UnitRef) {
    let start = Instant::now();
    while unit.state() != UnitState::Dead {
        assert!(start.elapsed() < Duration::from_secs(5), "unit never exited");
        std::thread::yield_now();
    }
}

#[test]
fn spawn_and_join() {
    init();
    let h = thread::spawn(|| 6 * 7);
    assert_eq!(h.join().unwrap(), 42);

    let on_cpu = run_on(2, || thread::current_cpu_id());
    assert_eq!(on_cpu, Some(2));
}

#[test]
fn join_reports_panics() {
    init();
    let h = thread::spawn(|| panic!("unit body failed"));
    assert!(h.join().is_err());
}

#[test]
fn spawn_rejects_bad_parameters() {
    init();
    assert_eq!(
        thread::spawn_on(thread::ncpus(), || ()).err(),
        Some(KError::InvalidInput)
    );
    assert_eq!(
        UnitBuilder::new().priority(200).spawn(|| ()).err(),
        Some(KError::InvalidInput)
    );
    assert_eq!(
        UnitBuilder::new()
            .cpu(1)
            .affinity(AffinityMask::one_shot(2))
            .spawn(|| ())
            .err(),
        Some(KError::InvalidInput)
    );
}

#[test]
fn nested_spawn_runs_on_parent_cpu() {
    init();
    let cpus = run_on(3, || {
        let child = thread::spawn(|| thread::current_cpu_id());
        (thread::current_cpu_id(), child.join().unwrap())
    });
    assert_eq!(cpus, (Some(3), Some(3)));
}

#[test]
fn wakeup_before_block_is_not_lost() {
    init();
    let res = run_on(1, || {
        thread::sleep_interlock();
        let me = thread::current();
        thread::wakeup(&me).unwrap();
        thread::block_current(None, false)
    });
    assert_eq!(res, Ok(()));
}

#[test]
fn blocked_unit_is_woken() {
    init();
    let ready = Arc::new(AtomicBool::new(false));
    let flag = ready.clone();
    let sleeper = thread::spawn_on(1, move || {
        let mut rounds = 0;
        loop {
            thread::sleep_interlock();
            if flag.load(Ordering::Acquire) {
                break rounds;
            }
            thread::block_current(None, false).unwrap();
            rounds += 1;
        }
    })
    .unwrap();

    let unit = sleeper.unit().unwrap();
    wait_blocked(&unit);
    ready.store(true, Ordering::Release);
    thread::wakeup(&unit).unwrap();
    drop(unit);
    assert!(sleeper.join().unwrap() >= 1);
}

#[test]
fn wakeup_of_dead_unit_fails() {
    init();
    let unit = run_on(2, thread::current);
    wait_dead(&unit);
    assert_eq!(thread::wakeup(&unit), Err(KError::NoSuchProcess));
    assert_eq!(thread::signal(&unit), Err(KError::NoSuchProcess));
    assert_eq!(thread::set_priority(&unit, 3), Err(KError::NoSuchProcess));
}

#[test]
fn block_times_out() {
    init();
    let (res, waited) = run_on(1, || {
        let start = thread::now_ns();
        thread::sleep_interlock();
        let res = thread::block_current(Some(thread::deadline_after(Duration::from_millis(20))), false);
        (res, thread::now_ns() - start)
    });
    assert_eq!(res, Err(KError::WouldBlock));
    assert!(waited >= 20_000_000);
}

#[test]
fn signal_interrupts_interruptible_wait() {
    init();
    let h = thread::spawn_on(2, || {
        thread::sleep_interlock();
        thread::block_current(None, true)
    })
    .unwrap();
    let unit = h.unit().unwrap();
    wait_blocked(&unit);
    thread::signal(&unit).unwrap();
    drop(unit);
    assert_eq!(h.join().unwrap(), Err(KError::Interrupted));
}

#[test]
fn signal_stays_pending_across_uninterruptible_wait() {
    init();
    let h = thread::spawn_on(3, || {
        thread::sleep_interlock();
        let first = thread::block_current(
            Some(thread::deadline_after(Duration::from_millis(50))),
            false,
        );
        thread::sleep_interlock();
        let second = thread::block_current(None, true);
        (first, second)
    })
    .unwrap();
    let unit = h.unit().unwrap();
    wait_blocked(&unit);
    thread::signal(&unit).unwrap();
    drop(unit);
    assert_eq!(
        h.join().unwrap(),
        (Err(KError::WouldBlock), Err(KError::Interrupted))
    );
}

#[test]
fn sleep_waits_at_least_the_duration() {
    init();
    let waited = run_on(0, || {
        let start = thread::now_ns();
        thread::sleep(Duration::from_millis(15));
        thread::now_ns() - start
    });
    assert!(waited >= 15_000_000);
}

#[test]
fn migrate_moves_to_target() {
    init();
    let h = UnitBuilder::new()
        .name("mover")
        .cpu(0)
        .spawn(|| {
            let before = thread::current_cpu_id();
            thread::migrate_self(3).unwrap();
            let after = thread::current_cpu_id();
            thread::yield_now();
            (before, after, thread::current().owning_cpu())
        })
        .unwrap();
    assert_eq!(h.join().unwrap(), (Some(0), Some(3), 3));
}

#[test]
fn migrate_respects_affinity() {
    init();
    let res = UnitBuilder::new()
        .cpu(1)
        .affinity(AffinityMask::one_shot(1))
        .spawn(|| {
            (
                thread::migrate_self(2),
                thread::migrate_self(64),
                thread::migrate_self(1),
            )
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(
        res,
        (Err(KError::InvalidInput), Err(KError::InvalidInput), Ok(()))
    );
}

#[test]
fn higher_priority_spawn_preempts_at_preempt_point() {
    init();
    let order = run_on(2, || {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let high = UnitBuilder::new()
            .priority(thread::PRIO_KERNEL)
            .spawn(move || o.lock().unwrap().push("high"))
            .unwrap();
        assert!(thread::this_cpu().pending().contains(PendingFlags::RESCHED));
        thread::preempt_point();
        order.lock().unwrap().push("low");
        high.join().unwrap();
        let order = order.lock().unwrap().clone();
        order
    });
    assert_eq!(order, ["high", "low"]);
}

#[test]
fn set_priority_validates_and_applies() {
    init();
    let prio = run_on(1, || {
        let me = thread::current();
        assert_eq!(thread::set_priority(&me, 32), Err(KError::InvalidInput));
        thread::set_priority(&me, thread::PRIO_KERNEL).unwrap();
        me.priority()
    });
    assert_eq!(prio, thread::PRIO_KERNEL);

    let idle = thread::cpu(0).idle().clone();
    assert_eq!(thread::set_priority(&idle, 5), Err(KError::InvalidInput));
}

#[test]
fn run_on_cpu_executes_on_target() {
    init();
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let s = seen.clone();
    thread::run_on_cpu(2, move || {
        s.store(thread::current_cpu_id().unwrap_or(99), Ordering::Release)
    })
    .unwrap();
    let start = Instant::now();
    while seen.load(Ordering::Acquire) == usize::MAX {
        assert!(start.elapsed() < Duration::from_secs(5));
        std::thread::yield_now();
    }
    assert_eq!(seen.load(Ordering::Acquire), 2);
    assert_eq!(
        thread::run_on_cpu(thread::ncpus(), || ()),
        Err(KError::InvalidInput)
    );
}

#[test]
fn run_on_each_cpu_reaches_all() {
    init();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let h = hits.clone();
    thread::run_on_each_cpu(move || h.lock().unwrap().push(thread::current_cpu_id()));
    let start = Instant::now();
    while hits.lock().unwrap().len() < thread::ncpus() {
        assert!(start.elapsed() < Duration::from_secs(5));
        std::thread::yield_now();
    }
    let mut cpus: Vec<_> = hits.lock().unwrap().iter().map(|c| c.unwrap()).collect();
    cpus.sort();
    assert_eq!(cpus, (0..thread::ncpus()).collect::<Vec<_>>());
}

#[test]
fn registry_lists_live_units() {
    init();
    let h = thread::spawn_on(3, || {
        thread::sleep_interlock();
        let _ = thread::block_current(None, false);
    })
    .unwrap();
    let unit = h.unit().unwrap();
    wait_blocked(&unit);
    assert!(thread::all_units(3).iter().any(|u| u.id() == h.id()));
    thread::wakeup(&unit).unwrap();
    drop(unit);
    h.join().unwrap();
}

#[test]
fn yield_outside_unit_is_harmless() {
    init();
    thread::yield_now();
    thread::preempt_point();
    assert!(thread::try_current().is_none());
    assert_ne!(thread::current_id(), 0);
    assert_eq!(thread::current_id(), thread::current_id());
}

#[test]
fn hardclock_ticks() {
    init();
    let before = thread::cpu(1).ticks();
    std::thread::sleep(Duration::from_millis(60));
    assert!(thread::cpu(1).ticks() > before);
}

#[test]
fn block_on_parks_until_woken() {
    init();
    let ready = Arc::new(AtomicBool::new(false));
    let slot: Arc<Mutex<Option<std::task::Waker>>> = Arc::new(Mutex::new(None));

    let (r, s) = (ready.clone(), slot.clone());
    let h = thread::spawn_on(2, move || {
        thread::future::block_on(std::future::poll_fn(|cx| {
            if r.load(Ordering::Acquire) {
                return std::task::Poll::Ready(7);
            }
            *s.lock().unwrap() = Some(cx.waker().clone());
            std::task::Poll::Pending
        }))
    })
    .unwrap();
    let unit = h.unit().unwrap();
    wait_blocked(&unit);

    ready.store(true, Ordering::Release);
    if let Some(w) = slot.lock().unwrap().take() {
        w.wake();
    }
    assert_eq!(h.join().unwrap(), 7);
}

#[test]
fn block_on_timeout_gives_up() {
    init();
    let res = run_on(1, || {
        thread::future::block_on_timeout(
            std::future::pending::<()>(),
            thread::deadline_after(Duration::from_millis(10)),
            false,
        )
    });
    assert_eq!(res, Err(KError::WouldBlock));
}

#[test]
fn all_units_races_with_exiting_units() {
    init();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    let churn = thread::spawn_on(2, move || {
        for _ in 0..300 {
            let h = thread::spawn(|| thread::yield_now());
            h.join().unwrap();
        }
        d.store(true, Ordering::Release);
    })
    .unwrap();

    let churn_id = churn.id();
    let mut scans = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        for u in thread::all_units(2) {
            assert_ne!(u.id(), 0);
        }
        scans += 1;
        if finished {
            break;
        }
    }
    churn.join().unwrap();
    assert!(scans > 0);
    wait_for_exit_sweep(churn_id);
}

/// Waits until `id` no longer shows up in the registry of CPU 2.
fn wait_for_exit_sweep(id: u64) {
    let start = Instant::now();
    while thread::all_units(2).iter().any(|u| u.id() == id) {
        assert!(start.elapsed() < Duration::from_secs(5), "exited unit still listed");
        std::thread::yield_now();
    }
}

#[test]
fn quantum_expiry_rotates_equal_priority_units() {
    init();
    const PRIO: u8 = thread::PRIO_NORMAL + 2;
    let turns = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let start_ticks = thread::cpu(1).ticks();

    let spinners: Vec<_> = (0..2)
        .map(|me| {
            let turns = turns.clone();
            UnitBuilder::new()
                .name(format!("spinner{me}"))
                .cpu(1)
                .priority(PRIO)
                .spawn(move || {
                    // never blocks: only a quantum expiry lets the other one run
                    let give_up = Instant::now() + Duration::from_secs(5);
                    loop {
                        turns[me].fetch_add(1, Ordering::Relaxed);
                        if turns[1 - me].load(Ordering::Relaxed) > 0 {
                            return true;
                        }
                        if Instant::now() > give_up {
                            return false;
                        }
                        std::hint::spin_loop();
                        thread::preempt_point();
                    }
                })
                .unwrap()
        })
        .collect();
    for s in spinners {
        assert!(s.join().unwrap(), "equal-priority unit starved");
    }
    assert!(turns.iter().all(|t| t.load(Ordering::Relaxed) > 0));
    let used = thread::cpu(1).ticks() - start_ticks;
    assert!(used <= 100, "rotation took {used} ticks");
}
