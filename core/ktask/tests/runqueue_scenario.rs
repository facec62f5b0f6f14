use std::sync::Once;

use ktask::{self as thread, Unit, UnitRef};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(thread::init_scheduler);
}

fn ids(units: &[UnitRef]) -> Vec<u64> {
    units.iter().map(|u| u.id()).collect()
}

#[test]
fn equal_priority_units_run_in_fifo_order() {
    init();
    thread::spawn_on(0, || {
        let _crit = thread::crit_enter();
        let cpu = thread::this_cpu();
        assert_eq!(cpu.counters().snapshot().runq_depth, 0);

        let units: Vec<UnitRef> = ["a", "b", "c"]
            .into_iter()
            .map(|name| Unit::new_detached(name, 5, 0))
            .collect();
        for u in &units {
            cpu.enqueue(u.clone());
        }
        let snap = cpu.counters().snapshot();
        assert_eq!(snap.runq_depth, 3);
        assert_eq!(snap.queue_mask, 1 << 5);

        let picked: Vec<UnitRef> = (0..3).map(|_| cpu.pick_next()).collect();
        assert_eq!(ids(&picked), ids(&units));
        let snap = cpu.counters().snapshot();
        assert_eq!(snap.runq_depth, 0);
        assert_eq!(snap.queue_mask, 0);

        assert!(cpu.pick_next().is_idle());
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn dequeue_removes_only_the_named_unit() {
    init();
    thread::spawn_on(1, || {
        let _crit = thread::crit_enter();
        let cpu = thread::this_cpu();
        let low = Unit::new_detached("low", 3, 1);
        let high = Unit::new_detached("high", 9, 1);
        cpu.enqueue(low.clone());
        cpu.enqueue(high.clone());
        assert_eq!(cpu.counters().snapshot().queue_mask, (1 << 3) | (1 << 9));

        assert!(cpu.dequeue(&high));
        assert!(!cpu.dequeue(&high));
        assert_eq!(cpu.counters().snapshot().queue_mask, 1 << 3);
        assert_eq!(cpu.pick_next().id(), low.id());
        assert!(cpu.pick_next().is_idle());
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
#[should_panic(expected = "touched from")]
fn remote_enqueue_is_rejected() {
    init();
    let unit = Unit::new_detached("stray", 5, 2);
    thread::cpu(2).enqueue(unit);
}
