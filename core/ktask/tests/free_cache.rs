use std::{sync::Once, time::Duration};

use ktask::{self as thread, UnitState};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(thread::init_scheduler);
}

#[test]
fn exited_units_are_recycled_locally() {
    init();
    let (cached, after_spawn, reused_id_is_fresh) = thread::spawn_on(3, || {
        let mut last_id = 0;
        for n in 0..4 {
            let child = thread::spawn(move || n * 2);
            last_id = last_id.max(child.id());
            assert_eq!(child.join().unwrap(), n * 2);
        }
        thread::sleep(Duration::from_millis(20));
        let cpu = thread::this_cpu();
        let cached = cpu.free_cache_len();

        let blocker = thread::spawn(|| {
            thread::sleep_interlock();
            let _ = thread::block_current(None, false);
        });
        let after_spawn = cpu.free_cache_len();
        let unit = blocker.unit().unwrap();
        let fresh = blocker.id() > last_id;
        while unit.state() != UnitState::Blocked {
            thread::yield_now();
        }
        thread::wakeup(&unit).unwrap();
        drop(unit);
        blocker.join().unwrap();
        (cached, after_spawn, fresh)
    })
    .unwrap()
    .join()
    .unwrap();

    assert!(cached >= 1);
    assert!(cached <= thread::KtaskConfig::default().free_cache);
    assert_eq!(after_spawn, cached - 1);
    assert!(reused_id_is_fresh);
}
