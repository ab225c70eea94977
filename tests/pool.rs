use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eddy::{EventLoop, LoopThreadPool};

mod util;

use util::init;

#[test]
fn round_robin_wraps_over_the_workers() {
    init();

    let base = EventLoop::new().expect("base loop");
    let pool = LoopThreadPool::new(&base, "rr");
    pool.set_thread_num(3);
    pool.start(None).expect("start pool");

    let all = pool.get_all_loops();
    assert_eq!(all.len(), 3);

    let picks: Vec<EventLoop> = (0..6).map(|_| pool.get_next_loop()).collect();
    for i in 0..3 {
        assert_eq!(picks[i], picks[i + 3], "pick {} did not wrap", i);
        assert_ne!(picks[i], base, "worker pick handed out the base loop");
    }
    assert_ne!(picks[0], picks[1]);
    assert_ne!(picks[1], picks[2]);
    assert_ne!(picks[0], picks[2]);
}

#[test]
fn zero_workers_fall_back_to_the_base_loop() {
    init();

    let base = EventLoop::new().expect("base loop");
    let pool = LoopThreadPool::new(&base, "solo");
    pool.start(None).expect("start pool");

    assert_eq!(pool.get_next_loop(), base);
    assert_eq!(pool.get_all_loops(), vec![base.clone()]);
}

#[test]
fn init_callback_runs_once_per_worker_before_start_returns() {
    init();

    let base = EventLoop::new().expect("base loop");
    let pool = LoopThreadPool::new(&base, "init");
    pool.set_thread_num(4);

    let count = Arc::new(AtomicUsize::new(0));
    let loops: Arc<std::sync::Mutex<HashSet<std::thread::ThreadId>>> = Arc::default();
    {
        let count = Arc::clone(&count);
        let loops = Arc::clone(&loops);
        pool.start(Some(Arc::new(move |event_loop: &EventLoop| {
            assert!(event_loop.is_in_loop_thread());
            count.fetch_add(1, Ordering::SeqCst);
            loops.lock().unwrap().insert(std::thread::current().id());
        })))
        .expect("start pool");
    }

    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert_eq!(loops.lock().unwrap().len(), 4);
}

#[test]
fn zero_workers_run_init_on_the_base_loop() {
    init();

    let base = EventLoop::new().expect("base loop");
    let pool = LoopThreadPool::new(&base, "solo-init");

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = Arc::clone(&count);
        let base = base.clone();
        pool.start(Some(Arc::new(move |event_loop: &EventLoop| {
            assert_eq!(*event_loop, base);
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .expect("start pool");
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
