use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::*;

/// A round-robin scheduler for the tests.
#[derive(Default)]
struct RoundRobin {
    run_queue: VecDeque<ThreadId>,
}

impl RoundRobin {
    fn wake(&mut self, thread_id: ThreadId) {
        self.run_queue.push_back(thread_id);
    }
}

impl Scheduler for RoundRobin {
    fn choose_next_thread(&mut self) -> Option<ThreadId> {
        if let Some(thread_id) = self.run_queue.pop_front() {
            self.run_queue.push_back(thread_id);
            Some(thread_id)
        } else {
            None
        }
    }

    fn thread_exited(&mut self, thread_id: ThreadId) {
        self.run_queue.retain(|&t| t != thread_id);
    }
}

#[test]
fn single_thread_runs() {
    let (group, join_handle) = ThreadGroup::new(RoundRobin::default());
    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::clone(&counter);

    let group2 = group.clone();
    let mut lock = group.lock();
    let tid = lock.spawn(move |_| {
        counter2.fetch_add(1, Ordering::Relaxed);
        group2.lock().shutdown();
    });
    lock.scheduler().wake(tid);
    lock.start();
    drop(lock);

    join_handle.join().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn threads_interleave_at_yield_points() {
    let (group, join_handle) = ThreadGroup::new(RoundRobin::default());
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut lock = group.lock();
    let mut tids = Vec::new();
    for i in 0..3 {
        let log = Arc::clone(&log);
        let group = group.clone();
        let tid = lock.spawn(move |_| {
            for step in 0..2 {
                log.lock().unwrap().push((i, step));
                yield_now();
            }
            if i == 2 {
                group.lock().shutdown();
            }
            exit_thread();
        });
        tids.push(tid);
    }
    for &tid in &tids {
        lock.scheduler().wake(tid);
    }
    lock.start();
    drop(lock);

    join_handle.join().unwrap();

    // Round-robin order: each thread runs one step per revolution
    let log = log.lock().unwrap();
    assert_eq!(
        &log[..6],
        &[(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]
    );
}

#[test]
fn worker_panic_propagates() {
    let (group, join_handle) = ThreadGroup::new(RoundRobin::default());

    let mut lock = group.lock();
    let tid = lock.spawn(|_| panic!("boom"));
    lock.scheduler().wake(tid);
    lock.start();
    drop(lock);

    let err = join_handle.join().unwrap_err();
    assert_eq!(*err.downcast_ref::<&str>().unwrap(), "boom");
}

#[test]
fn no_runnable_thread_is_reported() {
    let (group, join_handle) = ThreadGroup::new(RoundRobin::default());

    let mut lock = group.lock();
    let tid = lock.spawn(|_| {
        // Exit without waking anyone else
        exit_thread();
    });
    lock.scheduler().wake(tid);
    lock.start();
    drop(lock);

    // The scheduler has nothing to run and the group isn't shutting down
    assert!(join_handle.join().is_err());
}
