//! Priority inheritance: while a high-priority task waits for a mutex, the
//! owner runs at the waiter's priority, and falls back the moment it
//! unlocks. Also covers lock/unlock idempotence, the deadlock precheck,
//! and recursive mutexes.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{LockMutexError, TryLockMutexError},
    MutexCb, System, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static MTX: MutexCb<SystemTraits> = MutexCb::new();
static RECURSIVE_MTX: MutexCb<SystemTraits> = MutexCb::new_recursive();

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(5)
    .with_auto_start(true);

static HIGH_TASK: TaskCb<SystemTraits> = TaskCb::new(&HIGH_ATTR);
static HIGH_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(high_body).with_priority(3);

static LOW_TASK: TaskCb<SystemTraits> = TaskCb::new(&LOW_ATTR);
static LOW_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(low_body).with_priority(1);

fn self_effective_priority() -> u8 {
    System::<SystemTraits>::current_task()
        .unwrap()
        .effective_priority()
        .unwrap()
}

fn driver_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    LOW_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    // `LOW_TASK` now owns `MTX` and was preempted by our wakeup
    SEQ.expect_and_replace(3, 4);
    assert_eq!(LOW_TASK.effective_priority().unwrap(), 1);

    HIGH_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    SEQ.expect_and_replace(9, 10);

    // Lock/unlock by an uncontended task is a no-op on all state,
    // including our own priority
    let base = self_effective_priority();
    MTX.lock().unwrap();
    MTX.unlock().unwrap();
    assert_eq!(self_effective_priority(), base);
    assert_eq!(MTX.is_locked().unwrap(), false);

    // Relocking a non-recursive mutex deadlocks immediately
    MTX.lock().unwrap();
    assert_eq!(MTX.lock(), Err(LockMutexError::Deadlock));
    assert_eq!(MTX.try_lock(), Err(TryLockMutexError::Deadlock));
    MTX.unlock().unwrap();

    // A recursive mutex maintains a lock count instead
    RECURSIVE_MTX.lock().unwrap();
    RECURSIVE_MTX.lock().unwrap();
    RECURSIVE_MTX.unlock().unwrap();
    assert_eq!(RECURSIVE_MTX.is_locked().unwrap(), true);
    RECURSIVE_MTX.unlock().unwrap();
    assert_eq!(RECURSIVE_MTX.is_locked().unwrap(), false);

    TEST_UTIL.success::<SystemTraits>();
}

fn low_body(_: usize) {
    SEQ.expect_and_replace(1, 2);
    MTX.lock().unwrap();
    SEQ.expect_and_replace(2, 3);

    // Wake the driver while still inside the critical section
    port::advance_time::<SystemTraits>(20);

    // `HIGH_TASK` is blocked on `MTX` by now; we inherited its priority
    SEQ.expect_and_replace(5, 6);
    assert_eq!(self_effective_priority(), 3);

    // Unlocking hands the mutex to `HIGH_TASK` and immediately yields to
    // it, since our own priority falls back to 1
    MTX.unlock().unwrap();

    SEQ.expect_and_replace(8, 9);
    assert_eq!(self_effective_priority(), 1);
}

fn high_body(_: usize) {
    SEQ.expect_and_replace(4, 5);
    MTX.lock().unwrap();

    SEQ.expect_and_replace(6, 7);
    assert_eq!(MTX.is_locked().unwrap(), true);
    assert_eq!(self_effective_priority(), 3);

    MTX.unlock().unwrap();
    SEQ.expect_and_replace(7, 8);
}

#[test]
fn mutex_priority_inheritance() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
