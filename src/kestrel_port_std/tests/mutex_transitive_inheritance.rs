//! Transitive priority inheritance: a raise received through one mutex
//! propagates along the chain of blocked owners.
//!
//! `T1` holds `MTX1` and is blocked acquiring `MTX2`, held by `T0`. When
//! `T3` tries to lock `MTX1`, both `T1` and `T0` must inherit `T3`'s
//! priority; the chain then unwinds in order.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{MutexCb, System, TaskAttr, TaskCb};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static MTX1: MutexCb<SystemTraits> = MutexCb::new();
static MTX2: MutexCb<SystemTraits> = MutexCb::new();

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(6)
    .with_auto_start(true);

static T0_TASK: TaskCb<SystemTraits> = TaskCb::new(&T0_ATTR);
static T0_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(t0_body).with_priority(1);

static T1_TASK: TaskCb<SystemTraits> = TaskCb::new(&T1_ATTR);
static T1_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(t1_body).with_priority(2);

static T3_TASK: TaskCb<SystemTraits> = TaskCb::new(&T3_ATTR);
static T3_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(t3_body).with_priority(4);

fn self_effective_priority() -> u8 {
    System::<SystemTraits>::current_task()
        .unwrap()
        .effective_priority()
        .unwrap()
}

fn driver_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    T0_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    // `T0` owns `MTX2`
    SEQ.expect_and_replace(2, 3);
    T1_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    // `T1` owns `MTX1` and is blocked acquiring `MTX2`; `T0` inherited
    // `T1`'s priority
    SEQ.expect_and_replace(6, 7);
    assert_eq!(T1_TASK.effective_priority().unwrap(), 2);
    assert_eq!(T0_TASK.effective_priority().unwrap(), 2);

    T3_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    SEQ.expect_and_replace(14, 15);
    TEST_UTIL.success::<SystemTraits>();
}

fn t0_body(_: usize) {
    SEQ.expect_and_replace(1, 2);
    MTX2.lock().unwrap();

    // Wake the driver while holding `MTX2`
    port::advance_time::<SystemTraits>(20);

    // `T1` blocked on `MTX2`; its priority flowed to us
    SEQ.expect_and_replace(5, 6);
    assert_eq!(self_effective_priority(), 2);

    // Wake the driver again so it can start `T3`
    port::advance_time::<SystemTraits>(20);

    // `T3` blocked on `MTX1` whose owner (`T1`) is blocked on `MTX2`; the
    // raise reached us through the chain
    SEQ.expect_and_replace(8, 9);
    assert_eq!(self_effective_priority(), 4);

    // Releasing `MTX2` hands it to `T1`, which immediately preempts us
    MTX2.unlock().unwrap();

    SEQ.expect_and_replace(13, 14);
    assert_eq!(self_effective_priority(), 1);
}

fn t1_body(_: usize) {
    SEQ.expect_and_replace(3, 4);
    MTX1.lock().unwrap();
    SEQ.expect_and_replace(4, 5);

    // Blocks; `T0` inherits priority 2
    MTX2.lock().unwrap();

    // Woken by `T0`'s unlock; we hold both mutexes and still inherit 4
    // from `T3`, which is blocked on `MTX1`
    SEQ.expect_and_replace(9, 10);
    assert_eq!(self_effective_priority(), 4);

    // Releasing `MTX1` hands it to `T3`, which immediately preempts us
    MTX1.unlock().unwrap();

    SEQ.expect_and_replace(12, 13);
    assert_eq!(self_effective_priority(), 2);
    MTX2.unlock().unwrap();
}

fn t3_body(_: usize) {
    SEQ.expect_and_replace(7, 8);

    // `T1` (the owner) is itself blocked on `MTX2`; the raise must
    // propagate to `T0` transitively
    MTX1.lock().unwrap();

    SEQ.expect_and_replace(10, 11);
    assert_eq!(self_effective_priority(), 4);
    MTX1.unlock().unwrap();
    SEQ.expect_and_replace(11, 12);
}

#[test]
fn mutex_transitive_inheritance() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
