//! Event flags, signals, barriers, and condition variables.
mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::PollError,
    BarrierCb, CondVarCb, EventGroupCb, EventWaitFlags, MutexCb, SignalCb, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, HELPER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static EVENTS: EventGroupCb<SystemTraits> = EventGroupCb::new(0);
static SIGNAL: SignalCb<SystemTraits> = SignalCb::new();
static BARRIER: BarrierCb<SystemTraits> = BarrierCb::new(2);
static MTX: MutexCb<SystemTraits> = MutexCb::new();
static CONDVAR: CondVarCb<SystemTraits> = CondVarCb::new();

static CONDITION: AtomicBool = AtomicBool::new(false);
static BARRIER_RELEASES: AtomicUsize = AtomicUsize::new(0);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static HELPER_TASK: TaskCb<SystemTraits> = TaskCb::new(&HELPER_ATTR);
static HELPER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(helper_body)
    .with_priority(2)
    .with_auto_start(true);

fn helper_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Wait for *all* of bits 0b11, clearing them on success
    let observed = EVENTS
        .wait(0b11, EventWaitFlags::ALL | EventWaitFlags::CLEAR)
        .unwrap();
    assert_eq!(observed, 0b111);
    SEQ.expect_and_replace(3, 4);

    // Latching signal
    SIGNAL.wait().unwrap();
    SEQ.expect_and_replace(5, 6);
    // The signal stays set until cleared, releasing later waits instantly
    SIGNAL.wait().unwrap();
    SIGNAL.clear().unwrap();
    assert_eq!(SIGNAL.take(), Err(PollError::Timeout));

    // Barrier: we arrive first and wait for the driver
    SEQ.expect_and_replace(6, 7);
    BARRIER.wait().unwrap();
    BARRIER_RELEASES.fetch_add(1, Ordering::SeqCst);
    SEQ.expect_and_replace(8, 9);

    // Condition variable: the wait releases the mutex and re-acquires it
    // once notified
    MTX.lock().unwrap();
    SEQ.expect_and_replace(9, 10);
    while !CONDITION.load(Ordering::SeqCst) {
        CONDVAR.wait(&MTX).unwrap();
    }
    assert_eq!(MTX.is_locked().unwrap(), true);
    MTX.unlock().unwrap();

    SEQ.expect_and_replace(12, 13);
    TEST_UTIL.success::<SystemTraits>();
}

fn driver_body(_: usize) {
    // The helper is waiting for both event bits
    SEQ.expect_and_replace(1, 2);

    // Setting a strict subset doesn't wake the helper
    EVENTS.set(0b001).unwrap();
    assert_eq!(EVENTS.get().unwrap(), 0b001);
    SEQ.expect_and_replace(2, 3);

    // An unrelated bit set together with the missing one completes the
    // condition; the matched bits are cleared
    EVENTS.set(0b110).unwrap();
    // (the helper preempted us here)
    assert_eq!(EVENTS.get().unwrap(), 0b100);

    SEQ.expect_and_replace(4, 5);
    SIGNAL.give().unwrap();

    // The helper consumed the signal path and is now gathered at the
    // barrier
    SEQ.expect_and_replace(7, 8);
    assert_eq!(BARRIER.waiting().unwrap(), 1);
    BARRIER.wait().unwrap();
    BARRIER_RELEASES.fetch_add(1, Ordering::SeqCst);
    // Opening the barrier woke the helper; it ran to its condvar wait
    assert_eq!(BARRIER_RELEASES.load(Ordering::SeqCst), 2);

    SEQ.expect_and_replace(10, 11);
    MTX.lock().unwrap();
    CONDITION.store(true, Ordering::SeqCst);
    // The helper can't return from `wait` until we release the mutex
    CONDVAR.notify_one().unwrap();
    SEQ.expect_and_replace(11, 12);
    MTX.unlock().unwrap();
    // The helper re-acquired the mutex, finished, and shut the system down
}

#[test]
fn sync_primitives() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
