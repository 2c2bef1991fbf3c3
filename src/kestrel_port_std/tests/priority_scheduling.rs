//! Strict priority scheduling: waiters on a semaphore are released in
//! priority order, equal priorities run in FIFO order, and `yield_now`
//! rotates the caller to the back of its priority class.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{SemaphoreCb, System, TaskAttr, TaskCb};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0, 10);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(3)
    .with_auto_start(true);

static HIGH_TASK: TaskCb<SystemTraits> = TaskCb::new(&HIGH_ATTR);
static HIGH_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(high_body).with_priority(2);

static LOW_TASK: TaskCb<SystemTraits> = TaskCb::new(&LOW_ATTR);
static LOW_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(low_body).with_priority(1);

static EQ_A_TASK: TaskCb<SystemTraits> = TaskCb::new(&EQ_A_ATTR);
static EQ_A_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(eq_a_body).with_priority(2);

static EQ_B_TASK: TaskCb<SystemTraits> = TaskCb::new(&EQ_B_ATTR);
static EQ_B_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(eq_b_body).with_priority(2);

fn driver_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    HIGH_TASK.activate().unwrap();
    LOW_TASK.activate().unwrap();

    // Let both tasks run and block on the semaphore
    System::<SystemTraits>::sleep_for(10).unwrap();

    SEQ.expect_and_replace(3, 4);

    // Release two permits while still running at the highest priority:
    // neither waiter preempts us yet
    SEM.give().unwrap();
    SEM.give().unwrap();
    SEQ.expect_and_replace(4, 5);

    // The high-priority waiter must run to completion before the
    // low-priority one becomes current
    System::<SystemTraits>::sleep_for(10).unwrap();
    SEQ.expect_and_replace(9, 10);
    assert_eq!(SEM.value().unwrap(), 0);

    // FIFO within a priority class: `EQ_A` was activated first and runs
    // first; `yield_now` rotates between them
    EQ_A_TASK.activate().unwrap();
    EQ_B_TASK.activate().unwrap();
    System::<SystemTraits>::sleep_for(10).unwrap();

    SEQ.expect_and_replace(14, 15);
    TEST_UTIL.success::<SystemTraits>();
}

fn high_body(_: usize) {
    SEQ.expect_and_replace(1, 2);
    SEM.wait().unwrap();
    SEQ.expect_and_replace(5, 6);
    SEQ.expect_and_replace(6, 7);
}

fn low_body(_: usize) {
    SEQ.expect_and_replace(2, 3);
    SEM.wait().unwrap();
    SEQ.expect_and_replace(7, 8);
    SEQ.expect_and_replace(8, 9);
}

fn eq_a_body(_: usize) {
    SEQ.expect_and_replace(10, 11);
    System::<SystemTraits>::yield_now().unwrap();
    SEQ.expect_and_replace(12, 13);
}

fn eq_b_body(_: usize) {
    SEQ.expect_and_replace(11, 12);
    System::<SystemTraits>::yield_now().unwrap();
    SEQ.expect_and_replace(13, 14);
}

#[test]
fn priority_scheduling() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
