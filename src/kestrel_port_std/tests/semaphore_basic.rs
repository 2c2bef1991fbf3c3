//! Counting semaphore basics: give/take round trips, overflow detection,
//! and an interrupt-mode give waking a blocked task.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{PollError, SignalSemaphoreError, WaitTimeoutError},
    SemaphoreCb, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, WAITER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0, 10);
static SMALL_SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0, 2);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static WAITER_TASK: TaskCb<SystemTraits> = TaskCb::new(&WAITER_ATTR);
static WAITER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(waiter_body)
    .with_priority(2)
    .with_auto_start(true);

fn isr_give() {
    SEM.give().unwrap();
}

fn waiter_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Woken by the interrupt-mode give
    SEM.wait().unwrap();
    SEQ.expect_and_replace(2, 3);
}

fn driver_body(_: usize) {
    // The waiter has blocked
    SEQ.expect_and_replace(1, 2);
    port::pend_software_interrupt::<SystemTraits>(isr_give);

    // The give woke the waiter, which preempted us and finished
    SEQ.expect_and_replace(3, 4);
    assert_eq!(SEM.value().unwrap(), 0);

    // `give` then `take` is a no-op on the counter
    let v0 = SEM.value().unwrap();
    SEM.give().unwrap();
    SEM.take().unwrap();
    assert_eq!(SEM.value().unwrap(), v0);

    // `take` and a zero-length wait fail on an empty semaphore
    assert_eq!(SEM.take(), Err(PollError::Timeout));
    assert_eq!(SEM.wait_for(0), Err(WaitTimeoutError::Timeout));

    // The counter saturates at its maximum
    SMALL_SEM.give().unwrap();
    SMALL_SEM.give().unwrap();
    assert_eq!(SMALL_SEM.give(), Err(SignalSemaphoreError::Overflow));
    assert_eq!(
        SMALL_SEM.give_many(1),
        Err(SignalSemaphoreError::Overflow)
    );
    assert_eq!(SMALL_SEM.value().unwrap(), 2);

    // `give_many` deposits permits that aren't consumed by waiters
    SEM.give_many(3).unwrap();
    assert_eq!(SEM.value().unwrap(), 3);
    SEM.take().unwrap();
    SEM.take().unwrap();
    SEM.take().unwrap();

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn semaphore_basic() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
