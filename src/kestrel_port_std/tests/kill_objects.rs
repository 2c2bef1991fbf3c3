//! Killing a waitable object wakes every current waiter with `Stopped` and
//! leaves the object in its reset state; `kill` is idempotent.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{LockMutexError, WaitError},
    MutexCb, SemaphoreCb, System, TaskAttr, TaskCb,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, VICTIM_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0, 10);
static MTX: MutexCb<SystemTraits> = MutexCb::new();

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static VICTIM_TASK: TaskCb<SystemTraits> = TaskCb::new(&VICTIM_ATTR);
static VICTIM_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(victim_body)
    .with_priority(2)
    .with_auto_start(true);

fn victim_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Killed while waiting
    assert_eq!(SEM.wait(), Err(WaitError::Stopped));
    SEQ.expect_and_replace(2, 3);

    // The semaphore is usable again after the kill
    assert_eq!(SEM.value().unwrap(), 0);

    // A second kill with no waiters is a no-op
    SEM.kill().unwrap();
    SEM.kill().unwrap();
    assert_eq!(SEM.value().unwrap(), 0);

    // Killed while waiting for a mutex held by the driver
    SEQ.expect_and_replace(3, 4);
    assert_eq!(MTX.lock(), Err(LockMutexError::Stopped));

    SEQ.expect_and_replace(5, 6);
    assert_eq!(MTX.is_locked().unwrap(), false);

    // The owner link was cleared; we can take the mutex now
    MTX.lock().unwrap();
    MTX.unlock().unwrap();

    TEST_UTIL.success::<SystemTraits>();
}

fn driver_body(_: usize) {
    // The victim has blocked on the semaphore
    SEQ.expect_and_replace(1, 2);
    MTX.lock().unwrap();
    SEM.kill().unwrap();

    // The kill woke the victim, which preempted us and then blocked on
    // `MTX`
    SEQ.expect_and_replace(4, 5);
    assert_eq!(
        System::<SystemTraits>::current_task()
            .unwrap()
            .effective_priority()
            .unwrap(),
        2,
        "the mutex owner inherits the blocked victim's priority"
    );

    MTX.kill().unwrap();
    // The victim preempts us again and finishes the scenario
}

#[test]
fn kill_objects() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
