//! Timeouts: a bounded wait with no giver returns `Timeout` exactly once,
//! exactly at its deadline; sleeps wake at the requested instant.
mod common;

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{PollError, SleepError, WaitTimeoutError},
    MailboxCb, System, TaskAttr, TaskCb, DELAY_MAX,
};
use kestrel_kernel::utils::StorageCell;
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK, WAITER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static QUEUE_BUF: StorageCell<[u8; 16]> = StorageCell::new([0; 16]);
static QUEUE: MailboxCb<SystemTraits> = MailboxCb::new(4, &QUEUE_BUF);

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

static WAITER_TASK: TaskCb<SystemTraits> = TaskCb::new(&WAITER_ATTR);
static WAITER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(waiter_body)
    .with_priority(2)
    .with_auto_start(true);

fn waiter_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let mut buf = [0u8; 4];

    // A delay beyond the representable range is rejected
    assert_eq!(
        QUEUE.recv_for(&mut buf, DELAY_MAX + 1),
        Err(WaitTimeoutError::BadParam)
    );

    // Block with a 100-tick deadline; nobody will send
    let t0 = System::<SystemTraits>::time().unwrap();
    assert_eq!(
        QUEUE.recv_for(&mut buf, 100),
        Err(WaitTimeoutError::Timeout)
    );

    // Exactly one wakeup, exactly at the deadline
    SEQ.expect_and_replace(2, 3);
    assert_eq!(System::<SystemTraits>::time().unwrap(), t0.wrapping_add(100));
    assert_eq!(QUEUE.count().unwrap(), 0);

    // The wait object is gone; polling finds the queue still empty
    assert_eq!(QUEUE.take(&mut buf), Err(PollError::Timeout));

    // Absolute-deadline sleep
    let t1 = System::<SystemTraits>::time().unwrap();
    System::<SystemTraits>::sleep_until(t1.wrapping_add(50)).unwrap();
    assert_eq!(System::<SystemTraits>::time().unwrap(), t1.wrapping_add(50));

    // A deadline already in the past returns immediately
    System::<SystemTraits>::sleep_until(t1).unwrap();

    // Zero-length sleeps don't suspend; unbounded sleeps are rejected
    System::<SystemTraits>::sleep_for(0).unwrap();
    assert_eq!(
        System::<SystemTraits>::sleep_for(kestrel_kernel::INFINITE),
        Err(SleepError::BadParam)
    );

    SEQ.expect_and_replace(3, 4);
    TEST_UTIL.success::<SystemTraits>();
}

fn driver_body(_: usize) {
    // Runs once the waiter has blocked. Returning here leaves the waiter
    // as the only task; the simulated clock then jumps straight to the
    // waiter's deadline.
    SEQ.expect_and_replace(1, 2);
}

#[test]
fn timeouts() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
