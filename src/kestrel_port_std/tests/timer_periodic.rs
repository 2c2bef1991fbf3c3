//! Periodic timers: expiries arrive exactly one period apart, run the
//! callback, and wake every task waiting on the timer object.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{KernelTestUtil, SeqTracker};
use kestrel_kernel::{
    error::{StartTimerError, WaitTimeoutError},
    System, TaskAttr, TaskCb, TimerCb, INFINITE,
};
use kestrel_port_std as port;

port::use_port!(unsafe struct SystemTraits {
    startup_tasks = [DRIVER_TASK],
});

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();

static FIRED: AtomicUsize = AtomicUsize::new(0);

fn timer_callback(param: usize) {
    assert_eq!(param, 7);
    FIRED.fetch_add(1, Ordering::SeqCst);
}

static TIMER: TimerCb<SystemTraits> = TimerCb::new(timer_callback, 7);
static ONESHOT: TimerCb<SystemTraits> = TimerCb::new_idle();

static DRIVER_TASK: TaskCb<SystemTraits> = TaskCb::new(&DRIVER_ATTR);
static DRIVER_ATTR: TaskAttr<SystemTraits> = TaskAttr::new(driver_body)
    .with_priority(1)
    .with_auto_start(true);

fn driver_body(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Delay values beyond the representable range are rejected
    assert_eq!(TIMER.start(INFINITE, 0), Err(StartTimerError::BadParam));
    assert_eq!(TIMER.start(10, INFINITE), Err(StartTimerError::BadParam));

    // Periodic: first expiry after 10 ticks, then every 10 ticks
    let t0 = System::<SystemTraits>::time().unwrap();
    TIMER.start(10, 10).unwrap();
    assert_eq!(TIMER.is_active().unwrap(), true);

    for i in 1..=3u32 {
        TIMER.wait().unwrap();
        assert_eq!(
            System::<SystemTraits>::time().unwrap(),
            t0.wrapping_add(10 * i)
        );
        assert_eq!(FIRED.load(Ordering::SeqCst), i as usize);
    }

    // A stopped timer no longer fires
    TIMER.stop().unwrap();
    assert_eq!(TIMER.is_active().unwrap(), false);
    assert_eq!(TIMER.wait_for(50), Err(WaitTimeoutError::Timeout));
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);

    // One-shot: a single expiry, then back to the stopped state
    ONESHOT.start(5, 0).unwrap();
    ONESHOT.wait().unwrap();
    assert_eq!(ONESHOT.is_active().unwrap(), false);
    assert_eq!(ONESHOT.wait_for(20), Err(WaitTimeoutError::Timeout));

    // Kill wakes waiters and deactivates the timer
    ONESHOT.start(1000, 0).unwrap();
    ONESHOT.kill().unwrap();
    assert_eq!(ONESHOT.is_active().unwrap(), false);

    SEQ.expect_and_replace(1, 2);
    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn timer_periodic() {
    TEST_UTIL.run(|| port::boot::<SystemTraits>());
}
