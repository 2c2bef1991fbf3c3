//! Timers
//!
//! A timer fires after an initial delay and then, if given a nonzero
//! period, repeatedly at that period. Each expiry runs the timer's callback
//! (outside the critical section) and wakes up every task blocked on the
//! timer with `Success`, making timers waitable objects like any other.
use core::{fmt, mem::ManuallyDrop, pin::Pin};

use crate::{
    error::{AbortReason, GetError, KillError, StartTimerError, UpdateError, WaitError,
            WaitTimeoutError},
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Timer control block* — a one-shot or periodic timer.
pub struct TimerCb<Traits: PortThreading> {
    /// The timeout object for the timer.
    ///
    ///  - If the timer is in the Active state, the timeout object is
    ///    linked.
    ///
    ///  - Otherwise, the timeout object is unlinked.
    pub(super) timeout: ManuallyDrop<timeout::Timeout<Traits>>,

    /// The callback procedure, called on each expiry with CPU Lock
    /// inactive.
    callback: fn(usize),

    /// The parameter supplied for `callback`.
    callback_param: usize,

    /// `true` iff the timer is in the Active state.
    pub(super) active: CpuLockCell<Traits, bool>,

    /// The firing period. Zero makes the timer one-shot.
    pub(super) period: CpuLockCell<Traits, timeout::Time32>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for TimerCb<Traits> {}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Construct a `TimerCb` with the specified callback procedure.
    pub const fn new(callback: fn(usize), callback_param: usize) -> Self {
        Self {
            timeout: ManuallyDrop::new(timeout::Timeout::new(timer_timeout_handler::<Traits>, 0)),
            callback,
            callback_param,
            active: CpuLockCell::new(false),
            period: CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `TimerCb` whose expiries only wake up waiters.
    pub const fn new_idle() -> Self {
        Self::new(|_| {}, 0)
    }

    /// Construct a `TimerCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create(callback: fn(usize), callback_param: usize) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(callback, callback_param)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("callback", &self.callback)
            .field("callback_param", &self.callback_param)
            .field("active", &self.active)
            .field("period", &self.period)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Get a pinned reference to the contained timeout object.
///
/// The timeout lives inside a `'static` control block and is never moved or
/// dropped, which is exactly the structural guarantee `Pin` asks for.
fn timer_timeout<Traits: PortThreading>(
    timer_cb: &'static TimerCb<Traits>,
) -> Pin<&'static timeout::Timeout<Traits>> {
    // Safety: See the doc comment above
    unsafe { Pin::new_unchecked(&*timer_cb.timeout) }
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Start the timer: fire after `delay` ticks and then every `period`
    /// ticks (`period == 0` makes it one-shot). Usable from any context.
    ///
    /// Restarting an active timer re-arms it with the new parameters.
    pub fn start(&'static self, delay: UTicks, period: UTicks) -> Result<(), StartTimerError> {
        let time32 = timeout::time32_from_delay(delay)?;
        let period32 = timeout::time32_from_delay(period)?;
        let mut lock = lock_cpu::<Traits>()?;

        // Re-arming stops the previous schedule first
        if self.timeout.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout(lock.borrow_mut(), &self.timeout);
        }

        self.period.replace(&mut *lock, period32);
        self.active.replace(&mut *lock, true);

        self.timeout
            .set_callback_param(lock.borrow_mut(), self as *const _ as usize);
        self.timeout
            .set_expiration_after(lock.borrow_mut(), time32);
        timeout::insert_timeout(lock.borrow_mut(), timer_timeout(self));

        Ok(())
    }

    /// Stop the timer. The timer can be started again later. Usable from
    /// any context.
    pub fn stop(&'static self) -> Result<(), UpdateError> {
        let mut lock = lock_cpu::<Traits>()?;

        if self.timeout.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout(lock.borrow_mut(), &self.timeout);
        }
        self.active.replace(&mut *lock, false);

        Ok(())
    }

    /// Return a flag indicating whether the timer is currently active.
    pub fn is_active(&self) -> Result<bool, GetError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.active.get(&*lock))
    }

    /// Block indefinitely until the timer's next expiry.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let mut lock = lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::TimerTick)?;
        Ok(())
    }

    /// Block until the timer's next expiry, for at most `delay` ticks.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::TimerTick, time32)?;
        Ok(())
    }

    /// Block until the timer's next expiry, or until the tick count reaches
    /// `at`.
    pub fn wait_until(&'static self, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::TimerTick, time32)?;
        Ok(())
    }

    /// Stop the timer and wake up every current waiter with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = lock_cpu::<Traits>()?;

        if self.timeout.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout(lock.borrow_mut(), &self.timeout);
        }
        self.active.replace(&mut *lock, false);
        self.period.replace(&mut *lock, 0);

        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// The timeout callback function for a timer, registered when initializing
/// [`TimerCb::timeout`]. `param` points to the `TimerCb`.
fn timer_timeout_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was set to a `&'static TimerCb` by `start`
    let timer_cb = unsafe { &*(param as *const TimerCb<Traits>) };

    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    // Schedule the next expiry
    let period = timer_cb.period.get(&*lock);
    if period == 0 {
        // One-shot: fall back to the Stopped state
        timer_cb.active.replace(&mut *lock, false);
    } else {
        timer_cb
            .timeout
            .adjust_expiration(lock.borrow_mut(), period);
        timeout::insert_timeout(lock.borrow_mut(), timer_timeout(timer_cb));
    }

    // Wake up every task waiting on the timer
    wake_all_timer_waiters(lock.borrow_mut(), timer_cb);

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    (timer_cb.callback)(timer_cb.callback_param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| unsafe { assume_cpu_lock() })
}

fn wake_all_timer_waiters<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    timer_cb
        .wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |_, _| true);
}
