//! Counting semaphores
use core::fmt;

use crate::{
    error::{
        AbortReason, GetError, KillError, PollError, SignalSemaphoreError, WaitError,
        WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// Unsigned integer type representing the number of permits held by a
/// semaphore.
pub type SemaphoreValue = u32;

/// *Semaphore control block* — a counting semaphore.
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(super) value: klock::CpuLockCell<Traits, SemaphoreValue>,
    pub(super) max_value: SemaphoreValue,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for SemaphoreCb<Traits> {}

impl<Traits: PortThreading> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb` holding `initial` permits and accepting at
    /// most `max_value`.
    pub const fn new(initial: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        assert!(initial <= max_value);
        Self {
            value: klock::CpuLockCell::new(initial),
            max_value,
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `SemaphoreCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create(initial: SemaphoreValue, max_value: SemaphoreValue) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(initial, max_value)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Acquire a permit, blocking indefinitely until one is available.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one(self, lock)
    }

    /// Acquire a permit, blocking for at most `delay` ticks.
    ///
    /// [`IMMEDIATE`] makes the call equivalent to [`Self::take`];
    /// [`INFINITE`] makes it equivalent to [`Self::wait`].
    ///
    /// [`IMMEDIATE`]: crate::IMMEDIATE
    /// [`INFINITE`]: crate::INFINITE
    pub fn wait_for(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_one_timeout(self, lock, time32)
    }

    /// Acquire a permit, blocking until the tick count reaches `at`.
    pub fn wait_until(&'static self, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        wait_one_timeout(self, lock, time32)
    }

    /// Acquire a permit without blocking. Usable from any context.
    pub fn take(&'static self) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if poll_core(self.value.write(&mut *lock)) {
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Release one permit. Usable from any context.
    pub fn give(&'static self) -> Result<(), SignalSemaphoreError> {
        self.give_many(1)
    }

    /// Release `count` permits. Usable from any context.
    pub fn give_many(&'static self, count: SemaphoreValue) -> Result<(), SignalSemaphoreError> {
        let lock = klock::lock_cpu::<Traits>()?;
        signal(self, lock, count)
    }

    /// Get the number of permits currently held by the semaphore.
    pub fn value(&self) -> Result<SemaphoreValue, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.value.get(&*lock))
    }

    /// Reset the semaphore: the counter returns to zero and every current
    /// waiter is woken up with `Stopped`.
    ///
    /// `kill` is idempotent; killing a semaphore with no waiters only
    /// clears the counter.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.value.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

#[inline]
fn wait_one<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), WaitError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(())
    } else {
        // The current state does not satisfy the wait condition. In this
        // case, start waiting. The wake-upper is responsible for using
        // `poll_core` to complete the effect of the wait operation.
        semaphore_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore)?;

        Ok(())
    }
}

#[inline]
fn wait_one_timeout<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    time32: timeout::Time32,
) -> Result<(), WaitTimeoutError> {
    if poll_core(semaphore_cb.value.write(&mut *lock)) {
        Ok(())
    } else if time32 == timeout::IMMEDIATE {
        Err(WaitTimeoutError::Timeout)
    } else {
        semaphore_cb
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, time32)?;

        Ok(())
    }
}

/// Check if the current state of a semaphore, `value`, satisfies the wait
/// condition.
///
/// If `value` satisfies the wait condition, this function updates `value`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

#[inline]
fn signal<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    mut count: SemaphoreValue,
) -> Result<(), SignalSemaphoreError> {
    let value = semaphore_cb.value.get(&*lock);

    if semaphore_cb.max_value - value < count {
        return Err(SignalSemaphoreError::Overflow);
    }

    let orig_count = count;

    // This is equivalent to using `wake_up_all_conditional` and calling
    // `poll_core` for each waiting task, but is more direct
    while count > 0 {
        if semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
            // We just woke up a task. Give one permit to that task.
            count -= 1;
        } else {
            // There's no more task to wake up; deposit the remaining
            // permits in the semaphore
            semaphore_cb.value.replace(&mut *lock, value + count);
            break;
        }
    }

    // If we woke up at least one task in the process, check for dispatch
    if count != orig_count {
        task::unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}
