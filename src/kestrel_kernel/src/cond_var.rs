//! Condition variables
//!
//! A condition variable is always used together with a mutex. `wait`
//! atomically releases the mutex and blocks on the condition variable;
//! once woken (notify, timeout, or kill), it re-acquires the mutex before
//! returning, whatever the outcome of the wait was.
use core::fmt;

use crate::{
    error::{AbortReason, KillError, UpdateError, WaitError, WaitTimeoutError},
    klock, mutex, state, task, timeout,
    mutex::MutexCb,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Condition variable control block.*
pub struct CondVarCb<Traits: PortThreading> {
    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for CondVarCb<Traits> {}

impl<Traits: PortThreading> CondVarCb<Traits> {
    pub const fn new() -> Self {
        Self {
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `CondVarCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
    }
}

impl<Traits: PortThreading> Init for CondVarCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for CondVarCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CondVarCb")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> CondVarCb<Traits> {
    /// Release `mutex_cb` and block until notified; then re-acquire
    /// `mutex_cb`.
    ///
    /// The calling task must own `mutex_cb` exactly once; anything else is
    /// a programming error and panics.
    pub fn wait(&'static self, mutex_cb: &'static MutexCb<Traits>) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        mutex::unlock_for_cond_wait(lock.borrow_mut(), mutex_cb);

        let result = self
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::CondVar)
            .map(|_| ());

        let relock = mutex::relock_after_cond_wait(lock.borrow_mut(), mutex_cb);

        result.and(relock)
    }

    /// [`Self::wait`] with a timeout applying to the wait (the re-lock is
    /// unbounded).
    pub fn wait_for(
        &'static self,
        mutex_cb: &'static MutexCb<Traits>,
        delay: UTicks,
    ) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait(mutex_cb).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        mutex::unlock_for_cond_wait(lock.borrow_mut(), mutex_cb);

        let result = self
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::CondVar, time32)
            .map(|_| ());

        let relock = mutex::relock_after_cond_wait(lock.borrow_mut(), mutex_cb);

        result.and(relock.map_err(Into::into))
    }

    /// [`Self::wait`] with an absolute deadline.
    pub fn wait_until(
        &'static self,
        mutex_cb: &'static MutexCb<Traits>,
        at: UTicks,
    ) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        mutex::unlock_for_cond_wait(lock.borrow_mut(), mutex_cb);

        let result = self
            .wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::CondVar, time32)
            .map(|_| ());

        let relock = mutex::relock_after_cond_wait(lock.borrow_mut(), mutex_cb);

        result.and(relock.map_err(Into::into))
    }

    /// Wake up the most urgent waiter, if any. The woken task re-acquires
    /// the associated mutex before its `wait` returns. Usable from any
    /// context.
    pub fn notify_one(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.wait_queue.wake_up_one(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up every current waiter. Usable from any context.
    pub fn notify_all(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let mut woke_up_any = false;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |_, _| {
                woke_up_any = true;
                true
            });

        if woke_up_any {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wake up every current waiter with `Stopped`. The woken tasks still
    /// re-acquire their mutex before returning.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
