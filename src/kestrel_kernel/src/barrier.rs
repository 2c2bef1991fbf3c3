//! Barriers
//!
//! A barrier gathers tasks until a threshold number of them have arrived,
//! then releases them all at once. The occupancy *is* the wait queue
//! length, so a waiter leaving early (timeout or kill) automatically
//! lowers the count.
use core::fmt;

use crate::{
    error::{AbortReason, GetError, KillError, WaitError, WaitTimeoutError},
    klock, state, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Barrier control block* — a rendezvous point for a fixed group of tasks.
pub struct BarrierCb<Traits: PortThreading> {
    /// The number of tasks that must arrive before the barrier opens.
    pub(super) limit: usize,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for BarrierCb<Traits> {}

impl<Traits: PortThreading> BarrierCb<Traits> {
    /// Construct a `BarrierCb` that opens when `limit` tasks arrive.
    pub const fn new(limit: usize) -> Self {
        assert!(limit >= 1);
        Self {
            limit,
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `BarrierCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create(limit: usize) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(limit)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for BarrierCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BarrierCb")
            .field("self", &(self as *const _))
            .field("limit", &self.limit)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> BarrierCb<Traits> {
    /// Arrive at the barrier, blocking indefinitely until `limit` tasks
    /// have gathered.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.arrive(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Barrier)?;
        Ok(())
    }

    /// Arrive at the barrier, blocking for at most `delay` ticks.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.arrive(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Barrier, time32)?;
        Ok(())
    }

    /// Arrive at the barrier, blocking until the tick count reaches `at`.
    pub fn wait_until(&'static self, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.arrive(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Barrier, time32)?;
        Ok(())
    }

    /// Get the number of tasks currently gathered at the barrier.
    pub fn waiting(&self) -> Result<usize, GetError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(self.wait_queue.waiting_task_count(lock.borrow_mut()))
    }

    /// Reset the barrier, waking up every gathered task with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Record the caller's arrival. If it is the `limit`-th arrival, open
    /// the barrier (wake everyone) and return `true`; the caller then
    /// doesn't wait.
    fn arrive(&'static self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) -> bool {
        if self.wait_queue.waiting_task_count(lock.borrow_mut()) + 1 >= self.limit {
            self.wait_queue
                .wake_up_all_conditional(lock.borrow_mut(), |_, _| true);
            true
        } else {
            false
        }
    }
}
