//! One-shot signals
//!
//! A signal is a single latching flag. `give` sets the flag and wakes up
//! every current waiter; the flag stays set (releasing later waiters
//! immediately) until `clear` resets it.
use core::fmt;

use crate::{
    error::{AbortReason, GetError, KillError, PollError, UpdateError, WaitError,
            WaitTimeoutError},
    klock, state, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Signal control block* — a latching one-shot signal.
pub struct SignalCb<Traits: PortThreading> {
    pub(super) signaled: klock::CpuLockCell<Traits, bool>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for SignalCb<Traits> {}

impl<Traits: PortThreading> SignalCb<Traits> {
    /// Construct a `SignalCb` in the cleared state.
    pub const fn new() -> Self {
        Self {
            signaled: klock::CpuLockCell::new(false),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `SignalCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
    }
}

impl<Traits: PortThreading> Init for SignalCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for SignalCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalCb")
            .field("self", &(self as *const _))
            .field("signaled", &self.signaled)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> SignalCb<Traits> {
    /// Set the signal, waking up every current waiter. Usable from any
    /// context.
    pub fn give(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.signaled.replace(&mut *lock, true) {
            // Already signaled; there can be no waiters
            debug_assert!(self.wait_queue.is_empty(lock.borrow_mut()));
            return Ok(());
        }

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

    /// Reset the signal to the cleared state. Usable from any context.
    pub fn clear(&'static self) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.signaled.replace(&mut *lock, false);
        Ok(())
    }

    /// Return a flag indicating whether the signal is currently set.
    pub fn is_set(&self) -> Result<bool, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.signaled.get(&*lock))
    }

    /// Check the signal without blocking. Usable from any context.
    pub fn take(&'static self) -> Result<(), PollError> {
        let lock = klock::lock_cpu::<Traits>()?;

        if self.signaled.get(&*lock) {
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Block indefinitely until the signal is set.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.signaled.get(&*lock) {
            return Ok(());
        }

        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Signal)?;
        Ok(())
    }

    /// Block for at most `delay` ticks until the signal is set.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.signaled.get(&*lock) {
            return Ok(());
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Signal, time32)?;
        Ok(())
    }

    /// Block until the tick count reaches `at` for the signal to be set.
    pub fn wait_until(&'static self, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.signaled.get(&*lock) {
            return Ok(());
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Signal, time32)?;
        Ok(())
    }

    /// Reset the signal, waking up every current waiter with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.signaled.replace(&mut *lock, false);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
