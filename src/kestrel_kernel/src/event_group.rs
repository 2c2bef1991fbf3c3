//! Event flag groups
use core::fmt;

use crate::{
    error::{AbortReason, GetError, KillError, PollError, UpdateError, WaitError,
            WaitTimeoutError},
    klock, state, task, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// Unsigned integer type representing an event flag group's state.
pub type EventBits = u32;

bitflags::bitflags! {
    /// Options for the event flag wait verbs.
    pub struct EventWaitFlags: u8 {
        /// Wait until *all* of the specified bits are set (instead of any).
        const ALL = 1 << 0;
        /// Clear the matched bits before returning.
        const CLEAR = 1 << 1;
    }
}

/// *Event flag group control block* — a set of event flags tasks can wait
/// on.
pub struct EventGroupCb<Traits: PortThreading> {
    pub(super) bits: klock::CpuLockCell<Traits, EventBits>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for EventGroupCb<Traits> {}

impl<Traits: PortThreading> EventGroupCb<Traits> {
    /// Construct an `EventGroupCb` with the specified initial state.
    pub const fn new(initial: EventBits) -> Self {
        Self {
            bits: klock::CpuLockCell::new(initial),
            wait_queue: Init::INIT,
        }
    }

    /// Construct an `EventGroupCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create(initial: EventBits) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(initial)))
    }
}

impl<Traits: PortThreading> Init for EventGroupCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(0);
}

impl<Traits: KernelTraits> fmt::Debug for EventGroupCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventGroupCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> EventGroupCb<Traits> {
    /// Set the specified bits, waking up every waiter whose wait condition
    /// now holds. Usable from any context.
    pub fn set(&'static self, bits: EventBits) -> Result<(), UpdateError> {
        let lock = klock::lock_cpu::<Traits>()?;
        set(self, lock, bits);
        Ok(())
    }

    /// Clear the specified bits. Usable from any context.
    pub fn clear(&'static self, bits: EventBits) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.bits.replace_with(&mut *lock, |b| *b & !bits);
        Ok(())
    }

    /// Get the current state of the flags.
    pub fn get(&self) -> Result<EventBits, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.bits.get(&*lock))
    }

    /// Wait indefinitely until the wait condition `(bits, flags)` holds.
    /// Returns the state of the flags at the moment the condition held.
    pub fn wait(
        &'static self,
        bits: EventBits,
        flags: EventWaitFlags,
    ) -> Result<EventBits, WaitError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait(self, lock, bits, flags)
    }

    /// Wait for at most `delay` ticks until the wait condition holds.
    pub fn wait_for(
        &'static self,
        bits: EventBits,
        flags: EventWaitFlags,
        delay: UTicks,
    ) -> Result<EventBits, WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait(bits, flags).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        wait_timeout(self, lock, bits, flags, time32)
    }

    /// Wait until the tick count reaches `at` for the wait condition to
    /// hold.
    pub fn wait_until(
        &'static self,
        bits: EventBits,
        flags: EventWaitFlags,
        at: UTicks,
    ) -> Result<EventBits, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        wait_timeout(self, lock, bits, flags, time32)
    }

    /// Check the wait condition without blocking. Usable from any context.
    pub fn poll(
        &'static self,
        bits: EventBits,
        flags: EventWaitFlags,
    ) -> Result<EventBits, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(original_value) = poll_core(self.bits.write(&mut *lock), bits, flags) {
            Ok(original_value)
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Reset the event flag group: all bits are cleared and every current
    /// waiter is woken up with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.bits.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

fn wait<Traits: KernelTraits>(
    event_group_cb: &'static EventGroupCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    bits: EventBits,
    flags: EventWaitFlags,
) -> Result<EventBits, WaitError> {
    if let Some(original_value) = poll_core(event_group_cb.bits.write(&mut *lock), bits, flags) {
        Ok(original_value)
    } else {
        // The current state does not satisfy the wait condition. In this
        // case, start waiting. The wake-upper is responsible for using
        // `poll_core`.
        let result = event_group_cb.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::EventBits {
                bits,
                flags,
                orig_bits: Init::INIT,
            },
        )?;

        // The original value will have been copied to `orig_bits`
        if let WaitPayload::EventBits { orig_bits, .. } = result {
            Ok(orig_bits.read(&*lock).get())
        } else {
            unreachable!()
        }
    }
}

fn wait_timeout<Traits: KernelTraits>(
    event_group_cb: &'static EventGroupCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    bits: EventBits,
    flags: EventWaitFlags,
    time32: timeout::Time32,
) -> Result<EventBits, WaitTimeoutError> {
    if let Some(original_value) = poll_core(event_group_cb.bits.write(&mut *lock), bits, flags) {
        Ok(original_value)
    } else if time32 == timeout::IMMEDIATE {
        Err(WaitTimeoutError::Timeout)
    } else {
        let result = event_group_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::EventBits {
                bits,
                flags,
                orig_bits: Init::INIT,
            },
            time32,
        )?;

        // The original value will have been copied to `orig_bits`
        if let WaitPayload::EventBits { orig_bits, .. } = result {
            Ok(orig_bits.read(&*lock).get())
        } else {
            unreachable!()
        }
    }
}

/// Given a wait condition `(bits, flags)`, check if the current state of an
/// event flag group, `event_group_bits`, satisfies the wait condition.
///
/// If `event_group_bits` satisfies the wait condition, this function clears
/// some bits of `event_group_bits` (if requested by `flags`), and returns
/// `Some(original_value)`. Otherwise, it returns `None`.
fn poll_core(
    event_group_bits: &mut EventBits,
    bits: EventBits,
    flags: EventWaitFlags,
) -> Option<EventBits> {
    let success = if flags.contains(EventWaitFlags::ALL) {
        (*event_group_bits & bits) == bits
    } else {
        (*event_group_bits & bits) != 0
    };

    if success {
        let original_value = *event_group_bits;
        if flags.contains(EventWaitFlags::CLEAR) {
            *event_group_bits &= !bits;
        }
        Some(original_value)
    } else {
        None
    }
}

fn set<Traits: KernelTraits>(
    event_group_cb: &'static EventGroupCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    added_bits: EventBits,
) {
    let mut event_group_bits = event_group_cb.bits.get(&*lock);

    // Return early if no bits will change
    if (event_group_bits | added_bits) == event_group_bits {
        return;
    }

    event_group_bits |= added_bits;

    // Wake up tasks if their wake up conditions are now fulfilled.
    //
    // When waking up a task, some bits of `event_group_bits` might be
    // cleared if the waiter requests clearing bits. Clearing is handled by
    // `poll_core`.
    let mut woke_up_any = false;

    event_group_cb
        .wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |wait_payload, lock| match wait_payload {
            WaitPayload::EventBits {
                bits,
                flags,
                orig_bits,
            } => {
                if let Some(orig) = poll_core(&mut event_group_bits, *bits, *flags) {
                    woke_up_any = true;
                    orig_bits.read(&*lock).set(orig);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!(),
        });

    event_group_cb.bits.replace(&mut *lock, event_group_bits);

    if woke_up_any {
        task::unlock_cpu_and_check_preemption(lock);
    }
}
