//! Mailbox queues
//!
//! A mailbox queue is a ring of fixed-size slots. Senders block while the
//! ring is full; receivers block while it is empty. When a sender finds a
//! blocked receiver, the item is copied directly into the receiver's
//! buffer, bypassing the ring.
use core::{fmt, ptr};

use crate::{
    error::{
        AbortReason, GetError, KillError, PollError, UpdateError, WaitError, WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::{Init, StorageCell},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Mailbox queue control block* — a bounded queue of fixed-size items.
pub struct MailboxCb<Traits: PortThreading> {
    /// The size of one item in bytes.
    item_size: usize,

    /// The ring storage. Its length must be a multiple of `item_size`.
    storage: &'static StorageCell<[u8]>,

    /// The slot index of the oldest stored item.
    head: klock::CpuLockCell<Traits, usize>,

    /// The number of stored items.
    count: klock::CpuLockCell<Traits, usize>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for MailboxCb<Traits> {}

impl<Traits: PortThreading> MailboxCb<Traits> {
    /// Construct a `MailboxCb` storing items of `item_size` bytes in
    /// `storage`.
    pub const fn new(item_size: usize, storage: &'static StorageCell<[u8]>) -> Self {
        assert!(item_size >= 1);
        Self {
            item_size,
            storage,
            head: klock::CpuLockCell::new(0),
            count: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `MailboxCb` on the kernel heap with room for `capacity`
    /// items of `item_size` bytes.
    #[cfg(feature = "alloc")]
    pub fn create(item_size: usize, capacity: usize) -> &'static Self {
        let storage = crate::utils::leak_byte_storage(item_size * capacity);
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(item_size, storage)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for MailboxCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MailboxCb")
            .field("self", &(self as *const _))
            .field("item_size", &self.item_size)
            .field("head", &self.head)
            .field("count", &self.count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// The outcome of a non-blocking send attempt.
enum SendPoll {
    /// The item was stored or handed to a receiver directly.
    Sent { woke_receiver: bool },
    /// The ring is full and no receiver is waiting.
    Full,
}

impl<Traits: KernelTraits> MailboxCb<Traits> {
    /// Send an item, blocking indefinitely while the queue is full.
    ///
    /// `data` must be exactly one item long.
    pub fn send(&'static self, data: &[u8]) -> Result<(), WaitError> {
        assert_eq!(data.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::Full => {
                self.wait_queue.wait(
                    lock.borrow_mut(),
                    WaitPayload::MailboxSend {
                        src: data.as_ptr(),
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Send an item, blocking for at most `delay` ticks.
    pub fn send_for(&'static self, data: &[u8], delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.send(data).map_err(Into::into);
        }
        assert_eq!(data.len(), self.item_size);
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::Full if time32 == timeout::IMMEDIATE => Err(WaitTimeoutError::Timeout),
            SendPoll::Full => {
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::MailboxSend {
                        src: data.as_ptr(),
                    },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Send an item, blocking until the tick count reaches `at`.
    pub fn send_until(&'static self, data: &[u8], at: UTicks) -> Result<(), WaitTimeoutError> {
        assert_eq!(data.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::Full => {
                let time32 = timeout::time32_until(lock.borrow_mut(), at);
                if time32 == timeout::IMMEDIATE {
                    return Err(WaitTimeoutError::Timeout);
                }
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::MailboxSend {
                        src: data.as_ptr(),
                    },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Send an item without blocking, failing with `Timeout` while the
    /// queue is full. Usable from any context.
    pub fn give(&'static self, data: &[u8]) -> Result<(), PollError> {
        assert_eq!(data.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::Full => Err(PollError::Timeout),
        }
    }

    /// Send an item without blocking, discarding the oldest stored item to
    /// make room if the queue is full. When a sender is already parked on
    /// the full queue, the item is dropped instead and the call is a no-op.
    /// Usable from any context.
    pub fn push(&'static self, data: &[u8]) -> Result<(), UpdateError> {
        assert_eq!(data.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
            }
            SendPoll::Full => {
                // The ring is at capacity, so any queued waiter is a sender
                // parked in `send`; the new item must not evict past it
                if !self.wait_queue.is_empty(lock.borrow_mut()) {
                    return Ok(());
                }

                // Drop the oldest item, then store the new one in the freed
                // slot
                let head = self.head.get(&*lock);
                let count = self.count.get(&*lock);

                // Safety: CPU Lock active
                let storage = unsafe { &mut *self.storage.get() };
                let capacity = storage.len() / self.item_size;

                let tail = head; // the freed slot wraps around to the tail
                storage[tail * self.item_size..][..self.item_size].copy_from_slice(data);

                self.head.replace(&mut *lock, (head + 1) % capacity);
                debug_assert_eq!(count, capacity);
            }
        }
        Ok(())
    }

    /// Receive an item, blocking indefinitely while the queue is empty.
    ///
    /// `buf` must be exactly one item long.
    pub fn recv(&'static self, buf: &mut [u8]) -> Result<(), WaitError> {
        assert_eq!(buf.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::MailboxRecv {
                dst: buf.as_mut_ptr(),
            },
        )?;
        Ok(())
    }

    /// Receive an item, blocking for at most `delay` ticks.
    pub fn recv_for(&'static self, buf: &mut [u8], delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.recv(buf).map_err(Into::into);
        }
        assert_eq!(buf.len(), self.item_size);
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::MailboxRecv {
                dst: buf.as_mut_ptr(),
            },
            time32,
        )?;
        Ok(())
    }

    /// Receive an item, blocking until the tick count reaches `at`.
    pub fn recv_until(&'static self, buf: &mut [u8], at: UTicks) -> Result<(), WaitTimeoutError> {
        assert_eq!(buf.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::MailboxRecv {
                dst: buf.as_mut_ptr(),
            },
            time32,
        )?;
        Ok(())
    }

    /// Receive an item without blocking, failing with `Timeout` while the
    /// queue is empty. Usable from any context.
    pub fn take(&'static self, buf: &mut [u8]) -> Result<(), PollError> {
        assert_eq!(buf.len(), self.item_size);
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Get the number of items currently stored.
    pub fn count(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.count.get(&*lock))
    }

    /// Reset the mailbox queue: the ring is emptied and every current
    /// waiter is woken up with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.head.replace(&mut *lock, 0);
        self.count.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Try to deliver `data`: directly to a blocked receiver if the ring is
    /// empty, into the ring otherwise.
    fn send_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        data: &[u8],
    ) -> SendPoll {
        let head = self.head.get(&*lock);
        let count = self.count.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let capacity = storage.len() / self.item_size;

        if count == 0 {
            // When the ring is empty, every waiter is a receiver. Hand the
            // item to the most urgent one, bypassing the ring.
            let mut handed_over = false;
            let item_size = self.item_size;
            self.wait_queue
                .wake_up_all_conditional(lock.borrow_mut(), |payload, _token| {
                    if handed_over {
                        return false;
                    }
                    match payload {
                        WaitPayload::MailboxRecv { dst } => {
                            // Safety: The receiver's buffer is valid while
                            // it's waiting; we hold CPU Lock.
                            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), *dst, item_size) };
                            handed_over = true;
                            true
                        }
                        _ => unreachable!(),
                    }
                });

            if handed_over {
                return SendPoll::Sent {
                    woke_receiver: true,
                };
            }
        }

        if count < capacity {
            let tail = (head + count) % capacity;
            storage[tail * self.item_size..][..self.item_size].copy_from_slice(data);
            self.count.replace(&mut *lock, count + 1);
            SendPoll::Sent {
                woke_receiver: false,
            }
        } else {
            SendPoll::Full
        }
    }

    /// Try to take the oldest item into `buf`. On success, refill the freed
    /// slot from a blocked sender (if any). Returns `false` if the ring is
    /// empty.
    fn recv_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        buf: &mut [u8],
    ) -> bool {
        let head = self.head.get(&*lock);
        let count = self.count.get(&*lock);

        if count == 0 {
            return false;
        }

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let capacity = storage.len() / self.item_size;

        buf.copy_from_slice(&storage[head * self.item_size..][..self.item_size]);
        let head = (head + 1) % capacity;
        let mut count = count - 1;

        // When the ring was full, senders may be blocked. Move the most
        // urgent one's item into the freed slot.
        let mut refilled = false;
        let item_size = self.item_size;
        let tail = (head + count) % capacity;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, _token| {
                if refilled {
                    return false;
                }
                match payload {
                    WaitPayload::MailboxSend { src } => {
                        // Safety: The sender's buffer is valid while it's
                        // waiting; we hold CPU Lock.
                        unsafe {
                            ptr::copy_nonoverlapping(
                                *src,
                                storage[tail * item_size..][..item_size].as_mut_ptr(),
                                item_size,
                            )
                        };
                        refilled = true;
                        true
                    }
                    _ => unreachable!(),
                }
            });

        if refilled {
            count += 1;
        }

        self.head.replace(&mut *lock, head);
        self.count.replace(&mut *lock, count);

        true
    }
}
