//! Message buffers
//!
//! A message buffer stores variable-length messages framed as
//! `{length prefix, payload}` in a byte ring. `recv` returns one complete
//! message; `send` blocks until there's room for prefix + payload. A send
//! into an empty buffer with a blocked receiver copies the payload straight
//! into the receiver's buffer, never touching the ring.
use core::{fmt, ptr};

use crate::{
    error::{
        AbortReason, GetError, KillError, SendError, SendTimeoutError, WaitError,
        WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::{Init, StorageCell},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// The size of the length prefix stored in front of each message.
const HDR: usize = core::mem::size_of::<u32>();

/// *Message buffer control block* — a byte ring of length-prefixed
/// messages.
pub struct MsgBufferCb<Traits: PortThreading> {
    storage: &'static StorageCell<[u8]>,

    /// The byte offset of the first unread byte.
    head: klock::CpuLockCell<Traits, usize>,

    /// The number of used bytes.
    size: klock::CpuLockCell<Traits, usize>,

    /// The number of complete messages stored.
    count: klock::CpuLockCell<Traits, usize>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for MsgBufferCb<Traits> {}

impl<Traits: PortThreading> MsgBufferCb<Traits> {
    /// Construct a `MsgBufferCb` over the given ring storage.
    pub const fn new(storage: &'static StorageCell<[u8]>) -> Self {
        Self {
            storage,
            head: klock::CpuLockCell::new(0),
            size: klock::CpuLockCell::new(0),
            count: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `MsgBufferCb` on the kernel heap with a ring of
    /// `capacity` bytes.
    #[cfg(feature = "alloc")]
    pub fn create(capacity: usize) -> &'static Self {
        let storage = crate::utils::leak_byte_storage(capacity);
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(storage)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for MsgBufferCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MsgBufferCb")
            .field("self", &(self as *const _))
            .field("head", &self.head)
            .field("size", &self.size)
            .field("count", &self.count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// Copy `data` into the ring at byte offset `start`, wrapping around.
fn ring_write(storage: &mut [u8], start: usize, data: &[u8]) {
    let cap = storage.len();
    let start = start % cap;
    let first = data.len().min(cap - start);
    storage[start..start + first].copy_from_slice(&data[..first]);
    storage[..data.len() - first].copy_from_slice(&data[first..]);
}

/// Copy `buf.len()` bytes out of the ring at byte offset `start`, wrapping
/// around.
fn ring_read(storage: &[u8], start: usize, buf: &mut [u8]) {
    let cap = storage.len();
    let start = start % cap;
    let first = buf.len().min(cap - start);
    buf[..first].copy_from_slice(&storage[start..start + first]);
    let buf_len = buf.len();
    buf[first..].copy_from_slice(&storage[..buf_len - first]);
}

/// The outcome of a non-blocking send attempt.
enum SendPoll {
    /// The message was stored or handed to a receiver directly.
    Sent { woke_receiver: bool },
    /// There is not enough room and no receiver is waiting.
    NoRoom,
}

impl<Traits: KernelTraits> MsgBufferCb<Traits> {
    /// Send a message, blocking indefinitely while there is no room.
    ///
    /// Fails with `Overflow` if the message can never fit the ring.
    pub fn send(&'static self, data: &[u8]) -> Result<(), SendTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.check_fits(data)?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::NoRoom => {
                self.wait_queue.wait(
                    lock.borrow_mut(),
                    WaitPayload::MsgSend {
                        src: data.as_ptr(),
                        len: data.len(),
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Send a message, blocking for at most `delay` ticks.
    pub fn send_for(&'static self, data: &[u8], delay: UTicks) -> Result<(), SendTimeoutError> {
        if delay == timeout::INFINITE {
            return self.send(data);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.check_fits(data)?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::NoRoom if time32 == timeout::IMMEDIATE => Err(SendTimeoutError::Timeout),
            SendPoll::NoRoom => {
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::MsgSend {
                        src: data.as_ptr(),
                        len: data.len(),
                    },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Send a message, blocking until the tick count reaches `at`.
    pub fn send_until(&'static self, data: &[u8], at: UTicks) -> Result<(), SendTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.check_fits(data)?;

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::NoRoom => {
                let time32 = timeout::time32_until(lock.borrow_mut(), at);
                if time32 == timeout::IMMEDIATE {
                    return Err(SendTimeoutError::Timeout);
                }
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::MsgSend {
                        src: data.as_ptr(),
                        len: data.len(),
                    },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Send a message without blocking. Usable from any context.
    pub fn give(&'static self, data: &[u8]) -> Result<(), SendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if data.len() + HDR > self.capacity() {
            return Err(SendError::Overflow);
        }

        match self.send_core(lock.borrow_mut(), data) {
            SendPoll::Sent { woke_receiver } => {
                if woke_receiver {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            SendPoll::NoRoom => Err(SendError::Timeout),
        }
    }

    /// Receive one message, blocking indefinitely while the buffer is
    /// empty. Returns the number of bytes copied into `buf`; a message
    /// longer than `buf` is truncated.
    pub fn recv(&'static self, buf: &mut [u8]) -> Result<usize, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(copied) = self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(copied);
        }

        let payload = self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::MsgRecv {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                len: Init::INIT,
            },
        )?;

        if let WaitPayload::MsgRecv { len, .. } = payload {
            Ok(len.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Receive one message, blocking for at most `delay` ticks.
    pub fn recv_for(&'static self, buf: &mut [u8], delay: UTicks) -> Result<usize, WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.recv(buf).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(copied) = self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(copied);
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::MsgRecv {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                len: Init::INIT,
            },
            time32,
        )?;

        if let WaitPayload::MsgRecv { len, .. } = payload {
            Ok(len.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Receive one message, blocking until the tick count reaches `at`.
    pub fn recv_until(&'static self, buf: &mut [u8], at: UTicks) -> Result<usize, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(copied) = self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(copied);
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::MsgRecv {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                len: Init::INIT,
            },
            time32,
        )?;

        if let WaitPayload::MsgRecv { len, .. } = payload {
            Ok(len.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Receive one message without blocking, failing with `Timeout` while
    /// the buffer is empty. Usable from any context.
    pub fn take(&'static self, buf: &mut [u8]) -> Result<usize, crate::error::PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(copied) = self.recv_core(lock.borrow_mut(), buf) {
            task::unlock_cpu_and_check_preemption(lock);
            Ok(copied)
        } else {
            Err(crate::error::PollError::Timeout)
        }
    }

    /// Get the number of complete messages currently stored.
    pub fn count(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.count.get(&*lock))
    }

    /// Get the number of used bytes in the ring (including prefixes).
    pub fn bytes_used(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.size.get(&*lock))
    }

    /// Reset the message buffer: the ring is emptied and every current
    /// waiter is woken up with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.head.replace(&mut *lock, 0);
        self.size.replace(&mut *lock, 0);
        self.count.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn capacity(&self) -> usize {
        // The length is immutable; only the contents need CPU Lock
        unsafe { &*self.storage.get() }.len()
    }

    fn check_fits(&self, data: &[u8]) -> Result<(), SendTimeoutError> {
        if data.len() + HDR > self.capacity() {
            Err(SendTimeoutError::Overflow)
        } else {
            Ok(())
        }
    }

    /// Try to deliver `data`: directly to a blocked receiver if the buffer
    /// is empty, into the ring if it fits.
    fn send_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        data: &[u8],
    ) -> SendPoll {
        let count = self.count.get(&*lock);

        if count == 0 {
            // When the buffer is empty, every waiter is a receiver. Hand
            // the message to the most urgent one, bypassing the ring.
            let mut handed_over = false;
            self.wait_queue
                .wake_up_all_conditional(lock.borrow_mut(), |payload, token| {
                    if handed_over {
                        return false;
                    }
                    match payload {
                        WaitPayload::MsgRecv { dst, cap, len } => {
                            let copied = data.len().min(*cap);
                            // Safety: The receiver's buffer is valid while
                            // it's waiting; we hold CPU Lock.
                            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), *dst, copied) };
                            len.read(&*token).set(copied);
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

        let size = self.size.get(&*lock);
        let head = self.head.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };

        if store_message(storage, head, size, data) {
            self.size.replace(&mut *lock, size + HDR + data.len());
            self.count.replace(&mut *lock, count + 1);
            SendPoll::Sent {
                woke_receiver: false,
            }
        } else {
            SendPoll::NoRoom
        }
    }

    /// Try to take the oldest message into `buf`. On success, move as many
    /// blocked senders' messages into the freed space as fit, in queue
    /// order. Returns the number of bytes copied.
    fn recv_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        buf: &mut [u8],
    ) -> Option<usize> {
        let count = self.count.get(&*lock);
        if count == 0 {
            return None;
        }

        let head = self.head.get(&*lock);
        let size = self.size.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let cap = storage.len();

        // Read the length prefix
        let mut hdr = [0u8; HDR];
        ring_read(storage, head, &mut hdr);
        let msg_len = u32::from_le_bytes(hdr) as usize;
        debug_assert!(HDR + msg_len <= size);

        let copied = msg_len.min(buf.len());
        ring_read(storage, head + HDR, &mut buf[..copied]);

        let mut head = (head + HDR + msg_len) % cap;
        let mut size = size - HDR - msg_len;
        let mut count = count - 1;

        // Messages may have been waiting for this space. Store them in
        // strict queue order; stop at the first one that doesn't fit so
        // the order is preserved.
        let mut stalled = false;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, _token| {
                if stalled {
                    return false;
                }
                match payload {
                    WaitPayload::MsgSend { src, len } => {
                        // Safety: The sender's buffer is valid while it's
                        // waiting; we hold CPU Lock.
                        let data = unsafe { core::slice::from_raw_parts(*src, *len) };
                        if store_message(storage, head, size, data) {
                            size += HDR + len;
                            count += 1;
                            true
                        } else {
                            stalled = true;
                            false
                        }
                    }
                    _ => unreachable!(),
                }
            });

        if size == 0 {
            // Reset to the origin while the ring is empty; keeps long
            // messages from wrapping more than necessary
            head = 0;
        }

        self.head.replace(&mut *lock, head);
        self.size.replace(&mut *lock, size);
        self.count.replace(&mut *lock, count);

        Some(copied)
    }
}

/// Store a `{length prefix, payload}` frame at `head + size` if it fits.
fn store_message(storage: &mut [u8], head: usize, size: usize, data: &[u8]) -> bool {
    let cap = storage.len();
    if cap - size < HDR + data.len() {
        return false;
    }
    let tail = (head + size) % cap;
    ring_write(storage, tail, &(data.len() as u32).to_le_bytes());
    ring_write(storage, tail + HDR, data);
    true
}
