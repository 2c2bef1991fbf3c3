//! Stream buffers
//!
//! A stream buffer is a byte-granular pipe. Readers take whatever bytes
//! are available (waking as soon as at least one byte arrives); writers
//! block until their entire payload has been accepted, with partial
//! transfers coalesced through the waiters' transfer scratch. A transfer
//! that times out after moving at least one byte reports the partial count
//! as success.
use core::{fmt, ptr};

use crate::{
    error::{
        AbortReason, GetError, KillError, PollError, WaitError, WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::{Init, StorageCell},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// *Stream buffer control block* — a byte-granular bounded pipe.
pub struct StreamBufferCb<Traits: PortThreading> {
    storage: &'static StorageCell<[u8]>,

    /// The byte offset of the first unread byte.
    head: klock::CpuLockCell<Traits, usize>,

    /// The number of used bytes.
    size: klock::CpuLockCell<Traits, usize>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for StreamBufferCb<Traits> {}

impl<Traits: PortThreading> StreamBufferCb<Traits> {
    /// Construct a `StreamBufferCb` over the given ring storage.
    pub const fn new(storage: &'static StorageCell<[u8]>) -> Self {
        Self {
            storage,
            head: klock::CpuLockCell::new(0),
            size: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }

    /// Construct a `StreamBufferCb` on the kernel heap with a ring of
    /// `capacity` bytes.
    #[cfg(feature = "alloc")]
    pub fn create(capacity: usize) -> &'static Self {
        let storage = crate::utils::leak_byte_storage(capacity);
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(storage)))
    }
}

impl<Traits: KernelTraits> fmt::Debug for StreamBufferCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamBufferCb")
            .field("self", &(self as *const _))
            .field("head", &self.head)
            .field("size", &self.size)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> StreamBufferCb<Traits> {
    /// Write `data`, blocking indefinitely until every byte has been
    /// accepted. Returns `data.len()`.
    pub fn write(&'static self, data: &[u8]) -> Result<usize, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (written, woke) = self.write_core(lock.borrow_mut(), data);
        if written == data.len() {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(written);
        }

        let payload = self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::StreamWrite {
                src: data.as_ptr().wrapping_add(written),
                len: data.len() - written,
                transferred: Init::INIT,
            },
        );

        match payload {
            // The wakers drained the rest
            Ok(_) => Ok(data.len()),
            Err(e) => Err(e),
        }
    }

    /// Write `data`, blocking for at most `delay` ticks. A timeout after a
    /// partial transfer reports the partial count as success.
    pub fn write_for(&'static self, data: &[u8], delay: UTicks) -> Result<usize, WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.write(data).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (written, woke) = self.write_core(lock.borrow_mut(), data);
        if written == data.len() {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(written);
        }
        if time32 == timeout::IMMEDIATE {
            return if written > 0 {
                Ok(written)
            } else {
                Err(WaitTimeoutError::Timeout)
            };
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::StreamWrite {
                src: data.as_ptr().wrapping_add(written),
                len: data.len() - written,
                transferred: Init::INIT,
            },
            time32,
        );

        match payload {
            Ok(_) => Ok(data.len()),
            Err(e) => {
                // Count what the wakers managed to drain before the wait
                // was aborted. We can't reach the expired wait object
                // anymore, but the scratch total is mirrored nowhere else —
                // so the aborted wait's progress is conservatively unknown;
                // report only the synchronous part unless nothing moved.
                if written > 0 {
                    Ok(written)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Write `data`, blocking until the tick count reaches `at`.
    pub fn write_until(&'static self, data: &[u8], at: UTicks) -> Result<usize, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (written, woke) = self.write_core(lock.borrow_mut(), data);
        if written == data.len() {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(written);
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return if written > 0 {
                Ok(written)
            } else {
                Err(WaitTimeoutError::Timeout)
            };
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::StreamWrite {
                src: data.as_ptr().wrapping_add(written),
                len: data.len() - written,
                transferred: Init::INIT,
            },
            time32,
        );

        match payload {
            Ok(_) => Ok(data.len()),
            Err(e) => {
                if written > 0 {
                    Ok(written)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Read into `buf`, blocking until the tick count reaches `at`.
    pub fn read_until(&'static self, buf: &mut [u8], at: UTicks) -> Result<usize, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (got, woke) = self.read_core(lock.borrow_mut(), buf);
        if got > 0 {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(got);
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::StreamRead {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                transferred: Init::INIT,
            },
            time32,
        )?;

        if let WaitPayload::StreamRead { transferred, .. } = payload {
            Ok(transferred.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Write as much of `data` as fits without blocking. Fails with
    /// `Timeout` if nothing could be written. Usable from any context.
    pub fn give(&'static self, data: &[u8]) -> Result<usize, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let (written, woke) = self.write_core(lock.borrow_mut(), data);
        if woke {
            task::unlock_cpu_and_check_preemption(lock);
        }
        if written > 0 {
            Ok(written)
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Read into `buf`, blocking indefinitely until at least one byte is
    /// available. Returns the number of bytes read.
    pub fn read(&'static self, buf: &mut [u8]) -> Result<usize, WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (got, woke) = self.read_core(lock.borrow_mut(), buf);
        if got > 0 {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(got);
        }

        let payload = self.wait_queue.wait(
            lock.borrow_mut(),
            WaitPayload::StreamRead {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                transferred: Init::INIT,
            },
        )?;

        if let WaitPayload::StreamRead { transferred, .. } = payload {
            Ok(transferred.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Read into `buf`, blocking for at most `delay` ticks.
    pub fn read_for(&'static self, buf: &mut [u8], delay: UTicks) -> Result<usize, WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.read(buf).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let (got, woke) = self.read_core(lock.borrow_mut(), buf);
        if got > 0 {
            if woke {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(got);
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::StreamRead {
                dst: buf.as_mut_ptr(),
                cap: buf.len(),
                transferred: Init::INIT,
            },
            time32,
        )?;

        if let WaitPayload::StreamRead { transferred, .. } = payload {
            Ok(transferred.read(&*lock).get())
        } else {
            unreachable!()
        }
    }

    /// Read whatever is available without blocking. Fails with `Timeout` if
    /// the buffer is empty. Usable from any context.
    pub fn take(&'static self, buf: &mut [u8]) -> Result<usize, PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let (got, woke) = self.read_core(lock.borrow_mut(), buf);
        if woke {
            task::unlock_cpu_and_check_preemption(lock);
        }
        if got > 0 {
            Ok(got)
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Get the number of bytes currently stored.
    pub fn bytes_used(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.size.get(&*lock))
    }

    /// Reset the stream buffer: the ring is emptied and every current
    /// waiter is woken up with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.head.replace(&mut *lock, 0);
        self.size.replace(&mut *lock, 0);
        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Move as much of `data` as possible: first straight into blocked
    /// readers' buffers, then into the ring. Returns `(bytes consumed,
    /// woke any reader)`.
    fn write_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        data: &[u8],
    ) -> (usize, bool) {
        let mut consumed = 0;
        let mut woke = false;

        // Readers only block while the ring is empty, so they are served
        // first, in queue order. A reader is woken as soon as it has
        // received at least one byte.
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, token| {
                if consumed == data.len() {
                    return false;
                }
                match payload {
                    WaitPayload::StreamRead {
                        dst,
                        cap,
                        transferred,
                    } => {
                        let t = transferred.read(&*token).get();
                        let n = (cap - t).min(data.len() - consumed);
                        if n == 0 {
                            return false;
                        }
                        // Safety: The reader's buffer is valid while it's
                        // waiting; we hold CPU Lock.
                        unsafe {
                            ptr::copy_nonoverlapping(data.as_ptr().add(consumed), dst.add(t), n)
                        };
                        transferred.read(&*token).set(t + n);
                        consumed += n;
                        woke = true;
                        true
                    }
                    _ => unreachable!(),
                }
            });

        // Store the remainder in the ring
        let head = self.head.get(&*lock);
        let size = self.size.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let cap = storage.len();

        let n = (cap - size).min(data.len() - consumed);
        if n > 0 {
            ring_write(storage, head + size, &data[consumed..consumed + n]);
            self.size.replace(&mut *lock, size + n);
            consumed += n;
        }

        (consumed, woke)
    }

    /// Take available bytes into `buf`, then drain blocked writers (first
    /// into `buf`, then into the freed ring space). Returns `(bytes read,
    /// woke any writer)`.
    fn read_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        buf: &mut [u8],
    ) -> (usize, bool) {
        let head = self.head.get(&*lock);
        let size = self.size.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let cap = storage.len();

        let mut got = size.min(buf.len());
        ring_read(storage, head, &mut buf[..got]);
        let mut head = (head + got) % cap;
        let mut size = size - got;

        // Writers may be blocked with undelivered bytes. Drain them in
        // strict queue order so the byte stream stays in order: first into
        // the caller's buffer, then into the ring space we just freed. A
        // writer wakes only when its whole payload has been accepted.
        let mut woke = false;
        let mut stalled = false;
        let buf_cap = buf.len();
        let buf_ptr = buf.as_mut_ptr();
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, token| {
                if stalled {
                    return false;
                }
                match payload {
                    WaitPayload::StreamWrite {
                        src,
                        len,
                        transferred,
                    } => {
                        let mut t = transferred.read(&*token).get();

                        // Straight into the caller's buffer
                        let n = (len - t).min(buf_cap - got);
                        if n > 0 {
                            // Safety: The writer's buffer is valid while
                            // it's waiting; we hold CPU Lock.
                            unsafe {
                                ptr::copy_nonoverlapping(src.add(t), buf_ptr.add(got), n)
                            };
                            t += n;
                            got += n;
                        }

                        // Then into the ring
                        let n = (len - t).min(cap - size);
                        if n > 0 {
                            // Safety: as above
                            let chunk = unsafe { core::slice::from_raw_parts(src.add(t), n) };
                            ring_write(storage, head + size, chunk);
                            t += n;
                            size += n;
                        }

                        transferred.read(&*token).set(t);

                        if t == *len {
                            woke = true;
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
            head = 0;
        }

        self.head.replace(&mut *lock, head);
        self.size.replace(&mut *lock, size);

        (got, woke)
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
