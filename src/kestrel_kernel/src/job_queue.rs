//! Job queues
//!
//! A job queue is a mailbox queue of procedure pointers. The `take`/`wait`
//! verbs dequeue one procedure and invoke it synchronously in the caller's
//! context, outside the critical section.
use core::fmt;

use crate::{
    error::{
        AbortReason, GetError, KillError, PollError, UpdateError, WaitError, WaitTimeoutError,
    },
    klock, state, task, timeout,
    utils::{Init, StorageCell},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, PortThreading, UTicks,
};

/// A unit of deferred work.
pub type Job = fn();

/// *Job queue control block* — a bounded queue of procedure pointers.
pub struct JobQueueCb<Traits: PortThreading> {
    /// The ring storage.
    storage: &'static StorageCell<[Option<Job>]>,

    /// The slot index of the oldest stored job.
    head: klock::CpuLockCell<Traits, usize>,

    /// The number of stored jobs.
    count: klock::CpuLockCell<Traits, usize>,

    pub(super) wait_queue: WaitQueue<Traits>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for JobQueueCb<Traits> {}

impl<Traits: PortThreading> JobQueueCb<Traits> {
    /// Construct a `JobQueueCb` over the given ring storage.
    pub const fn new(storage: &'static StorageCell<[Option<Job>]>) -> Self {
        Self {
            storage,
            head: klock::CpuLockCell::new(0),
            count: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for JobQueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobQueueCb")
            .field("self", &(self as *const _))
            .field("head", &self.head)
            .field("count", &self.count)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

/// The outcome of a non-blocking enqueue attempt.
enum GivePoll {
    /// The job was stored or handed to a waiting taker directly.
    Given { woke_taker: bool },
    /// The ring is full and no taker is waiting.
    Full,
}

impl<Traits: KernelTraits> JobQueueCb<Traits> {
    /// Enqueue a job, blocking indefinitely while the queue is full.
    pub fn send(&'static self, job: Job) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.give_core(lock.borrow_mut(), job) {
            GivePoll::Given { woke_taker } => {
                if woke_taker {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            GivePoll::Full => {
                self.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::JobSend { job })?;
                Ok(())
            }
        }
    }

    /// Enqueue a job, blocking for at most `delay` ticks.
    pub fn send_for(&'static self, job: Job, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.send(job).map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.give_core(lock.borrow_mut(), job) {
            GivePoll::Given { woke_taker } => {
                if woke_taker {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            GivePoll::Full if time32 == timeout::IMMEDIATE => Err(WaitTimeoutError::Timeout),
            GivePoll::Full => {
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::JobSend { job },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Enqueue a job, blocking until the tick count reaches `at`.
    pub fn send_until(&'static self, job: Job, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match self.give_core(lock.borrow_mut(), job) {
            GivePoll::Given { woke_taker } => {
                if woke_taker {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            GivePoll::Full => {
                let time32 = timeout::time32_until(lock.borrow_mut(), at);
                if time32 == timeout::IMMEDIATE {
                    return Err(WaitTimeoutError::Timeout);
                }
                self.wait_queue.wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::JobSend { job },
                    time32,
                )?;
                Ok(())
            }
        }
    }

    /// Enqueue a job without blocking, failing with `Timeout` while the
    /// queue is full. Usable from any context.
    pub fn give(&'static self, job: Job) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match self.give_core(lock.borrow_mut(), job) {
            GivePoll::Given { woke_taker } => {
                if woke_taker {
                    task::unlock_cpu_and_check_preemption(lock);
                }
                Ok(())
            }
            GivePoll::Full => Err(PollError::Timeout),
        }
    }

    /// Enqueue a job without blocking, discarding the oldest stored job to
    /// make room if the queue is full. When a sender is already parked on
    /// the full queue, the job is dropped instead and the call is a no-op.
    /// Usable from any context.
    pub fn push(&'static self, job: Job) -> Result<(), UpdateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match self.give_core(lock.borrow_mut(), job) {
            GivePoll::Given { woke_taker } => {
                if woke_taker {
                    task::unlock_cpu_and_check_preemption(lock);
                }
            }
            GivePoll::Full => {
                // The ring is at capacity, so any queued waiter is a sender
                // parked in `send`; the new job must not evict past it
                if !self.wait_queue.is_empty(lock.borrow_mut()) {
                    return Ok(());
                }

                let head = self.head.get(&*lock);

                // Safety: CPU Lock active
                let storage = unsafe { &mut *self.storage.get() };
                let capacity = storage.len();

                storage[head] = Some(job);
                self.head.replace(&mut *lock, (head + 1) % capacity);
            }
        }
        Ok(())
    }

    /// Dequeue one job and invoke it, blocking indefinitely while the queue
    /// is empty.
    pub fn wait(&'static self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(job) = self.take_core(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            job();
            return Ok(());
        }

        let payload = self
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::JobRecv { slot: Init::INIT })?;

        let job = if let WaitPayload::JobRecv { slot } = payload {
            slot.read(&*lock).get().unwrap()
        } else {
            unreachable!()
        };

        drop(lock);
        job();
        Ok(())
    }

    /// Dequeue one job and invoke it, blocking for at most `delay` ticks.
    pub fn wait_for(&'static self, delay: UTicks) -> Result<(), WaitTimeoutError> {
        if delay == timeout::INFINITE {
            return self.wait().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(job) = self.take_core(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            job();
            return Ok(());
        }
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::JobRecv { slot: Init::INIT },
            time32,
        )?;

        let job = if let WaitPayload::JobRecv { slot } = payload {
            slot.read(&*lock).get().unwrap()
        } else {
            unreachable!()
        };

        drop(lock);
        job();
        Ok(())
    }

    /// Dequeue one job and invoke it, blocking until the tick count reaches
    /// `at`.
    pub fn wait_until(&'static self, at: UTicks) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if let Some(job) = self.take_core(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            job();
            return Ok(());
        }

        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        if time32 == timeout::IMMEDIATE {
            return Err(WaitTimeoutError::Timeout);
        }

        let payload = self.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::JobRecv { slot: Init::INIT },
            time32,
        )?;

        let job = if let WaitPayload::JobRecv { slot } = payload {
            slot.read(&*lock).get().unwrap()
        } else {
            unreachable!()
        };

        drop(lock);
        job();
        Ok(())
    }

    /// Dequeue one job and invoke it without blocking, failing with
    /// `Timeout` while the queue is empty. Usable from any context.
    pub fn take(&'static self) -> Result<(), PollError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(job) = self.take_core(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
            job();
            Ok(())
        } else {
            Err(PollError::Timeout)
        }
    }

    /// Get the number of jobs currently stored.
    pub fn count(&self) -> Result<usize, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.count.get(&*lock))
    }

    /// Reset the job queue: the ring is emptied and every current waiter is
    /// woken up with `Stopped`.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        self.head.replace(&mut *lock, 0);
        self.count.replace(&mut *lock, 0);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        storage.fill(None);

        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Try to deliver `job`: directly to a waiting taker if the ring is
    /// empty, into the ring otherwise.
    fn give_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        job: Job,
    ) -> GivePoll {
        let head = self.head.get(&*lock);
        let count = self.count.get(&*lock);

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let capacity = storage.len();

        if count == 0 {
            // When the ring is empty, every waiter is a taker. Hand the job
            // to the most urgent one.
            let mut handed_over = false;
            self.wait_queue
                .wake_up_all_conditional(lock.borrow_mut(), |payload, token| {
                    if handed_over {
                        return false;
                    }
                    match payload {
                        WaitPayload::JobRecv { slot } => {
                            slot.read(&*token).set(Some(job));
                            handed_over = true;
                            true
                        }
                        _ => unreachable!(),
                    }
                });

            if handed_over {
                return GivePoll::Given { woke_taker: true };
            }
        }

        if count < capacity {
            storage[(head + count) % capacity] = Some(job);
            self.count.replace(&mut *lock, count + 1);
            GivePoll::Given { woke_taker: false }
        } else {
            GivePoll::Full
        }
    }

    /// Try to take the oldest job. On success, refill the freed slot from a
    /// blocked sender (if any).
    fn take_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<Job> {
        let head = self.head.get(&*lock);
        let count = self.count.get(&*lock);

        if count == 0 {
            return None;
        }

        // Safety: CPU Lock active
        let storage = unsafe { &mut *self.storage.get() };
        let capacity = storage.len();

        let job = storage[head].take().unwrap();
        let head = (head + 1) % capacity;
        let mut count = count - 1;

        // Refill the freed slot from the most urgent blocked sender
        let mut refilled = false;
        let tail = (head + count) % capacity;
        self.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, _token| {
                if refilled {
                    return false;
                }
                match payload {
                    WaitPayload::JobSend { job } => {
                        storage[tail] = Some(*job);
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

        Some(job)
    }
}
