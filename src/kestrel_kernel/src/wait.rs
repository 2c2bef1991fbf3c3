//! The wait protocol shared by every blocking primitive.
//!
//! A blocking operation constructs a *wait object* on the waiting task's
//! stack, inserts it into the target object's *wait queue* (ordered by task
//! priority, FIFO within a priority), and suspends the task. A wake-upper
//! removes the wait object, writes the wake-up reason (and, for the
//! data-carrying primitives, the transfer result) and makes the task Ready
//! again. The tick handler and `kill` use the same mechanism to deliver
//! `Timeout` and `Stopped`.
use core::{cell::Cell, fmt, pin::pin, ptr::NonNull};

use crate::{
    error::{expect_not_timeout, AbortReason, WaitError, WaitTimeoutError},
    event_group::{EventBits, EventWaitFlags},
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRef, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::{
        intrusive_list::{self, ListAccessorCell},
        Init,
    },
    KernelTraits, PortThreading, Priority,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed with CPU Lock active
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;
    use core::ops;

    pub struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortThreading> ops::Index<WaitRef<Traits>> for UnsafeStatic {
        type Output = Wait<Traits>;

        #[inline]
        fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
            // Safety: See `wait_queue_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
///
/// Safety: All elements of the list must be extant. This is upheld because a
/// `Wait` is never dropped while it's still in a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            unsafe { UnsafeStatic::new() },
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// *A wait object* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting task's
/// stack, and only survives until the method returns. This means that `Wait`
/// can expire only when the waiting task is not waiting anymore.
struct Wait<Traits: PortThreading> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`].
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Additional information included in `Wait`, specific to waitable object
/// types.
///
/// For the data-carrying primitives this doubles as the *transfer scratch*:
/// the wake-upper copies payload bytes while holding CPU Lock and records
/// the progress in the contained cells, which the woken task reads to
/// compute its return value.
pub(super) enum WaitPayload<Traits: PortThreading> {
    Semaphore,
    Mutex(&'static mutex::MutexCb<Traits>),
    EventBits {
        bits: EventBits,
        flags: EventWaitFlags,
        orig_bits: CpuLockCell<Traits, Cell<EventBits>>,
    },
    Signal,
    Barrier,
    CondVar,
    TimerTick,
    Sleep,
    MailboxSend {
        src: *const u8,
    },
    MailboxRecv {
        dst: *mut u8,
    },
    MsgSend {
        src: *const u8,
        len: usize,
    },
    MsgRecv {
        dst: *mut u8,
        cap: usize,
        /// The stored length of the received message. Written by the waker.
        len: CpuLockCell<Traits, Cell<usize>>,
    },
    StreamWrite {
        src: *const u8,
        len: usize,
        /// Bytes moved out of `src` so far. Written by wakers.
        transferred: CpuLockCell<Traits, Cell<usize>>,
    },
    StreamRead {
        dst: *mut u8,
        cap: usize,
        /// Bytes moved into `dst` so far. Written by wakers.
        transferred: CpuLockCell<Traits, Cell<usize>>,
    },
    JobSend {
        job: fn(),
    },
    JobRecv {
        slot: CpuLockCell<Traits, Cell<Option<fn()>>>,
    },
    PoolAlloc {
        slot: CpuLockCell<Traits, Cell<Option<NonNull<u8>>>>,
    },
}

impl<Traits: PortThreading> WaitPayload<Traits> {
    /// Return `self`.
    ///
    /// This might look redundant but helps the compiler move only the live
    /// parts of `WaitPayload` instead of `memcpy`-ing the whole union when
    /// a payload is moved into and out of a `Wait`.
    #[inline]
    fn r#move(self) -> Self {
        match self {
            Self::Semaphore => Self::Semaphore,
            Self::Mutex(x) => Self::Mutex(x),
            Self::EventBits {
                bits,
                flags,
                orig_bits,
            } => Self::EventBits {
                bits,
                flags,
                orig_bits,
            },
            Self::Signal => Self::Signal,
            Self::Barrier => Self::Barrier,
            Self::CondVar => Self::CondVar,
            Self::TimerTick => Self::TimerTick,
            Self::Sleep => Self::Sleep,
            Self::MailboxSend { src } => Self::MailboxSend { src },
            Self::MailboxRecv { dst } => Self::MailboxRecv { dst },
            Self::MsgSend { src, len } => Self::MsgSend { src, len },
            Self::MsgRecv { dst, cap, len } => Self::MsgRecv { dst, cap, len },
            Self::StreamWrite {
                src,
                len,
                transferred,
            } => Self::StreamWrite {
                src,
                len,
                transferred,
            },
            Self::StreamRead {
                dst,
                cap,
                transferred,
            } => Self::StreamRead {
                dst,
                cap,
                transferred,
            },
            Self::JobSend { job } => Self::JobSend { job },
            Self::JobRecv { slot } => Self::JobRecv { slot },
            Self::PoolAlloc { slot } => Self::PoolAlloc { slot },
        }
    }
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// Wait objects waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting tasks (`Wait::task`) must be in
    /// a Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,

    order: QueueOrder,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waits: Init::INIT,
        order: QueueOrder::TaskPriority,
    };
}

/// The ordering of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    #[allow(dead_code)]
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// The wait object describing the ongoing Waiting state of the task.
    /// Should be `None` iff the task is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper. Returned
    /// by [`WaitQueue::wait`].
    wait_result: CpuLockCell<Traits, Result<(), AbortReason>>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field(
                "current_wait",
                &self
                    .current_wait
                    .debug_fmt_with(|x, f| x.map(|x| x.0).fmt(f)),
            )
            .field("wait_result", &self.wait_result)
            .finish()
    }
}

/// Register a timeout object to interrupt `$task_cb` after the duration
/// specified by `$duration_time32`. The timeout object remains valid
/// throughout the current lexical scope.
///
/// This macro is used inside a blocking operation with timeout.
macro_rules! setup_timeout_wait {
    ($lock:ident, $task_cb:expr, $duration_time32:expr) => {
        // Create a timeout object.
        let timeout = pin!(new_timeout_object_for_task(
            $lock.borrow_mut(),
            $task_cb,
            $duration_time32
        ));

        // Use `TimeoutGuard` to automatically unregister the timeout when
        // leaving the current lexical scope.
        let mut timeout_guard = timeout::TimeoutGuard {
            timeout: timeout.as_ref(),
            lock: $lock,
        };
        let mut $lock = timeout_guard.lock.borrow_mut();

        // Register the timeout object
        timeout::insert_timeout($lock.borrow_mut(), timeout_guard.timeout);
    };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    #[inline]
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload: payload.r#move(),
        };

        self.wait_inner(lock, &wait).map_err(expect_not_timeout)?;

        Ok(wait.payload)
    }

    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state. The operation
    /// will time out after the specified duration.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    #[inline]
    pub(super) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration_time32: timeout::Time32,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload: payload.r#move(),
        };

        // Configure a timeout
        setup_timeout_wait!(lock, task, duration_time32);

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// The core portion of `Self::wait`.
    ///
    /// Passing `WaitPayload` by value is expensive, so moving `WaitPayload`
    /// into and out of `Wait` is done in the outer functions with
    /// `#[inline]`.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
    ) -> Result<(), AbortReason> {
        let task = wait.task;
        let wait_ref = WaitRef(wait.into());

        debug_assert!(core::ptr::eq(
            wait.task,
            Traits::state().running_task(lock.borrow_mut()).unwrap()
        ));
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        // Insert `wait_ref` into `self.waits`
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::TaskPriority => {
                let cur_task_pri = *task.effective_priority.read(&**accessor.cell_key());
                Self::find_insertion_position_by_task_priority(cur_task_pri, &accessor)
            }
        };

        // `wait_ref` is not linked, so this can't fail
        accessor.insert(wait_ref, insert_at).unwrap();

        // Set `task.current_wait`
        task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        // Transition the task into Waiting. This statement will complete
        // when the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper
        assert!(wait.link.read(&*lock).is_none());
        assert!(task.wait.current_wait.get(&*lock).is_none());

        // Return the wait result (`Ok(())` or `Err(_)`)
        task.wait.wait_result.get(&*lock)
    }

    /// Find the insertion position for a wait object owned by a task whose
    /// effective priority is `cur_task_pri`.
    ///
    /// The queue is ordered by descending urgency; the new wait object goes
    /// after every wait object of equal or greater priority (FIFO
    /// tie-break).
    fn find_insertion_position_by_task_priority<MapLink>(
        cur_task_pri: Priority,
        accessor: &ListAccessorCell<
            '_,
            &CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
            UnsafeStatic,
            MapLink,
            CpuLockTokenRefMut<'_, Traits>,
        >,
    ) -> Option<WaitRef<Traits>>
    where
        MapLink: Fn(
            &Wait<Traits>,
        ) -> &CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,
    {
        let mut insert_at = None;
        let mut cursor = accessor.back();
        while let Some(next_cursor) = cursor {
            // Should the new wait object be inserted at this or an earlier
            // position?
            let next_cursor_task = accessor.pool()[next_cursor].task;
            let next_cursor_task_pri = *next_cursor_task
                .effective_priority
                .read(&**accessor.cell_key());
            if next_cursor_task_pri < cur_task_pri {
                // If so, update `insert_at`. Continue searching because
                // there might be a viable position that is even earlier.
                insert_at = Some(next_cursor);
                cursor = accessor.prev(next_cursor);
            } else {
                break;
            }
        }
        insert_at
    }

    /// Reposition `wait` in the wait queue. This is necessary after
    /// changing the waiting task's priority.
    fn reorder_wait(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait: &Wait<Traits>) {
        match self.order {
            QueueOrder::Fifo => return,
            QueueOrder::TaskPriority => {}
        }

        let wait_ref = WaitRef(wait.into());
        let task = wait.task;
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());

        // Remove `wait_ref` first. It's linked, so this can't fail.
        accessor.remove(wait_ref).unwrap();

        // Re-insert `wait_ref` at the correct position.
        let cur_task_pri = *task.effective_priority.read(&**accessor.cell_key());
        let insert_at = Self::find_insertion_position_by_task_priority(cur_task_pri, &accessor);
        accessor.insert(wait_ref, insert_at).unwrap();
    }

    /// Get the next waiting task to be woken up.
    pub(super) fn first_waiting_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.front_data().map(|wait| wait.task)
    }

    /// Get the number of tasks currently waiting on this queue.
    pub(super) fn waiting_task_count(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.iter().count()
    }

    pub(super) fn is_empty(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.is_empty()
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        // Get the first wait object
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        let wait_ref = accessor.pop_front();

        let Some(wait_ref) = wait_ref else {
            return false;
        };

        // Safety: `wait_ref` points to a valid `Wait` because `wait_ref` was
        // in `self.waits` at the beginning of this function call.
        let wait = unsafe { wait_ref.0.as_ref() };

        assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        complete_wait(lock.borrow_mut(), wait, Ok(()));

        true
    }

    /// Conditionally wake up waiting tasks.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>, CpuLockTokenRef<'_, Traits>) -> bool,
    ) {
        let mut cur = {
            let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            accessor.front()
        };

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly remove `wait_ref`
            // from `self.waits`.
            cur = {
                let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
                accessor.next(wait_ref)
            };

            // Safety: `wait_ref` points to a valid `Wait` because `wait_ref`
            // is in `self.waits`.
            let wait = unsafe { wait_ref.0.as_ref() };

            assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

            // Should this task be woken up?
            //
            // We give `CpuLockTokenRef` to the callback function. This can
            // be used to update the transfer scratch of the payload but is
            // insufficient to do anything else. Especially, we want to
            // prevent the callback function from invalidating the assumption
            // that `wait_ref` is still linked after the call.
            if !cond(&wait.payload, lock.borrow()) {
                continue;
            }

            // Wake up the task
            let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
            accessor.remove(wait_ref).unwrap();

            complete_wait(lock.borrow_mut(), wait, Ok(()));
        }
    }

    /// End every current wait with the specified abort reason. Used by the
    /// `kill` operation of the waitable objects (reason: `Stopped`).
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn interrupt_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        reason: AbortReason,
    ) {
        loop {
            let wait_ref = {
                let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
                accessor.pop_front()
            };

            let Some(wait_ref) = wait_ref else { break };

            // Safety: `wait_ref` was in `self.waits`, so the pointee is
            // valid.
            let wait = unsafe { wait_ref.0.as_ref() };

            complete_wait(lock.borrow_mut(), wait, Err(reason));
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(mutex) => write!(f, "Mutex({mutex:p})"),
            Self::EventBits { bits, flags, .. } => f
                .debug_struct("EventBits")
                .field("bits", bits)
                .field("flags", flags)
                .finish_non_exhaustive(),
            Self::Signal => f.write_str("Signal"),
            Self::Barrier => f.write_str("Barrier"),
            Self::CondVar => f.write_str("CondVar"),
            Self::TimerTick => f.write_str("TimerTick"),
            Self::Sleep => f.write_str("Sleep"),
            Self::MailboxSend { .. } => f.write_str("MailboxSend"),
            Self::MailboxRecv { .. } => f.write_str("MailboxRecv"),
            Self::MsgSend { len, .. } => f.debug_struct("MsgSend").field("len", len).finish(),
            Self::MsgRecv { cap, .. } => f.debug_struct("MsgRecv").field("cap", cap).finish(),
            Self::StreamWrite { len, .. } => {
                f.debug_struct("StreamWrite").field("len", len).finish()
            }
            Self::StreamRead { cap, .. } => f.debug_struct("StreamRead").field("cap", cap).finish(),
            Self::JobSend { .. } => f.write_str("JobSend"),
            Self::JobRecv { .. } => f.write_str("JobRecv"),
            Self::PoolAlloc { .. } => f.write_str("PoolAlloc"),
        }
    }
}

/// Access the specified task's current wait payload object in the supplied
/// closure.
///
/// The wait object might get deallocated when the task starts running. This
/// function allows access to the wait object while ensuring the reference to
/// the wait object doesn't escape from the scope.
pub(super) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = task_cb.wait.current_wait.get(&*lock);

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(wait)
}

/// Get the mutex the task is currently blocked on, if any.
pub(super) fn waited_mutex<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
) -> Option<&'static mutex::MutexCb<Traits>> {
    with_current_wait_payload(lock, task_cb, |payload| {
        if let Some(&WaitPayload::Mutex(mutex_cb)) = payload {
            Some(mutex_cb)
        } else {
            None
        }
    })
}

/// Reposition the given task's wait object within the wait queue. This is
/// necessary after changing the task's priority because wait queues are
/// sorted by task priority.
///
/// This function does nothing if the task is currently not in the Waiting
/// state or the wait object is not associated with any wait queue.
pub(super) fn reorder_wait_of_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
) {
    let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = unsafe { &*wait_ref.0.as_ptr() };

    if let Some(wait_queue) = wait.wait_queue {
        wait_queue.reorder_wait(lock, wait);
    }
}

/// Create a wait object pertaining to the currently running task but not
/// pertaining to any wait queue. Transition the task into the Waiting state.
/// The operation will time out after the specified duration.
///
/// The only way to end such a wait operation is to let it time out. Used by
/// `sleep`.
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `expect_waitable_context` to do that.
#[inline]
pub(super) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    duration_time32: timeout::Time32,
) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let wait = Wait {
        task,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload: payload.r#move(),
    };

    // Configure a timeout
    setup_timeout_wait!(lock, task, duration_time32);

    wait_no_queue_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// The core portion of [`wait_no_queue_timeout`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
) -> Result<(), AbortReason> {
    let task = wait.task;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(core::ptr::eq(
        wait.task,
        Traits::state().running_task(lock.borrow_mut()).unwrap()
    ));
    debug_assert!(wait.wait_queue.is_none());
    debug_assert!(wait.link.read(&*lock).is_none());

    // Set `task.current_wait`
    task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    // Transition the task into Waiting. This statement will complete when
    // the task is woken up.
    task::wait_until_woken_up(lock.borrow_mut());

    // `wait_ref` should have been removed from `current_wait` by a
    // wake-upper
    assert!(task.wait.current_wait.get(&*lock).is_none());

    // Return the wait result
    task.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait object from its waiting task (`wait.task`)
/// and wake up the task.
///
/// Panics if `wait` is not associated (anymore) with its waiting task.
///
/// This method doesn't remove `wait` from `WaitQueue::waits`.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), AbortReason>,
) {
    let task_cb = wait.task;

    // Clear `TaskWait::current_wait`
    assert_eq!(
        *task_cb.wait.current_wait.read(&*lock),
        Some(WaitRef(wait.into()))
    );
    task_cb.wait.current_wait.replace(&mut *lock, None);

    // Set a wait result
    let _ = task_cb.wait.wait_result.replace(&mut *lock, wait_result);

    assert_eq!(*task_cb.st.read(&*lock), TaskSt::Waiting);

    // Make the task Ready
    //
    // Safety: The task is in the Waiting state, meaning the task state is
    // valid and ready to resume from the point where it was previously
    // interrupted. A proper clean up for exiting the Waiting state is
    // already done as well.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Interrupt any ongoing wait operation of the task.
///
/// This method may make the task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `false` if the task is not in the Waiting state (e.g., because
/// a wake-upper completed the wait just before a timeout fired).
pub(super) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    reason: AbortReason,
) -> bool {
    if *task_cb.st.read(&*lock) != TaskSt::Waiting {
        return false;
    }

    // The task is in the Waiting state, so `current_wait` must be `Some(_)`
    let wait_ref = task_cb.wait.current_wait.get(&*lock).unwrap();

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = unsafe { wait_ref.0.as_ref() };

    // Remove `wait` from the wait queue it belongs to
    if let Some(wait_queue) = wait.wait_queue {
        let mut accessor = wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut());
        accessor.remove(wait_ref).unwrap();
    }

    // If the task was blocked acquiring a mutex, its departure may lower
    // the priority the owner inherits from the wait queue.
    let aborted_mutex = if let WaitPayload::Mutex(mutex_cb) = &wait.payload {
        Some(*mutex_cb)
    } else {
        None
    };

    // Wake up the task
    complete_wait(lock.borrow_mut(), wait, Err(reason));

    if let Some(mutex_cb) = aborted_mutex {
        mutex::on_waiter_removed(lock.borrow_mut(), mutex_cb);
    }

    true
}

/// Construct [`timeout::Timeout`] to interrupt the specified task with
/// [`AbortReason::Timeout`] after a certain period of time.
fn new_timeout_object_for_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    duration_time32: timeout::Time32,
) -> timeout::Timeout<Traits> {
    // Construct a `Timeout`, supplying our callback function
    let param = task_cb as *const _ as usize;
    let timeout_object = timeout::Timeout::new(interrupt_task_by_timeout::<Traits>, param);

    /// The callback function
    fn interrupt_task_by_timeout<Traits: KernelTraits>(
        param: usize,
        mut lock: CpuLockGuard<Traits>,
    ) -> CpuLockGuard<Traits> {
        // Safety: We are just converting `param` back to the original form
        let task_cb = unsafe { &*(param as *const TaskCb<Traits>) };

        // Interrupt the task. Even if the task has already been unblocked,
        // we don't care.
        let _ = interrupt_task(lock.borrow_mut(), task_cb, AbortReason::Timeout);

        lock
    }

    // Configure the `Timeout` to expire in `duration_time32`
    timeout_object.set_expiration_after(lock, duration_time32);

    timeout_object
}
