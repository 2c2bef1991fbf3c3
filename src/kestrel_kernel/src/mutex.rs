//! Mutexes adhering to the priority-inheritance protocol.
//!
//! While a task waits to acquire a mutex, the owning task's effective
//! priority is raised to the priority of the most urgent waiter:
//!
//! ```text
//! effective = max(base, max over held mutexes m of
//!                           m.wait_queue.head.effective)
//! ```
//!
//! The raise is transitive: if the owner is itself blocked acquiring
//! another mutex, the raise propagates to that mutex's owner, and so on.
//! The walk is bounded by the total mutex-holding depth; cycles cannot form
//! because an acquisition that would close one is rejected with `Deadlock`
//! up front.
use core::fmt;

use crate::{
    error::{
        AbortReason, GetError, KillError, LockMutexError, LockMutexPrecheckError,
        LockMutexTimeoutError, TryLockMutexError, UnlockMutexError,
    },
    klock, state, task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::Init,
    wait::{self, WaitPayload, WaitQueue},
    KernelTraits, PortThreading, Priority, UTicks,
};

/// *Mutex control block* — a mutex object.
pub struct MutexCb<Traits: PortThreading> {
    /// `true` if the owner may lock the mutex again, maintaining a lock
    /// count, instead of deadlocking.
    recursive: bool,

    /// The number of extra acquisitions by the owner of a recursive mutex.
    lock_count: klock::CpuLockCell<Traits, u32>,

    pub(super) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// [`TaskCb::last_mutex_held`], containing all mutexes currently held
    /// by the owning task.
    pub(super) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static Self>>,

    /// The task that currently owns the mutex lock.
    pub(super) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for MutexCb<Traits> {}

impl<Traits: PortThreading> MutexCb<Traits> {
    /// Construct a non-recursive `MutexCb`.
    pub const fn new() -> Self {
        Self {
            recursive: false,
            lock_count: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
            prev_mutex_held: Init::INIT,
            owning_task: Init::INIT,
        }
    }

    /// Construct a recursive `MutexCb`. The owner may lock it repeatedly;
    /// the lock is released when `unlock` has been called as many times as
    /// `lock`.
    pub const fn new_recursive() -> Self {
        Self {
            recursive: true,
            lock_count: klock::CpuLockCell::new(0),
            wait_queue: Init::INIT,
            prev_mutex_held: Init::INIT,
            owning_task: Init::INIT,
        }
    }

    /// Construct a `MutexCb` on the kernel heap.
    #[cfg(feature = "alloc")]
    pub fn create() -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
    }
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("recursive", &self.recursive)
            .field("lock_count", &self.lock_count)
            .field("wait_queue", &self.wait_queue)
            .field(
                "owning_task",
                // break infinite recursion (TaskCb → MutexCb → TaskCb → …)
                &self
                    .owning_task
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Acquire the mutex, blocking indefinitely until it is available.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex(self, lock)
    }

    /// Acquire the mutex, blocking for at most `delay` ticks.
    ///
    /// [`IMMEDIATE`] makes the call equivalent to [`Self::try_lock`];
    /// [`INFINITE`] makes it equivalent to [`Self::lock`].
    ///
    /// [`IMMEDIATE`]: crate::IMMEDIATE
    /// [`INFINITE`]: crate::INFINITE
    pub fn lock_for(&'static self, delay: UTicks) -> Result<(), LockMutexTimeoutError> {
        if delay == timeout::INFINITE {
            return self.lock().map_err(Into::into);
        }
        let time32 = timeout::time32_from_delay(delay)?;
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        lock_mutex_timeout(self, lock, time32)
    }

    /// Acquire the mutex, blocking until the tick count reaches `at`.
    pub fn lock_until(&'static self, at: UTicks) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        let time32 = timeout::time32_until(lock.borrow_mut(), at);
        lock_mutex_timeout(self, lock, time32)
    }

    /// Acquire the mutex without blocking, failing with `Timeout` if it is
    /// unavailable.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        try_lock_mutex(self, lock)
    }

    /// Release the mutex.
    ///
    /// Returns `NotOwner` if the calling task does not own the mutex.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        unlock_mutex(self, lock)
    }

    /// Return a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&self) -> Result<bool, GetError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_task.get(&*lock).is_some())
    }

    /// Reset the mutex, waking up every current waiter with `Stopped` and
    /// clearing the owner link.
    pub fn kill(&'static self) -> Result<(), KillError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let owner = self.owning_task.replace(&mut *lock, None);
        self.lock_count.replace(&mut *lock, 0);

        if let Some(owner) = owner {
            unlink_held_mutex(lock.borrow_mut(), owner, self);
        }

        self.wait_queue
            .interrupt_all(lock.borrow_mut(), AbortReason::Stopped);

        // The owner may have been inheriting priority from the waiters that
        // are now gone
        if let Some(owner) = owner {
            update_effective_priority_chain(lock.borrow_mut(), owner);
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Check the error conditions covered by [`LockMutexPrecheckError`]:
///
///  - `Deadlock`: The current task already owns the mutex (non-recursive
///    case is checked by the caller), or blocking on the mutex would close
///    a wait cycle through the held-mutex chains.
///
/// Returns the currently running task for convenience of the caller.
#[inline]
fn precheck_and_get_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<&'static TaskCb<Traits>, LockMutexPrecheckError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Walk the chain `mutex → owner → mutex the owner waits for → …`. If it
    // leads back to the current task, blocking here would deadlock. The
    // walk doubles as the cycle guard for the priority-propagation walks:
    // because acquisitions that would close a cycle never block, the chains
    // are always acyclic.
    let mut maybe_owner = mutex_cb.owning_task.get(&*lock);
    while let Some(owner) = maybe_owner {
        if core::ptr::eq(owner, task) {
            return Err(LockMutexPrecheckError::Deadlock);
        }
        maybe_owner = wait::waited_mutex(lock.borrow_mut(), owner)
            .and_then(|m| m.owning_task.get(&*lock));
    }

    Ok(task)
}

/// Check if the current state of a mutex satisfies the wait condition.
///
/// If it satisfies the wait condition, this function updates it and returns
/// `true`. Otherwise, it returns `false`, indicating the calling task
/// should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    if mutex_cb.owning_task.get(&*lock).is_some() {
        false
    } else {
        lock_core(mutex_cb, running_task, lock);
        true
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running or Waiting state.
#[inline]
fn lock_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(matches!(
        *task.st.read(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));

    mutex_cb.owning_task.replace(&mut *lock, Some(task));

    // Push `mutex_cb` onto the list of the mutexes held by the task.
    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);
}

/// Handle the case where the running task already owns the mutex. Returns
/// `None` if the caller should proceed with a regular acquisition.
#[inline]
fn lock_by_owner<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<Result<(), LockMutexPrecheckError>> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    if core::ptr::eq(
        ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)),
        task,
    ) {
        if mutex_cb.recursive {
            mutex_cb.lock_count.replace_with(&mut *lock, |x| *x + 1);
            Some(Ok(()))
        } else {
            Some(Err(LockMutexPrecheckError::Deadlock))
        }
    } else {
        None
    }
}

#[inline]
fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    if let Some(result) = lock_by_owner(mutex_cb, lock.borrow_mut()) {
        return result.map_err(Into::into);
    }

    let running_task = precheck_and_get_running_task(lock.borrow_mut(), mutex_cb)?;

    if !poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        // The current state does not satisfy the wait condition. Raise the
        // owner's effective priority (priority inheritance), then start
        // waiting. The wake-upper is responsible for using `lock_core` to
        // complete the effect of the wait operation.
        let priority = running_task.effective_priority.get(&*lock);
        boost_owner_priority_chain(lock.borrow_mut(), mutex_cb, priority);

        mutex_cb
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb))?;
    }

    Ok(())
}

#[inline]
fn try_lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    if let Some(result) = lock_by_owner(mutex_cb, lock.borrow_mut()) {
        return result.map_err(Into::into);
    }

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if !poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        return Err(TryLockMutexError::Timeout);
    }

    Ok(())
}

#[inline]
fn lock_mutex_timeout<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    time32: timeout::Time32,
) -> Result<(), LockMutexTimeoutError> {
    if let Some(result) = lock_by_owner(mutex_cb, lock.borrow_mut()) {
        return result.map_err(Into::into);
    }

    let running_task = precheck_and_get_running_task(lock.borrow_mut(), mutex_cb)?;

    if !poll_core(mutex_cb, running_task, lock.borrow_mut()) {
        if time32 == timeout::IMMEDIATE {
            return Err(LockMutexTimeoutError::Timeout);
        }

        // See `lock_mutex`
        let priority = running_task.effective_priority.get(&*lock);
        boost_owner_priority_chain(lock.borrow_mut(), mutex_cb, priority);

        mutex_cb.wait_queue.wait_timeout(
            lock.borrow_mut(),
            WaitPayload::Mutex(mutex_cb),
            time32,
        )?;
    }

    Ok(())
}

#[inline]
fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if !core::ptr::eq(
        ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)),
        task,
    ) {
        // The current task does not currently own the mutex.
        return Err(UnlockMutexError::NotOwner);
    }

    if mutex_cb.recursive {
        let count = mutex_cb.lock_count.get(&*lock);
        if count > 0 {
            mutex_cb.lock_count.replace(&mut *lock, count - 1);
            return Ok(());
        }
    }

    // Remove `mutex_cb` from the list of the mutexes held by the task.
    let unlinked = unlink_held_mutex(lock.borrow_mut(), task, mutex_cb);
    debug_assert!(unlinked);

    // Hand the ownership to the next waiter (if any)
    unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());

    // Lower the task's effective priority. It no longer inherits from this
    // mutex's waiters. This may cause preemption.
    update_effective_priority_chain(lock.borrow_mut(), task);

    task::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Wake up the next waiter of the mutex.
///
/// This method doesn't restore the previous owner's effective priority.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    // Check if there are any other tasks waiting on the mutex
    if let Some(next_task) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task`
        lock_core(mutex_cb, next_task, lock.borrow_mut());

        // Wake up the next waiter
        assert!(mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()));

        // The new owner inherits from the waiters still in the queue
        update_effective_priority_chain(lock.borrow_mut(), next_task);
    } else {
        // There's no one waiting
        mutex_cb.owning_task.replace(&mut *lock, None);
    }
}

/// Remove `mutex_cb` from the held-mutex list of `task`. Returns `false` if
/// the mutex was not in the list.
fn unlink_held_mutex<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> bool {
    let mut prev: Option<&'static MutexCb<Traits>> = None;
    let mut maybe_cur = task.last_mutex_held.get(&*lock);

    while let Some(cur) = maybe_cur {
        if core::ptr::eq(cur, mutex_cb) {
            let next = cur.prev_mutex_held.replace(&mut *lock, None);
            match prev {
                None => task.last_mutex_held.replace(&mut *lock, next),
                Some(prev) => prev.prev_mutex_held.replace(&mut *lock, next),
            };
            return true;
        }
        prev = maybe_cur;
        maybe_cur = cur.prev_mutex_held.get(&*lock);
    }

    false
}

/// Reevaluate the task's effective priority from its base priority and held
/// mutexes, and return the result. (This function doesn't update
/// [`TaskCb::effective_priority`].)
pub(super) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        if let Some(waiter) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
            effective_priority = effective_priority.max(waiter.effective_priority.get(&*lock));
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Recompute the effective priority of `task_cb` from scratch and apply it,
/// repositioning the task in whatever queue holds it. If the task is
/// blocked acquiring a mutex, the change propagates to that mutex's owner,
/// transitively.
///
/// The walk is bounded by the length of the blocked-owner chain, which is
/// acyclic (see [`precheck_and_get_running_task`]).
pub(super) fn update_effective_priority_chain<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let mut task_cb = task_cb;
    loop {
        let base_priority = task_cb.base_priority.get(&*lock);
        let effective_priority =
            evaluate_task_effective_priority(lock.borrow_mut(), task_cb, base_priority);
        let old_effective_priority = task_cb
            .effective_priority
            .replace(&mut *lock, effective_priority);

        if old_effective_priority == effective_priority {
            break;
        }

        match *task_cb.st.read(&*lock) {
            TaskSt::Ready => {
                Traits::state()
                    .task_ready_queue
                    .reorder_task(lock.borrow_mut(), task_cb);
                break;
            }
            TaskSt::Running | TaskSt::Dormant => break,
            TaskSt::Waiting => {
                // Reposition the task in the wait queue it's blocked on
                wait::reorder_wait_of_task(lock.borrow_mut(), task_cb);

                // Propagate along the blocked-owner chain
                if let Some(mutex_cb) = wait::waited_mutex(lock.borrow_mut(), task_cb) {
                    if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
                        task_cb = owner;
                        continue;
                    }
                }
                break;
            }
        }
    }
}

/// Raise the effective priority of the mutex's owner to at least
/// `priority`, propagating along the blocked-owner chain. Called right
/// before the running task blocks on `mutex_cb`.
fn boost_owner_priority_chain<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    priority: Priority,
) {
    let mut mutex_cb = mutex_cb;
    loop {
        let Some(owner) = mutex_cb.owning_task.get(&*lock) else {
            break;
        };

        if owner.effective_priority.get(&*lock) >= priority {
            break;
        }
        owner.effective_priority.replace(&mut *lock, priority);

        match *owner.st.read(&*lock) {
            TaskSt::Ready => {
                Traits::state()
                    .task_ready_queue
                    .reorder_task(lock.borrow_mut(), owner);
                break;
            }
            TaskSt::Running => break,
            TaskSt::Waiting => {
                wait::reorder_wait_of_task(lock.borrow_mut(), owner);

                if let Some(next) = wait::waited_mutex(lock.borrow_mut(), owner) {
                    mutex_cb = next;
                    continue;
                }
                break;
            }
            TaskSt::Dormant => unreachable!(),
        }
    }
}

/// Release the mutex on behalf of a condition-variable wait, handing it to
/// the next waiter (if any) without yielding the processor.
///
/// The calling task must own the mutex exactly once; anything else is a
/// programming error and panics.
pub(super) fn unlock_for_cond_wait<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    assert!(
        core::ptr::eq(
            ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)),
            task,
        ),
        "the condition variable was waited on with a mutex not owned by the caller"
    );
    assert_eq!(
        mutex_cb.lock_count.get(&*lock),
        0,
        "the condition variable was waited on with a recursively locked mutex"
    );

    let unlinked = unlink_held_mutex(lock.borrow_mut(), task, mutex_cb);
    debug_assert!(unlinked);

    unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());
    update_effective_priority_chain(lock.borrow_mut(), task);
}

/// Re-acquire the mutex after a condition-variable wait ended.
pub(super) fn relock_after_cond_wait<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<(), crate::error::WaitError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if !poll_core(mutex_cb, task, lock.borrow_mut()) {
        let priority = task.effective_priority.get(&*lock);
        boost_owner_priority_chain(lock.borrow_mut(), mutex_cb, priority);

        mutex_cb
            .wait_queue
            .wait(lock, WaitPayload::Mutex(mutex_cb))?;
    }

    Ok(())
}

/// Called when a waiter left the mutex's wait queue without acquiring it
/// (timeout or kill of the waiting task's wait). The owner may have been
/// inheriting that waiter's priority.
pub(super) fn on_waiter_removed<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
        update_effective_priority_chain(lock.borrow_mut(), owner);
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
