//! Tasks
use core::fmt;

use crate::{
    error::{ActivateTaskError, GetTaskPriorityError, SetTaskPriorityError, SleepError,
            UpdateError, WaitTimeoutError},
    klock, mutex, state, timeout, wait,
    utils::Init,
    KernelTraits, PortThreading, Priority, UTicks,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::ScheduleDecision;

/// *Task control block* — the state data of a task.
///
/// Tasks are declared statically (or leaked from the heap with the `alloc`
/// feature); the control block's storage is owned by its creator and must
/// outlive every object the task blocks on.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// The port-private state of the task (e.g., the saved stack pointer).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembly code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// The static properties of the task.
    pub attr: &'static TaskAttr<Traits>,

    /// The task's base priority.
    pub(super) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The task's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily raised by the mutex locking
    /// protocol:
    ///
    /// ```text
    /// effective = max(base, max over held mutexes m of
    ///                           m.wait_queue.head.effective)
    /// ```
    ///
    /// The effective priority determines the task's position within the
    /// ready queue and within wait queues. After updating it, the task must
    /// be repositioned in whichever queue contains it.
    pub(super) effective_priority: klock::CpuLockCell<Traits, Priority>,

    pub(super) st: klock::CpuLockCell<Traits, TaskSt>,

    /// Links this task into the ready queue while it's in the Ready state.
    pub(super) ready_queue_data: readyqueue::PerTaskData<Traits>,

    /// The wait state of the task.
    pub(super) wait: wait::TaskWait<Traits>,

    /// The last mutex locked by the task. Heads the singly-linked list of
    /// held mutexes (continued by [`MutexCb::prev_mutex_held`]).
    ///
    /// [`MutexCb::prev_mutex_held`]: crate::mutex::MutexCb::prev_mutex_held
    pub(super) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,
}

// Safety: The contents are only mutated with CPU Lock active
unsafe impl<Traits: PortThreading> Sync for TaskCb<Traits> {}

impl<Traits: PortThreading> TaskCb<Traits> {
    /// Construct a `TaskCb`.
    pub const fn new(attr: &'static TaskAttr<Traits>) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            attr,
            base_priority: klock::CpuLockCell::new(attr.priority),
            effective_priority: klock::CpuLockCell::new(attr.priority),
            st: klock::CpuLockCell::new(TaskSt::Dormant),
            ready_queue_data: Init::INIT,
            wait: Init::INIT,
            last_mutex_held: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("attr", self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .field(
                "last_mutex_held",
                // Don't print the contents of the mutex; that would recurse
                // (TaskCb → MutexCb → TaskCb → …)
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

/// The static properties of a task.
pub struct TaskAttr<Traits> {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code. Using this in other ways may cause an
    /// undefined behavior.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The initial base priority of the task.
    pub priority: Priority,

    /// Whether the task is activated automatically at boot.
    pub auto_start: bool,

    /// The size of the stack region to reserve for the task. Ignored by
    /// hosted ports.
    pub stack_size: usize,

    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits: PortThreading> TaskAttr<Traits> {
    pub const fn new(entry_point: fn(usize)) -> Self {
        Self {
            entry_point,
            entry_param: 0,
            priority: 0,
            auto_start: false,
            stack_size: Traits::STACK_DEFAULT_SIZE,
            _phantom: core::marker::PhantomData,
        }
    }

    pub const fn with_param(mut self, entry_param: usize) -> Self {
        self.entry_param = entry_param;
        self
    }

    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl<Traits> fmt::Debug for TaskAttr<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .field("priority", &self.priority)
            .field("auto_start", &self.auto_start)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task is not running and has no saved context. An activation
    /// builds a fresh context starting at the entry point.
    Dormant,

    /// The task is in the ready queue, waiting for its turn.
    Ready,

    /// The task is currently running.
    Running,

    /// The task is blocked on a waitable object, the delayed queue, or
    /// both.
    Waiting,
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Start the task's execution, transitioning it from the Dormant state
    /// into the Ready state.
    ///
    /// Returns `BadObjectState` if the task is not in the Dormant state.
    pub fn activate(&'static self) -> Result<(), ActivateTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        activate(lock, self)
    }

    /// Get the task's base priority.
    pub fn priority(&self) -> Result<Priority, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        if *self.st.read(&*lock) == TaskSt::Dormant {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(self.base_priority.get(&*lock))
        }
    }

    /// Get the task's effective priority, which may have been raised by the
    /// mutex locking protocol.
    pub fn effective_priority(&self) -> Result<Priority, GetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        if *self.st.read(&*lock) == TaskSt::Dormant {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(self.effective_priority.get(&*lock))
        }
    }

    /// Change the task's base priority.
    pub fn set_priority(&'static self, priority: Priority) -> Result<(), SetTaskPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;
        set_task_base_priority(lock, self, priority)
    }
}

/// Implements [`System::exit_task`].
///
/// [`System::exit_task`]: crate::System::exit_task
pub(super) unsafe fn exit_current_task<Traits: KernelTraits>() -> ! {
    assert!(
        Traits::is_task_context(),
        "`exit_task` was called from a non-task context"
    );

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Terminating while still owning a mutex would leave the mutex locked
    // forever and its waiters inheriting from a dead task.
    assert!(
        running_task.last_mutex_held.read(&*lock).is_none(),
        "task exited while holding a mutex"
    );

    // Transition the current task to Dormant
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Dormant);

    // Erase `running_task`
    Traits::state().running_task.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_task` acknowledges that all preexisting
    // data on the task stack will be invalidated and has promised that this
    // will not cause any UBs. (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}

/// Activate a task at boot time, if it is configured to start
/// automatically.
pub(super) fn init_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if task_cb.attr.auto_start && *task_cb.st.read(&*lock) == TaskSt::Dormant {
        // Safety: CPU Lock active, the task is in the Dormant state
        unsafe { Traits::initialize_task_state(task_cb) };

        // Safety: The previous state is Dormant and we just initialized the
        // task state, so this is safe
        unsafe { make_ready(lock.borrow_mut(), task_cb) };
    }
}

/// Implements [`TaskCb::activate`].
fn activate<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ActivateTaskError> {
    if *task_cb.st.read(&*lock) != TaskSt::Dormant {
        return Err(ActivateTaskError::BadObjectState);
    }

    // Safety: CPU Lock active, the task is in the Dormant state
    unsafe { Traits::initialize_task_state(task_cb) };

    // Reset the task priority
    task_cb
        .base_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb
        .effective_priority
        .replace(&mut *lock, task_cb.attr.priority);

    // Safety: The previous state is Dormant, and we just initialized the
    // task state, so this is safe
    unsafe { make_ready(lock.borrow_mut(), task_cb) };

    // If `task_cb` has a higher priority, perform a context switch.
    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state. If the previous state is `Dormant`,
/// the caller must initialize the task state first by calling
/// `initialize_task_state`.
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Make the task Ready
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    // Insert the task into the ready queue. `task_cb` must not be in the
    // ready queue already.
    Traits::state().task_ready_queue.push_back_task(lock, task_cb);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// `running_task`, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let prev_task_priority =
        if let Some(running_task) = Traits::state().running_task(lock.borrow_mut()) {
            if *running_task.st.read(&*lock) == TaskSt::Running {
                Some(running_task.effective_priority.get(&*lock))
            } else {
                None
            }
        } else {
            None
        };

    let has_preempting_task = Traits::state()
        .task_ready_queue
        .has_ready_task_above(lock.borrow_mut(), prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements [`PortToKernel::choose_running_task`].
///
/// [`PortToKernel::choose_running_task`]: crate::PortToKernel::choose_running_task
#[inline]
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    // The priority of `running_task`. `None` indicates that (1) there is no
    // running task, or (2) there was one but it is not running anymore, and
    // we need to elect a new task to run. In case (2), we want to update
    // `running_task` even if there's no schedulable task at all — that is,
    // we would still want to assign `None` to `running_task`. Therefore,
    // `pop_front_task` returns `SwitchTo(None)` in this case.
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_priority = if let Some(running_task) = prev_running_task {
        if *running_task.st.read(&*lock) == TaskSt::Running {
            Some(running_task.effective_priority.get(&*lock))
        } else {
            None
        }
    } else {
        None
    };

    // Decide the next task to run
    let decision = Traits::state()
        .task_ready_queue
        .pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,

        // There's no task willing to take over the current one, and the
        // current one can still run.
        ScheduleDecision::Keep => {
            debug_assert!(prev_task_priority.is_some());
            return;
        }
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == task as *const _ {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(running_task) = prev_running_task {
        match *running_task.st.read(&*lock) {
            TaskSt::Running => {
                // Transition `prev_running_task` into the Ready state.
                // Safety: The previous state is Running, so this is safe
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            TaskSt::Waiting | TaskSt::Ready => {
                // `prev_running_task` stays in its current state.
            }
            TaskSt::Dormant => unreachable!(),
        }
    }

    Traits::state()
        .running_task
        .replace(&mut *lock, next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(super) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    // Transition the current task to Waiting
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(*running_task.st.read(&*lock), TaskSt::Waiting);
    }
}

/// Implements [`System::sleep_for`].
///
/// [`System::sleep_for`]: crate::System::sleep_for
pub(super) fn put_current_task_on_sleep_for<Traits: KernelTraits>(
    delay: UTicks,
) -> Result<(), SleepError> {
    if delay == timeout::IMMEDIATE {
        return Ok(());
    }
    let time32 = timeout::time32_from_delay(delay)?;

    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    sleep_inner(lock.borrow_mut(), time32)
}

/// Implements [`System::sleep_until`].
///
/// [`System::sleep_until`]: crate::System::sleep_until
pub(super) fn put_current_task_on_sleep_until<Traits: KernelTraits>(
    at: UTicks,
) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let time32 = timeout::time32_until(lock.borrow_mut(), at);
    if time32 == 0 {
        // The deadline has already been reached
        return Ok(());
    }

    sleep_inner(lock.borrow_mut(), time32)
}

fn sleep_inner<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    time32: timeout::Time32,
) -> Result<(), SleepError> {
    // Wait until woken up by the timeout
    match wait::wait_no_queue_timeout(lock, wait::WaitPayload::Sleep, time32) {
        Err(WaitTimeoutError::Timeout) => Ok(()),
        // Nothing else can end a sleep
        Ok(_) | Err(_) => unreachable!(),
    }
}

/// Implements [`System::yield_now`].
///
/// [`System::yield_now`]: crate::System::yield_now
pub(super) fn yield_current_task<Traits: KernelTraits>() -> Result<(), UpdateError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_task_context::<Traits>()?;

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);

    // Rotate the task to the back of its priority class
    // Safety: The previous state is Running
    unsafe { make_ready(lock.borrow_mut(), running_task) };

    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    Ok(())
}

/// Implements [`TaskCb::set_priority`].
fn set_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    let st = *task_cb.st.read(&*lock);

    if st == TaskSt::Dormant {
        return Err(SetTaskPriorityError::BadObjectState);
    }

    let old_base_priority = task_cb.base_priority.get(&*lock);

    if old_base_priority == base_priority {
        return Ok(());
    }

    // Assign the new base priority, then let the mutex subsystem recompute
    // the effective priority (which accounts for priority inheritance) and
    // reposition the task in whatever queue holds it. If the task is
    // blocked on a mutex, the change propagates to the owner.
    task_cb.base_priority.replace(&mut *lock, base_priority);
    mutex::update_effective_priority_chain(lock.borrow_mut(), task_cb);

    // The change may allow a Ready task to preempt the current one: the
    // target itself, or — when the target is blocked on a mutex — an owner
    // that just inherited the raise.
    unlock_cpu_and_check_preemption(lock);

    Ok(())
}
