//! The Kestrel RTOS kernel
//!
//! Kestrel is a compact preemptive, priority-based real-time kernel. This
//! crate contains the portable part of the kernel: the scheduler, the
//! tickless time base, the generic wait protocol shared by every blocking
//! primitive, the priority-inheritance mutex, and the primitives themselves.
//!
//! # System types
//!
//! The kernel is instantiated by defining a *system traits type* — an empty
//! type implementing [`PortThreading`] and [`PortTimer`] (usually written by
//! a port crate) and [`KernelCfg`] (the application- or test-side
//! configuration: the kernel state singleton, the timeout heap capacity,
//! and the tasks to activate at boot). All kernel objects and services are
//! generic over this type, so kernel state is resolved statically.
//!
//! # Contexts
//!
//! Code runs in one of the following contexts:
//!
//!  - **Task context** — inside a task. All services are available. A
//!    *waitable* context is a task context in which CPU Lock is inactive;
//!    only there may a service block.
//!  - **Interrupt context** — inside an interrupt handler or timer callback.
//!    Only non-blocking verbs (`give`, `take`, `push`, `signal`, …) may be
//!    used; the blocking verbs return [`WaitError::BadContext`].
//!
//! [`WaitError::BadContext`]: crate::error::WaitError::BadContext
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "alloc")]
extern crate alloc;

use core::{fmt, marker::PhantomData, mem::forget};

pub mod utils;

mod barrier;
mod cond_var;
pub mod error;
mod event_group;
mod job_queue;
mod klock;
mod mailbox;
mod mem_pool;
mod msg_buffer;
mod mutex;
mod semaphore;
mod signal;
mod state;
mod stream_buffer;
mod task;
mod timeout;
mod timer;
mod wait;

pub use self::{
    barrier::*, cond_var::*, event_group::*, job_queue::*, mailbox::*, mem_pool::*,
    msg_buffer::*, mutex::*, semaphore::*, signal::*, stream_buffer::*, task::*, timer::*,
};
pub use self::error::ResultCode;
pub use self::timeout::{TimeoutRef, DELAY_MAX, IMMEDIATE, INFINITE};

use self::error::{CpuLockError, GetError, SleepError, TimeError, UpdateError};
use self::utils::{binary_heap::VecLike, Init};

/// Unsigned integer type representing a tick count. The tick period is
/// defined by the port (usually one microsecond or one millisecond).
pub type UTicks = u32;

/// A fixed-capacity backing store for the timeout heap, for use as
/// [`KernelCfg::TimeoutHeap`]. `LEN` bounds the number of concurrently
/// outstanding timeouts (bounded waits plus armed timers).
pub type TimeoutHeap<Traits, const LEN: usize> =
    arrayvec::ArrayVec<timeout::TimeoutRef<Traits>, LEN>;

/// Task priority. Greater values are more urgent.
pub type Priority = u8;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// The port-private per-task state (e.g., the saved stack pointer).
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The initial value of [`TaskCb::port_task_state`] for all tasks.
    #[allow(clippy::declare_interior_mutable_const)] // it's intentional
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The default stack size for tasks.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// Transfer the control to the task indicated by the kernel state,
    /// discarding the current (startup) context.
    ///
    /// Precondition: CPU Lock active, Startup phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// a dispatcher. The dispatcher should call
    /// [`PortToKernel::choose_running_task`] to find the next task to run
    /// and transfer the control to that task.
    ///
    /// In an interrupt context, the effect of this method is deferred until
    /// the processor completes the execution of all active interrupt
    /// handlers (PendSV-style).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (`task`, which might
    /// already have been removed from the kernel's running-task slot) and
    /// proceed to the dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;

    /// Disable all kernel-managed interrupts (this state is called
    /// *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate the CPU Lock state if it is currently inactive and return
    /// `true`. Return `false` otherwise.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Prepare the task for activation. More specifically, set the current
    /// program counter to [`TaskAttr::entry_point`] and the current stack
    /// pointer to either end of the task's stack region, ensuring the task
    /// will start execution from `entry_point` next time the task receives
    /// the control.
    ///
    /// Do not call this for a running task. Calling this for a dormant task
    /// is always safe.
    ///
    /// Precondition: CPU Lock active
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// the system timer — either a periodic tick interrupt or a free-running
/// hardware timer with a programmable compare deadline (tickless).
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub trait PortTimer {
    /// The maximum value that [`tick_count`] can return. Must be greater
    /// than zero.
    ///
    /// [`tick_count`]: Self::tick_count
    const MAX_TICK_COUNT: UTicks;

    /// The maximum value that can be passed to [`pend_tick_after`]. Must be
    /// greater than zero.
    ///
    /// This value should be somewhat smaller than `MAX_TICK_COUNT`. The
    /// difference determines the kernel's resilience against overdue timer
    /// interrupts.
    ///
    /// [`pend_tick_after`]: Self::pend_tick_after
    const MAX_TIMEOUT: UTicks;

    /// Read the current tick count (timer value).
    ///
    /// This value steadily increases over time. When it goes past
    /// `MAX_TICK_COUNT`, it "wraps around" to `0`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn tick_count() -> UTicks;

    /// Indicate that `tick_count_delta` ticks may elapse before the kernel
    /// should receive a call to [`PortToKernel::timer_tick`].
    ///
    /// It's legal to ignore the calls to this method entirely and call
    /// `timer_tick` at a steady rate, resulting in a "tickful" kernel. The
    /// default implementation does nothing, assuming that the port driver
    /// is implemented in this way.
    ///
    /// `tick_count_delta` must be in range `1..=`[`MAX_TIMEOUT`].
    ///
    /// Precondition: CPU Lock active
    ///
    /// [`MAX_TIMEOUT`]: Self::MAX_TIMEOUT
    unsafe fn pend_tick_after(tick_count_delta: UTicks) {
        let _ = tick_count_delta;
    }

    /// Pend a call to [`PortToKernel::timer_tick`] as soon as possible.
    ///
    /// The default implementation calls `pend_tick_after(1)`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn pend_tick() {
        unsafe { Self::pend_tick_after(1) };
    }
}

/// Represents the group of traits that a port implements.
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}

/// Associates a system traits type with the kernel configuration: the
/// kernel-private state singleton, the timeout heap, and the startup task
/// set.
///
/// # Safety
///
/// `state` must return the same object every time, and that object must not
/// be shared with another system traits type.
pub unsafe trait KernelCfg: Port + Sized + 'static {
    /// The backing store of the timeout heap. Chooses the maximum number of
    /// concurrently outstanding timeouts.
    type TimeoutHeap: VecLike<Element = timeout::TimeoutRef<Self>> + Init + fmt::Debug + 'static;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    /// The tasks to activate during boot.
    fn startup_tasks() -> &'static [&'static TaskCb<Self>] {
        &[]
    }
}

/// The traits of a complete system type: a port plus its kernel
/// configuration.
pub trait KernelTraits: Port + KernelCfg {}

impl<T: Port + KernelCfg> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize the runtime structures and start the first task.
    ///
    /// Should be called exactly once by the port before calling into any
    /// user (application) or kernel code.
    ///
    /// Precondition: CPU Lock active, Preboot phase
    unsafe fn boot() -> !;

    /// Determine the next task to run and store it in the kernel's
    /// running-task slot.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by a port timer driver to "announce" new ticks.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: (1) User code hasn't executed yet at this point. (2) The
        // caller ensures CPU Lock is active.
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };

        // Activate the startup tasks
        for cb in Self::startup_tasks() {
            task::init_task(lock.borrow_mut(), cb);
        }

        // Choose the first task to run
        task::choose_next_running_task(lock.borrow_mut());

        // Initialize the timekeeping system
        Self::state().timeout.init(lock.borrow_mut());

        // Safety: CPU Lock is active, Startup phase. `lock` is never
        // dropped because `dispatch_first_task` diverges.
        unsafe { Self::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };

        task::choose_next_running_task(lock.borrow_mut());

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Self>();
    }
}

/// Global kernel state.
pub struct State<Traits: KernelCfg> {
    /// The currently or recently running task. Can be in a Running or
    /// Waiting state.
    running_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The ready queue: the priority-ordered list of runnable tasks.
    task_ready_queue: task::readyqueue::ReadyQueue<Traits>,

    /// The global state of the timekeeping system.
    timeout: timeout::TimeoutGlobals<Traits, Traits::TimeoutHeap>,
}

impl<Traits: KernelCfg> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        task_ready_queue: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field(
                "running_task",
                &self
                    .running_task
                    .debug_fmt_with(|t, f| t.map(|t| t as *const _).fmt(f)),
            )
            .field("task_ready_queue", &self.task_ready_queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<Traits: KernelCfg> State<Traits> {
    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(&*lock)
    }
}

/// Provides access to the global API functions exposed by the kernel.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Activate CPU Lock.
    ///
    /// Returns [`CpuLockError::BadContext`] if CPU Lock is already active.
    pub fn acquire_cpu_lock() -> Result<(), CpuLockError> {
        if Traits::is_cpu_lock_active() {
            Err(CpuLockError::BadContext)
        } else {
            // Safety: CPU Lock inactive
            unsafe { Traits::enter_cpu_lock() };
            Ok(())
        }
    }

    /// Deactivate CPU Lock.
    ///
    /// Returns [`CpuLockError::BadContext`] if CPU Lock is already inactive.
    ///
    /// # Safety
    ///
    /// CPU Lock is useful for creating a critical section. By making this
    /// method `unsafe`, safe code is prevented from interfering with a
    /// critical section.
    pub unsafe fn release_cpu_lock() -> Result<(), CpuLockError> {
        if !Traits::is_cpu_lock_active() {
            Err(CpuLockError::BadContext)
        } else {
            // Safety: CPU Lock active
            unsafe { Traits::leave_cpu_lock() };
            Ok(())
        }
    }

    /// Return a flag indicating whether CPU Lock is currently active.
    pub fn has_cpu_lock() -> bool {
        Traits::is_cpu_lock_active()
    }

    /// Get the current tick count.
    ///
    /// The value wraps around at the port-defined tick range. Use it only to
    /// derive relative deadlines (e.g., for the `_until` verbs).
    pub fn time() -> Result<UTicks, TimeError> {
        timeout::system_time::<Traits>()
    }

    /// Block the current task for the specified duration.
    ///
    /// `IMMEDIATE` returns immediately; `INFINITE` is rejected with
    /// `BadParam` (a sleep must have a deadline).
    pub fn sleep_for(delay: UTicks) -> Result<(), SleepError> {
        task::put_current_task_on_sleep_for::<Traits>(delay)
    }

    /// Block the current task until the specified tick count is reached.
    ///
    /// A deadline that has already passed returns immediately.
    pub fn sleep_until(at: UTicks) -> Result<(), SleepError> {
        task::put_current_task_on_sleep_until::<Traits>(at)
    }

    /// Relinquish the processor, moving the current task to the back of its
    /// priority class.
    pub fn yield_now() -> Result<(), UpdateError> {
        task::yield_current_task::<Traits>()
    }

    /// Get the currently running task.
    pub fn current_task() -> Result<&'static TaskCb<Traits>, GetError> {
        if !Traits::is_task_context() {
            return Err(GetError::BadContext);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().running_task(lock.borrow_mut()).unwrap())
    }

    /// Terminate the current task, putting it into the Dormant state.
    ///
    /// The kernel (to be precise, the port) makes an implicit call to this
    /// function when a task entry point function returns.
    ///
    /// Panics when called from a non-task context, and when the current
    /// task still owns mutexes (both are programming errors).
    ///
    /// # Safety
    ///
    /// On a successful call, this function destroys the current task's
    /// stack without running any remaining destructors on stack-allocated
    /// objects and renders all references pointing to such objects invalid.
    pub unsafe fn exit_task() -> ! {
        // Safety: Just forwarding the function call
        unsafe { task::exit_current_task::<Traits>() }
    }

    /// Get the task stored in the kernel's running-task slot.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a port, inside its dispatcher, with
    /// CPU Lock active.
    pub unsafe fn running_task_unchecked() -> Option<&'static TaskCb<Traits>> {
        // Safety: The caller ensures CPU Lock is active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let task = Traits::state().running_task(lock.borrow_mut());
        forget(lock);
        task
    }
}
