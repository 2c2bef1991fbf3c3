//! Simulation environment for running the Kestrel kernel on a hosted
//! environment.
//!
//! Each kernel task is backed by a host thread, but exactly one worker
//! thread runs at any moment, chosen by a user-mode scheduler — so the
//! kernel observes the same single-core semantics as on real hardware.
//! Deferred interrupt work (the dispatch handler, the timer tick handler,
//! and test-enqueued software interrupt handlers) runs on a dedicated
//! interrupt worker thread; interrupts are delivered at the
//! critical-section boundaries of the simulated CPU.
//!
//! # Virtual time
//!
//! The tick counter is a simulated clock. Time does not pass while code
//! runs; it passes when [`advance_time`] is called, or automatically — when
//! every task is blocked, the port advances the clock straight to the next
//! armed timer deadline (discrete-event style). If every task is blocked
//! and no deadline is armed, the simulation reports a deadlock instead of
//! hanging.
use std::sync::OnceLock;

use kestrel_kernel::{PortToKernel, System, TaskCb, UTicks};
use spin::Mutex as SpinMutex;

mod sched;
mod threading;
mod ums;

use sched::{SchedState, Work};

/// Re-exported for use by [`use_port!`].
#[doc(hidden)]
pub use kestrel_kernel;

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for the interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

std::thread_local! {
    /// The current thread's role. It's assigned after the creation of a
    /// thread managed by the port.
    static THREAD_ROLE: std::cell::Cell<ThreadRole> =
        std::cell::Cell::new(ThreadRole::Unknown);
}

/// Implemented on a system traits type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    kestrel_kernel::KernelTraits + kestrel_kernel::PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    thread_group: OnceLock<ums::ThreadGroup<SchedState>>,
}

/// The port-private state of a task.
#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the task state machine.
    ///
    /// This field is only accessed with CPU Lock or the scheduler lock
    /// held, so a spin mutex is sufficient; contention never actually
    /// occurs. The runtime performance is not a concern in this port.
    tsm: SpinMutex<Tsm>,
}

impl kestrel_kernel::utils::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before choosing this task to run.
    Uninit,
    /// The task's context state is initialized but hasn't started running.
    Dormant,
    /// The task is currently running on the contained worker thread.
    Running(ums::ThreadId),
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            thread_group: OnceLock::new(),
        }
    }

    fn group(&self) -> &ums::ThreadGroup<SchedState> {
        self.thread_group.get().unwrap()
    }

    /// Initialize the user-mode scheduling system and boot the kernel.
    ///
    /// Returns when the shutdown initiated by [`shutdown`] completes.
    /// Panics (resuming the worker's panic) if any worker thread panics or
    /// the simulation deadlocks.
    pub fn port_boot<Traits: PortInstance>(&self) {
        // Create a UMS thread group.
        let (thread_group, join_handle) = ums::ThreadGroup::new(SchedState::new());
        self.thread_group.set(thread_group).ok().unwrap();

        let mut lock = self.group().lock();

        // Start the long-lived interrupt worker
        let int_thread = lock.spawn(|_| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
            interrupt_worker::<Traits>();
        });
        lock.scheduler().int_thread = Some(int_thread);
        log::trace!("interrupt worker = {int_thread:?}");

        // Create the initial worker thread, where the boot phase of the
        // kernel runs
        let boot_thread = lock.spawn(|_| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

            // Safety: We are a port, so it's okay to call this
            unsafe {
                <Traits as PortToKernel>::boot();
            }
        });
        lock.scheduler().task_thread = Some(boot_thread);
        log::trace!("startup thread = {boot_thread:?}");

        lock.start();
        drop(lock);

        // Wait until the thread group shuts down
        let result = join_handle.join();

        // Propagate any panic that occurred in a worker thread
        if let Err(e) = result {
            std::panic::resume_unwind(e);
        }
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active::<Traits>());

        let mut lock = self.group().lock();
        let sched = lock.scheduler();

        // The startup context ends here; pend the dispatch handler so the
        // interrupt worker transfers the control to the first task
        sched.cpu_lock = false;
        sched.pended_dispatch = true;
        sched.task_thread = None;
        drop(lock);

        ums::exit_thread();
    }

    /// The dispatch handler. Runs on the interrupt worker.
    fn dispatch<Traits: PortInstance>(&'static self) {
        assert_eq!(expect_worker_thread(), ThreadRole::Interrupt);

        unsafe { self.enter_cpu_lock::<Traits>() };
        // Safety: CPU Lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        // Safety: CPU Lock active, we are the port's dispatcher
        let running_task = unsafe { System::<Traits>::running_task_unchecked() };
        unsafe { self.leave_cpu_lock::<Traits>() };

        let mut lock = self.group().lock();

        // Tell the scheduler which thread backs the next task to run
        let new_task_thread = if let Some(task) = running_task {
            log::trace!("dispatching task {task:p}");

            let mut tsm = task.port_task_state.tsm.lock();

            let thread_id = match &*tsm {
                Tsm::Dormant => {
                    // Spawn a worker thread for this task
                    let thread = lock.spawn(move |_| {
                        THREAD_ROLE.with(|role| role.set(ThreadRole::Task));

                        log::debug!("task {task:p} is now running");

                        (task.attr.entry_point)(task.attr.entry_param);

                        // The entry function returned; terminate the task.
                        // Safety: The worker thread's stack holds nothing
                        // that is unsafe to discard by unwinding.
                        unsafe { System::<Traits>::exit_task() };
                    });

                    log::trace!("spawned thread {thread:?} for the task {task:p}");

                    *tsm = Tsm::Running(thread);
                    thread
                }
                Tsm::Running(thread_id) => *thread_id,
                Tsm::Uninit => unreachable!(),
            };
            Some(thread_id)
        } else {
            None
        };

        let sched = lock.scheduler();
        sched.task_thread = new_task_thread;
        if new_task_thread.is_some() {
            sched.idle_advances = 0;
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();
        assert!(!self.is_cpu_lock_active::<Traits>());

        let mut lock = self.group().lock();
        lock.scheduler().pended_dispatch = true;
        self.deliver_pended_interrupts(lock);
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({task:p})");
        assert_eq!(expect_worker_thread(), ThreadRole::Task);
        assert!(self.is_cpu_lock_active::<Traits>());

        let mut lock = self.group().lock();

        // Dissociate this thread from the task
        let old_tsm = std::mem::replace(&mut *task.port_task_state.tsm.lock(), Tsm::Uninit);
        debug_assert!(matches!(old_tsm, Tsm::Running(_)));

        // The dying context ends here; let the interrupt worker pick the
        // next task
        let sched = lock.scheduler();
        sched.task_thread = None;
        sched.cpu_lock = false;
        sched.pended_dispatch = true;
        drop(lock);

        ums::exit_thread();
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&self) {
        log::trace!("enter_cpu_lock");
        expect_worker_thread();

        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        assert!(!sched.cpu_lock);
        sched.cpu_lock = true;
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        if sched.cpu_lock {
            false
        } else {
            sched.cpu_lock = true;
            true
        }
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        log::trace!("leave_cpu_lock");
        expect_worker_thread();

        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        assert!(sched.cpu_lock);
        sched.cpu_lock = false;

        self.deliver_pended_interrupts(lock);
    }

    /// If a pended interrupt activation became deliverable, transfer the
    /// control to the interrupt worker.
    ///
    /// Delivery is skipped on the interrupt worker itself — its drain loop
    /// picks the work up.
    fn deliver_pended_interrupts(&self, mut lock: ums::ThreadGroupLockGuard<'_, SchedState>) {
        let sched = lock.scheduler();
        let deliver =
            sched.interrupt_deliverable() && ums::current_thread() != sched.int_thread;
        drop(lock);

        if deliver {
            ums::yield_now();
        }
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("initialize_task_state {task:p}");
        expect_worker_thread();
        assert!(self.is_cpu_lock_active::<Traits>());

        let mut tsm = task.port_task_state.tsm.lock();
        match &*tsm {
            Tsm::Dormant => {}
            Tsm::Running(_) => {
                // The hosted port cannot destroy a parked host thread
                panic!("restarting a previously-run task is not supported by this port");
            }
            Tsm::Uninit => {
                *tsm = Tsm::Dormant;
            }
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        self.group().lock().scheduler().cpu_lock
    }

    pub fn is_task_context<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        THREAD_ROLE.with(|role| role.get() == ThreadRole::Task)
    }

    pub fn is_interrupt_context<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread();

        THREAD_ROLE.with(|role| role.get() == ThreadRole::Interrupt)
    }

    pub const MAX_TICK_COUNT: UTicks = UTicks::MAX;
    pub const MAX_TIMEOUT: UTicks = kestrel_kernel::DELAY_MAX;

    pub fn tick_count<Traits: PortInstance>(&self) -> UTicks {
        expect_worker_thread();

        self.group().lock().scheduler().now
    }

    pub fn pend_tick_after<Traits: PortInstance>(&self, tick_count_delta: UTicks) {
        expect_worker_thread();
        log::trace!("pend_tick_after({tick_count_delta:?})");

        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        sched.deadline = Some(sched.now.wrapping_add(tick_count_delta));
    }

    pub fn pend_tick<Traits: PortInstance>(&'static self) {
        expect_worker_thread();
        log::trace!("pend_tick");

        // Called with CPU Lock active; the pend is delivered when the
        // critical section ends
        self.group().lock().scheduler().pended_timer = true;
    }
}

/// The interrupt worker's main loop: drain deferred interrupt work, then
/// relinquish the processor.
fn interrupt_worker<Traits: PortInstance>() {
    loop {
        let work = {
            let mut lock = Traits::port_state().group().lock();
            lock.scheduler().take_work()
        };

        match work {
            Some(Work::Timer) => {
                log::trace!("timer interrupt");
                // Safety: CPU Lock inactive, interrupt context
                unsafe { <Traits as PortToKernel>::timer_tick() };
            }
            Some(Work::Software(handler)) => {
                log::trace!("software interrupt");
                handler();
            }
            Some(Work::Dispatch) => {
                Traits::port_state().dispatch::<Traits>();
            }
            None => ums::yield_now(),
        }
    }
}

/// Assert that the current thread is a worker thread.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown);
    role
}

/// Initiate shutdown of the simulation.
///
/// Takes effect at the next scheduling point; [`State::port_boot`] then
/// returns. Worker threads (including the caller) are left parked and die
/// with the process.
pub fn shutdown<Traits: PortInstance>() {
    Traits::port_state().group().lock().shutdown();
}

/// Move the virtual clock forward by `delta` ticks.
///
/// If an armed timer deadline is crossed, the timer interrupt is delivered
/// before this function returns (unless called with CPU Lock active, in
/// which case it's delivered when the critical section ends).
pub fn advance_time<Traits: PortInstance>(delta: UTicks) {
    expect_worker_thread();
    log::trace!("advance_time({delta})");

    let state = Traits::port_state();
    let mut lock = state.group().lock();
    lock.scheduler().advance_clock(delta);
    state.deliver_pended_interrupts(lock);
}

/// Enqueue a software interrupt. `handler` runs in the interrupt context,
/// preempting the current task at the next critical-section boundary (or
/// immediately, if none is active).
pub fn pend_software_interrupt<Traits: PortInstance>(handler: fn()) {
    expect_worker_thread();
    log::trace!("pend_software_interrupt");

    let state = Traits::port_state();
    let mut lock = state.group().lock();
    lock.scheduler().pended_software.push_back(handler);
    state.deliver_pended_interrupts(lock);
}

/// Instantiate the port and the kernel configuration for the given system
/// traits type.
///
/// ```rust,ignore
/// kestrel_port_std::use_port!(unsafe struct SystemTraits {
///     startup_tasks = [TASK1, TASK2],
/// });
///
/// static TASK1: TaskCb<SystemTraits> = TaskCb::new(&TASK1_ATTR);
/// // …
///
/// fn main() {
///     kestrel_port_std::boot::<SystemTraits>();
/// }
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident {
        startup_tasks = [ $( $startup_task:ident ),* $(,)? ] $(,)?
    }) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{
                KernelCfg, PortThreading, PortTimer, State as KernelState, TaskCb, UTicks,
                utils::Init,
            };
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            static KERNEL_STATE: KernelState<$SystemTraits> =
                <KernelState<$SystemTraits> as Init>::INIT;

            static STARTUP_TASKS: &[&TaskCb<$SystemTraits>] =
                &[ $( &super::$startup_task ),* ];

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context::<Self>()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context::<Self>()
                }
            }

            impl PortTimer for $SystemTraits {
                const MAX_TICK_COUNT: UTicks = State::MAX_TICK_COUNT;
                const MAX_TIMEOUT: UTicks = State::MAX_TIMEOUT;

                unsafe fn tick_count() -> UTicks {
                    PORT_STATE.tick_count::<Self>()
                }

                unsafe fn pend_tick_after(tick_count_delta: UTicks) {
                    PORT_STATE.pend_tick_after::<Self>(tick_count_delta)
                }

                unsafe fn pend_tick() {
                    PORT_STATE.pend_tick::<Self>()
                }
            }

            unsafe impl KernelCfg for $SystemTraits {
                type TimeoutHeap = $crate::kestrel_kernel::TimeoutHeap<$SystemTraits, 64>;

                fn state() -> &'static KernelState<Self> {
                    &KERNEL_STATE
                }

                fn startup_tasks() -> &'static [&'static TaskCb<Self>] {
                    STARTUP_TASKS
                }
            }
        }
    };
}

/// Boot the kernel for the given system traits type. Returns when the
/// simulation shuts down.
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}
