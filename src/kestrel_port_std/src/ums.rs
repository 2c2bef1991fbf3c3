//! Utterly inefficient cross-platform cooperative user-mode scheduling
use slab::Slab;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex, MutexGuard},
    thread::Result,
};

use crate::threading;

type SlabPtr = usize;

#[cfg(test)]
mod tests;

/// Represents a dynamic set of threads that can be scheduled for execution
/// by `Sched: `[`Scheduler`].
#[derive(Debug)]
pub struct ThreadGroup<Sched: ?Sized> {
    state: Arc<Mutex<State<Sched>>>,
}

impl<Sched: ?Sized> Clone for ThreadGroup<Sched> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

/// Object that can be used to join on a [`ThreadGroup`].
#[derive(Debug)]
pub struct ThreadGroupJoinHandle {
    result_recv: mpsc::Receiver<Result<()>>,
}

/// RAII guard returned by [`ThreadGroup::lock`].
pub struct ThreadGroupLockGuard<'a, Sched: ?Sized> {
    state_ref: &'a Arc<Mutex<State<Sched>>>,
    guard: MutexGuard<'a, State<Sched>>,
}

/// Identifies a thread in [`ThreadGroup`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ThreadId(SlabPtr);

/// Encapsulates the state of a client-supplied user-mode scheduler.
pub trait Scheduler: Send + 'static {
    /// Choose the next thread to run.
    ///
    /// It's an error to return an already-exited thread. The client is
    /// responsible for tracking the lifetime of spawned threads.
    ///
    /// Returning `None` indicates the system can make no further progress;
    /// the thread group reports this as a failure unless it's shutting
    /// down.
    fn choose_next_thread(&mut self) -> Option<ThreadId>;

    /// Called when a thread exits.
    fn thread_exited(&mut self, thread_id: ThreadId) {
        let _ = thread_id;
    }
}

#[derive(Debug)]
struct State<Sched: ?Sized> {
    threads: Slab<WorkerThread>,
    cur_thread_id: Option<ThreadId>,
    shutting_down: bool,
    result_sent: bool,
    result_send: mpsc::Sender<Result<()>>,
    sched: Sched,
}

#[derive(Debug)]
struct WorkerThread {
    thread: threading::Thread,
}

std::thread_local! {
    static TLB: std::cell::RefCell<Option<ThreadLocalBlock>> = std::cell::RefCell::new(None);
}

struct ThreadLocalBlock {
    /// The current thread ID.
    thread_id: ThreadId,
    /// The thread group the current worker thread belongs to.
    state: Arc<Mutex<State<dyn Scheduler>>>,
}

/// The panic payload used by [`exit_thread`] to terminate a worker thread
/// by unwinding.
struct ExitThreadToken;

impl<Sched: Scheduler> ThreadGroup<Sched> {
    /// Construct a new `ThreadGroup` and the corresponding
    /// [`ThreadGroupJoinHandle`].
    pub fn new(sched: Sched) -> (Self, ThreadGroupJoinHandle) {
        let (send, recv) = mpsc::channel();

        let state = Arc::new(Mutex::new(State {
            threads: Slab::new(),
            cur_thread_id: None,
            shutting_down: false,
            result_sent: false,
            result_send: send,
            sched,
        }));

        (Self { state }, ThreadGroupJoinHandle { result_recv: recv })
    }
}

impl ThreadGroupJoinHandle {
    /// Wait for the thread group to shut down or fail.
    pub fn join(self) -> Result<()> {
        self.result_recv.recv().unwrap()
    }
}

impl<Sched: Scheduler + ?Sized> ThreadGroup<Sched> {
    /// Acquire a lock on the thread group's state.
    pub fn lock(&self) -> ThreadGroupLockGuard<'_, Sched> {
        ThreadGroupLockGuard {
            state_ref: &self.state,
            guard: self.state.lock().unwrap(),
        }
    }
}

impl<'a, Sched: Scheduler> ThreadGroupLockGuard<'a, Sched> {
    /// Start a worker thread.
    ///
    /// This does not automatically schedule the spawned thread. You should
    /// store the obtained `ThreadId` in the contained
    /// `Sched: `[`Scheduler`] and have it chosen by
    /// [`Scheduler::choose_next_thread`] for the thread to actually run.
    ///
    /// Inside a worker thread, use [`exit_thread`] and [`yield_now`]
    /// instead of the same-named functions defined elsewhere.
    pub fn spawn(&mut self, f: impl FnOnce(ThreadId) + Send + 'static) -> ThreadId {
        let state = Arc::clone(self.state_ref);

        // Allocate a `ThreadId`
        let entry = self.guard.threads.vacant_entry();
        let thread_id = ThreadId(entry.key());

        let thread = threading::spawn(move || {
            let state2 = Arc::clone(&state);
            TLB.with(|cell| {
                *cell.borrow_mut() = Some(ThreadLocalBlock { thread_id, state })
            });

            // Block the spawned thread until scheduled to run
            threading::park();

            // Call the thread entry point
            let result = match catch_unwind(AssertUnwindSafe(move || f(thread_id))) {
                Ok(()) => Ok(()),
                // `exit_thread` terminates a thread by unwinding with a
                // sentinel payload; that's a normal exit
                Err(e) if e.is::<ExitThreadToken>() => Ok(()),
                Err(e) => Err(e),
            };

            finalize_thread(state2, thread_id, result);
        });

        entry.insert(WorkerThread { thread });

        log::trace!("created {thread_id:?}");

        thread_id
    }

    /// Start scheduling, letting the scheduler decide the first thread to
    /// run.
    ///
    /// Calling this method from a worker thread is not allowed.
    pub fn start(&mut self) {
        assert!(
            TLB.with(|cell| cell.borrow().is_none()),
            "this method cannot be called from a worker thread"
        );
        assert!(self.guard.cur_thread_id.is_none());

        self.guard.unpark_next_thread();
    }

    /// Initiate shutdown for the thread group.
    ///
    /// The shutdown takes effect the next time the scheduler runs: the
    /// system stops scheduling worker threads and
    /// [`ThreadGroupJoinHandle::join`] unblocks, returning `Ok(())`.
    /// Remaining worker threads stay parked and die with the process.
    pub fn shutdown(&mut self) {
        if self.guard.shutting_down {
            return;
        }
        log::trace!("shutdown requested");
        self.guard.shutting_down = true;
    }
}

impl<'a, Sched: Scheduler + ?Sized> ThreadGroupLockGuard<'a, Sched> {
    /// Get a mutable reference to the contained `Sched: `[`Scheduler`].
    pub fn scheduler(&mut self) -> &mut Sched {
        &mut self.guard.sched
    }
}

impl<Sched: Scheduler> State<Sched> {
    fn unpark_next_thread(&mut self) {
        (self as &mut State<dyn Scheduler>).unpark_next_thread();
    }
}

impl State<dyn Scheduler> {
    /// Find the next thread to run and unpark that thread.
    fn unpark_next_thread(&mut self) {
        if self.shutting_down {
            self.cur_thread_id = None;
            self.send_result(Ok(()));
            log::trace!("shutdown is complete");
            return;
        }

        self.cur_thread_id = self.sched.choose_next_thread();
        log::trace!("scheduling {:?}", self.cur_thread_id);

        if let Some(thread_id) = self.cur_thread_id {
            self.threads[thread_id.0].thread.unpark();
        } else {
            // The scheduler made no choice; nothing will ever run again.
            // Deliver this as a failure instead of hanging the host.
            self.send_result(Err(Box::new(
                "deadlock: every task is blocked and no timeout is armed",
            )));
        }
    }

    fn send_result(&mut self, result: Result<()>) {
        if !self.result_sent {
            self.result_sent = true;
            // Ignore if the receiver has already hung up
            let _ = self.result_send.send(result);
        }
    }
}

/// Voluntarily yield the processor to let the scheduler decide the next
/// thread to run.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
pub fn yield_now() {
    let thread_group: Arc<Mutex<State<dyn Scheduler>>> = TLB
        .with(|cell| cell.borrow().as_ref().map(|tlb| Arc::clone(&tlb.state)))
        .expect("current thread does not belong to a thread group");

    {
        let mut state_guard = thread_group.lock().unwrap();
        log::trace!("{:?} yielded the processor", state_guard.cur_thread_id);
        state_guard.unpark_next_thread();
    }

    // Block the thread until scheduled to run. This might end immediately
    // if the current thread is the next thread to run.
    threading::park();
}

/// Terminate the current worker thread by unwinding its stack.
///
/// Panics if the current thread is not a worker thread of some
/// [`ThreadGroup`].
pub fn exit_thread() -> ! {
    // Ensure the panic below isn't mistaken for a failure
    TLB.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|_| ())
            .expect("current thread does not belong to a thread group")
    });

    std::panic::panic_any(ExitThreadToken);
}

/// Mark the specified thread as exited.
fn finalize_thread(
    thread_group: Arc<Mutex<State<dyn Scheduler>>>,
    thread_id: ThreadId,
    result: Result<()>,
) {
    log::trace!("{thread_id:?} exited");

    // Delete the current thread
    let mut state_guard = thread_group.lock().unwrap();
    state_guard.sched.thread_exited(thread_id);
    state_guard.threads.remove(thread_id.0);

    if let Err(e) = result {
        // Send the panic payload to the thread group's owner. Leave other
        // threads hanging because there's no way to terminate them safely.
        // This is sufficient for running tests.
        state_guard.send_result(Err(e));
        return;
    }

    // Invoke the scheduler
    state_guard.unpark_next_thread();
}

/// Get the current worker thread.
pub fn current_thread() -> Option<ThreadId> {
    TLB.with(|cell| cell.borrow().as_ref().map(|tlb| tlb.thread_id))
}
