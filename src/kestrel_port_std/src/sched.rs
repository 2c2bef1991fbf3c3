//! The port scheduler: a priority arbiter between the simulated interrupt
//! controller and the current task, plus the virtual clock.
use std::collections::VecDeque;

use kestrel_kernel::UTicks;

use crate::ums::{Scheduler, ThreadId};

/// How many times the scheduler may advance the virtual clock in a row
/// without any task becoming runnable before the system is declared dead.
const IDLE_ADVANCE_LIMIT: u32 = 64;

/// A deferred interrupt activation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Work {
    /// The timer tick handler.
    Timer,
    /// A software interrupt handler enqueued by a test.
    Software(fn()),
    /// The dispatch (context switch) handler.
    Dispatch,
}

#[derive(Debug)]
pub(crate) struct SchedState {
    /// Whether the simulated CPU has interrupts masked.
    pub(crate) cpu_lock: bool,

    /// The backing thread of the current task (or the boot context).
    pub(crate) task_thread: Option<ThreadId>,

    /// The long-lived interrupt worker thread.
    pub(crate) int_thread: Option<ThreadId>,

    pub(crate) pended_timer: bool,
    pub(crate) pended_dispatch: bool,
    pub(crate) pended_software: VecDeque<fn()>,

    /// The virtual clock.
    pub(crate) now: UTicks,

    /// The armed compare deadline of the virtual timer (absolute).
    pub(crate) deadline: Option<UTicks>,

    /// Consecutive idle clock advances; reset whenever a task is
    /// dispatched.
    pub(crate) idle_advances: u32,
}

impl SchedState {
    pub(crate) fn new() -> Self {
        Self {
            // The boot context runs with interrupts masked
            cpu_lock: true,
            task_thread: None,
            int_thread: None,
            pended_timer: false,
            pended_dispatch: false,
            pended_software: VecDeque::new(),
            now: 0,
            deadline: None,
            idle_advances: 0,
        }
    }

    /// Whether a pended interrupt activation can run right now.
    pub(crate) fn interrupt_deliverable(&self) -> bool {
        !self.cpu_lock
            && (self.pended_timer || self.pended_dispatch || !self.pended_software.is_empty())
    }

    /// Take the next piece of deferred interrupt work, most urgent first
    /// (the dispatch handler has the lowest priority, PendSV-style).
    pub(crate) fn take_work(&mut self) -> Option<Work> {
        if self.cpu_lock {
            return None;
        }
        if self.pended_timer {
            self.pended_timer = false;
            return Some(Work::Timer);
        }
        if let Some(f) = self.pended_software.pop_front() {
            return Some(Work::Software(f));
        }
        if self.pended_dispatch {
            self.pended_dispatch = false;
            return Some(Work::Dispatch);
        }
        None
    }

    /// Move the virtual clock forward by `delta` ticks, pending a timer
    /// interrupt if the armed deadline is crossed.
    pub(crate) fn advance_clock(&mut self, delta: UTicks) {
        let old_now = self.now;
        self.now = old_now.wrapping_add(delta);
        if let Some(deadline) = self.deadline {
            if deadline.wrapping_sub(old_now) <= delta {
                self.deadline = None;
                self.pended_timer = true;
            }
        }
    }
}

impl Scheduler for SchedState {
    fn choose_next_thread(&mut self) -> Option<ThreadId> {
        loop {
            if self.interrupt_deliverable() {
                // The interrupt worker preempts whatever task is current
                return self.int_thread;
            }
            if let Some(thread_id) = self.task_thread {
                return Some(thread_id);
            }

            // Nothing is runnable. Jump the virtual clock straight to the
            // next armed deadline (discrete-event style); the timer
            // interrupt then runs whatever becomes due.
            if let Some(deadline) = self.deadline.take() {
                if self.idle_advances < IDLE_ADVANCE_LIMIT {
                    self.idle_advances += 1;
                    log::trace!("idle: advancing the clock to {deadline}");
                    self.now = deadline;
                    self.pended_timer = true;
                    continue;
                }
            }

            // No deadline is armed (or the clock keeps advancing with no
            // effect): the system is deadlocked
            return None;
        }
    }

    fn thread_exited(&mut self, thread_id: ThreadId) {
        if self.task_thread == Some(thread_id) {
            self.task_thread = None;
        }
        if self.int_thread == Some(thread_id) {
            self.int_thread = None;
        }
    }
}
