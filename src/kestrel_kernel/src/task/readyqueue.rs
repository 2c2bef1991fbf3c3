//! Task ready queue implementation (internal use only).
//!
//! The ready queue is a single intrusive cyclic list of Ready tasks,
//! strictly ordered by descending effective priority with FIFO ordering
//! within a priority class. The list head doubles as the idle sentinel: an
//! empty queue (with no running task) means the processor idles.
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading, Priority,
};

/// The per-task link that threads a [`TaskCb`] into the ready queue.
pub(crate) type PerTaskData<Traits> =
    CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>;

/// The result type of [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue
    /// to schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The task ready queue.
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

/// Get a `ListAccessorCell` used to access the ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            &Static,
            |task_cb: &TaskCb<_>| &task_cb.ready_queue_data,
            $key,
        )
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Get the effective priority of the front (most urgent) task.
    fn front_priority(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<Priority> {
        let accessor = list_accessor!(&self.head, lock.borrow_mut());
        accessor
            .front_data()
            .map(|task_cb| *task_cb.effective_priority.read(&**accessor.cell_key()))
    }

    /// Return a flag indicating whether there's a Ready task whose priority
    /// exceeds `priority` (`None` = "there is no running task"; any Ready
    /// task exceeds it).
    #[inline]
    pub(crate) fn has_ready_task_above(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Option<Priority>,
    ) -> bool {
        match (self.front_priority(lock), priority) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(front), Some(priority)) => front > priority,
        }
    }

    /// Insert the specified task into the ready queue.
    ///
    /// `task_cb` is inserted as close to the back as possible without
    /// violating the priority ordering, giving FIFO ordering among tasks of
    /// equal effective priority.
    pub(crate) fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
        let pri = *task_cb.effective_priority.read(&**accessor.cell_key());

        // Search backwards for the insertion position: skip over every task
        // that is strictly less urgent than the newcomer.
        let mut insert_at = None;
        let mut cursor = accessor.back();
        while let Some(next_cursor) = cursor {
            let next_pri = *accessor.pool()[next_cursor]
                .effective_priority
                .read(&**accessor.cell_key());
            if next_pri < pri {
                insert_at = Some(next_cursor);
                cursor = accessor.prev(next_cursor);
            } else {
                break;
            }
        }

        // `task_cb` must not be in the queue already
        accessor.insert(Ident(task_cb), insert_at).unwrap();
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// effective priority of the current task (or `None` if there is no
    /// task that could continue to run).
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed
    /// from the queue.
    ///
    /// | `prev_task_priority` | Queue front        | Returns             |
    /// | -------------------- | ------------------ | ------------------- |
    /// | `None`               | empty              | `SwitchTo(None)`    |
    /// | `None`               | any                | `SwitchTo(Some(_))` |
    /// | `Some(p)`            | empty or `<= p`    | `Keep`              |
    /// | `Some(p)`            | `> p`              | `SwitchTo(Some(_))` |
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>> {
        let front_priority = self.front_priority(lock.borrow_mut());

        match (front_priority, prev_task_priority) {
            (None, None) => ScheduleDecision::SwitchTo(None),
            (None, Some(_)) => ScheduleDecision::Keep,
            (Some(front), Some(prev)) if front <= prev => {
                // The current task keeps running; equal priorities don't
                // preempt (FIFO within a priority class)
                ScheduleDecision::Keep
            }
            (Some(_), _) => {
                let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
                // The queue is non-empty, so `pop_front` must succeed
                let task = accessor.pop_front().unwrap().0;
                ScheduleDecision::SwitchTo(Some(task))
            }
        }
    }

    /// Reposition the specified task within the ready queue after a change
    /// in its effective priority.
    ///
    /// `task_cb` is re-inserted as close to the back as possible without
    /// violating the priority ordering.
    pub(crate) fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        {
            let mut accessor = list_accessor!(&self.head, lock.borrow_mut());
            // `task_cb` must be linked to this queue
            accessor.remove(Ident(task_cb)).unwrap();
        }
        self.push_back_task(lock, task_cb);
    }
}

impl<Traits: KernelTraits> fmt::Debug for ReadyQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(mut lock) = crate::klock::lock_cpu::<Traits>() {
            let accessor = list_accessor!(&self.head, lock.borrow_mut());
            f.debug_list()
                .entries(accessor.iter().map(|(_, task_cb)| task_cb as *const _))
                .finish()
        } else {
            f.write_str("ReadyQueue { < locked > }")
        }
    }
}
