// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Earliest-deadline-first scheduling.
//!
//! Each task's absolute deadline is fixed at install time: the current
//! tick plus its configured relative deadline. Selection pops the deadline
//! min-heap; a task whose deadline has already passed is returned together
//! with [`EVENT_DEADLINE_MISSED`], giving the registered event handler the
//! chance to terminate and replace it (and answer `Retry`) or to accept
//! the overrun (`Continue`).

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{ConfigKey, EventCode, TaskConfig, TaskState};
use binheap::{BinaryHeap, Compare};
use core::ptr::NonNull;
use slotpool::Pool;

const GROUP: u16 = 5;

/// Config key: relative deadline in ticks from installation.
pub const RELATIVE_DEADLINE: ConfigKey = ConfigKey::new(GROUP, 1 << 0);

/// Event code delivered when a task is selected past its deadline.
pub const EVENT_DEADLINE_MISSED: EventCode = 100;

struct TaskData {
    deadline: u32,
}

/// Heap entry; the deadline is immutable after configuration, so keying
/// by copy is sound.
#[derive(Copy, Clone)]
struct Entry {
    deadline: u32,
    task: NonNull<Tcb>,
}

struct EarliestDeadline;

impl Compare<Entry> for EarliestDeadline {
    fn less(a: &Entry, b: &Entry) -> bool {
        // Inverted: the nearest deadline surfaces first.
        b.deadline < a.deadline
    }
}

pub struct Edf<const N: usize> {
    deadlines: BinaryHeap<Entry, EarliestDeadline, N>,
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> Edf<N> {
    pub const fn new() -> Self {
        Self {
            deadlines: BinaryHeap::new(),
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }

    fn push(&mut self, task: NonNull<Tcb>) {
        // Safety: configure_task installed the data.
        let deadline = unsafe { data::<TaskData>(task).deadline };
        let ok = self.deadlines.try_push(Entry { deadline, task });
        debug_assert!(ok, "deadline heap sized below the task count");
    }
}

impl<const N: usize> Default for Edf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for Edf<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData { deadline: 0 })
            .expect("scheduler data pool exhausted");
        cfg.update(RELATIVE_DEADLINE, &mut slot.deadline);
        slot.deadline = slot.deadline.wrapping_add(now);
        // Safety: the task ref is live; we own its sched_data slot.
        unsafe {
            task.as_mut().set_sched_data(slot as *mut TaskData as *mut ());
        }
    }

    fn clear_task(&mut self, task: NonNull<Tcb>) {
        // Safety: sched_data was installed by configure_task above.
        unsafe {
            self.pool.free(task.as_ref().sched_data::<TaskData>());
        }
    }

    fn add_task(&mut self, task: NonNull<Tcb>) {
        self.push(task);
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        let (deadlines, waiting) =
            (&mut self.deadlines, &mut self.waiting);
        waiting.process(now, |t| {
            // Safety: configure_task installed the data.
            let deadline = unsafe { data::<TaskData>(t).deadline };
            let ok = deadlines.try_push(Entry { deadline, task: t });
            debug_assert!(ok);
        });

        while let Some(entry) = self.deadlines.try_pop() {
            let task = entry.task;

            // A missed deadline outranks ordinary state handling: report
            // it while the task is still the head of the queue.
            if task_state(task) != TaskState::Done && entry.deadline <= now
            {
                let ok = self.deadlines.try_push(entry);
                debug_assert!(ok);
                return (Some(task), EVENT_DEADLINE_MISSED);
            }

            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    let ok = self.deadlines.try_push(entry);
                    debug_assert!(ok);
                    return (Some(task), EVENT_OK);
                }
                TaskState::Done => ctx.task_done(task),
                TaskState::Wait => self.waiting.push(task),
                TaskState::None => {}
            }
        }
        IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;

    fn add(
        sched: &mut Edf<8>,
        task: &mut crate::task::TaskObject<STACK>,
        relative_deadline: usize,
        now: u32,
    ) {
        let cfg =
            TaskConfig::new().set(RELATIVE_DEADLINE, relative_deadline);
        sched.configure_task(tref(task), &cfg, now);
        sched.add_task(tref(task));
    }

    #[test]
    fn nearest_deadline_runs_first() {
        let mut sched = Edf::<8>::new();
        let mut ctx = TestCtx::default();
        let mut relaxed = make_task(TaskState::Ready);
        let mut urgent = make_task(TaskState::Ready);
        add(&mut sched, &mut relaxed, 10_000, 0);
        add(&mut sched, &mut urgent, 1000, 0);

        for _ in 0..5 {
            let (picked, ev) = sched.next_task(10, &mut ctx);
            assert_eq!(ev, EVENT_OK);
            assert_eq!(picked, Some(tref(&mut urgent)));
        }
    }

    #[test]
    fn missed_deadline_raises_the_event() {
        let mut sched = Edf::<8>::new();
        let mut ctx = TestCtx::default();
        let mut late = make_task(TaskState::Ready);
        let mut fine = make_task(TaskState::Ready);
        add(&mut sched, &mut late, 1000, 0);
        add(&mut sched, &mut fine, 10_000, 0);

        // Past the first task's deadline: the task is still returned, but
        // with the deadline-miss event, and it stays queued.
        let (picked, ev) = sched.next_task(1000, &mut ctx);
        assert_eq!(picked, Some(tref(&mut late)));
        assert_eq!(ev, EVENT_DEADLINE_MISSED);

        let (picked, ev) = sched.next_task(1001, &mut ctx);
        assert_eq!(picked, Some(tref(&mut late)));
        assert_eq!(ev, EVENT_DEADLINE_MISSED);
    }

    #[test]
    fn terminated_misser_is_released_and_replaced() {
        let mut sched = Edf::<8>::new();
        let mut ctx = TestCtx::default();
        let mut late = make_task(TaskState::Ready);
        let mut fine = make_task(TaskState::Ready);
        add(&mut sched, &mut late, 100, 0);
        add(&mut sched, &mut fine, 10_000, 0);

        let (_, ev) = sched.next_task(500, &mut ctx);
        assert_eq!(ev, EVENT_DEADLINE_MISSED);

        // Handler terminates the offender; the next pick releases it and
        // falls through to the healthy task.
        late.tcb.descriptor.state = TaskState::Done;
        let (picked, ev) = sched.next_task(500, &mut ctx);
        assert_eq!(ev, EVENT_OK);
        assert_eq!(picked, Some(tref(&mut fine)));
        assert_eq!(ctx.done, vec![tref(&mut late)]);
        release_done(&mut sched, &mut ctx);
    }

    #[test]
    fn sleeping_task_keeps_its_absolute_deadline() {
        let mut sched = Edf::<8>::new();
        let mut ctx = TestCtx::default();
        let mut sleeper = make_task(TaskState::Ready);
        let mut other = make_task(TaskState::Ready);
        add(&mut sched, &mut sleeper, 5000, 0);
        add(&mut sched, &mut other, 8000, 0);

        sleeper.tcb.descriptor.state = TaskState::Wait;
        sleeper.tcb.descriptor.timing.next_run = 50;
        // The sleeping task is parked; the other one runs.
        assert_eq!(sched.next_task(10, &mut ctx).0, Some(tref(&mut other)));

        // Awake again, it outranks the later deadline.
        assert_eq!(
            sched.next_task(50, &mut ctx).0,
            Some(tref(&mut sleeper))
        );
    }
}
