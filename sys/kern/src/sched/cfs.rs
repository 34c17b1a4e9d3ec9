// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fair scheduling on accumulated virtual runtime, in the manner of the
//! Linux CFS.
//!
//! Each task tracks how many ticks it has actually run (`vruntime`).
//! Selection always takes the runnable task with the smallest vruntime;
//! ties go to the earlier arrival. A task that sleeps accumulates nothing
//! while blocked and resumes with its old value, so it comes back
//! "poorer" than the tasks that kept running and is favoured -- fairness
//! with a built-in responsiveness bonus.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{TaskConfig, TaskState};
use binheap::{Compare, StableBinaryHeap};
use core::ptr::NonNull;
use slotpool::Pool;

struct TaskData {
    vruntime: u32,
    start: u32,
}

struct SmallestVruntime;

impl Compare<NonNull<Tcb>> for SmallestVruntime {
    fn less(a: &NonNull<Tcb>, b: &NonNull<Tcb>) -> bool {
        // Inverted: the smallest vruntime surfaces first. The key is only
        // ever rewritten while the task is out of the heap.
        // Safety: queued tasks carry live policy data.
        unsafe {
            data::<TaskData>(*b).vruntime < data::<TaskData>(*a).vruntime
        }
    }
}

pub struct Cfs<const N: usize> {
    ready: StableBinaryHeap<NonNull<Tcb>, SmallestVruntime, N>,
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> Cfs<N> {
    pub const fn new() -> Self {
        Self {
            ready: StableBinaryHeap::new(),
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }
}

impl<const N: usize> Default for Cfs<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for Cfs<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        _cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData {
                vruntime: 0,
                start: 0,
            })
            .expect("scheduler data pool exhausted");
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
        let ok = self.ready.try_push(task);
        debug_assert!(ok, "ready heap sized below the task count");
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        let ready = &mut self.ready;
        self.waiting.process(now, |t| {
            let ok = ready.try_push(t);
            debug_assert!(ok);
        });

        // The incumbent sits on top (it had the smallest vruntime when it
        // was selected). Charge it for the time it just consumed and file
        // it back under its new total.
        if let Some(task) = self.ready.try_pop() {
            // Safety: queued tasks carry live policy data.
            let d = unsafe { data::<TaskData>(task) };
            if d.start != 0 {
                d.vruntime = d.vruntime.wrapping_add(now - d.start);
            }
            let ok = self.ready.try_push(task);
            debug_assert!(ok);
        }

        while let Some(task) = self.ready.peek() {
            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    // Safety: queued tasks carry live policy data.
                    unsafe { data::<TaskData>(task).start = now };
                    return (Some(task), EVENT_OK);
                }
                TaskState::Done => {
                    // Safety: as above.
                    unsafe { data::<TaskData>(task).start = 0 };
                    self.ready.try_pop();
                    ctx.task_done(task);
                }
                TaskState::Wait => {
                    // Sleepers stop accruing: clear the running stamp and
                    // park them with their vruntime frozen.
                    // Safety: as above.
                    unsafe { data::<TaskData>(task).start = 0 };
                    self.ready.try_pop();
                    self.waiting.push(task);
                }
                TaskState::None => {
                    self.ready.try_pop();
                }
            }
        }
        IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;
    use crate::task::TaskObject;

    fn add(sched: &mut Cfs<8>, task: &mut TaskObject<STACK>, now: u32) {
        sched.configure_task(tref(task), &TaskConfig::new(), now);
        sched.add_task(tref(task));
    }

    fn vruntime_of(task: NonNull<Tcb>) -> u32 {
        unsafe { data::<TaskData>(task).vruntime }
    }

    #[test]
    fn charges_runtime_and_picks_the_minimum() {
        let mut sched = Cfs::<8>::new();
        let mut ctx = TestCtx::default();
        let mut a = make_task(TaskState::Ready);
        let mut b = make_task(TaskState::Ready);
        add(&mut sched, &mut a, 0);
        add(&mut sched, &mut b, 0);

        // The selection re-files the incumbent before peeking, so among
        // the all-zero newcomers the pick falls on `b`.
        assert_eq!(sched.next_task(1, &mut ctx).0, Some(tref(&mut b)));
        // Ten ticks later `b` is charged for its slice and `a` (still at
        // zero) takes over.
        assert_eq!(sched.next_task(11, &mut ctx).0, Some(tref(&mut a)));
        assert_eq!(vruntime_of(tref(&mut b)), 10);
        // And back again once `a` has consumed more than `b`.
        assert_eq!(sched.next_task(23, &mut ctx).0, Some(tref(&mut b)));
        assert_eq!(vruntime_of(tref(&mut a)), 12);
    }

    #[test]
    fn no_task_starves_under_equal_load() {
        let mut sched = Cfs::<8>::new();
        let mut ctx = TestCtx::default();
        let mut tasks: Vec<_> =
            (0..3).map(|_| make_task(TaskState::Ready)).collect();
        for t in tasks.iter_mut() {
            add(&mut sched, t, 0);
        }

        // One tick per selection: within a handful of rounds every task
        // must have run at least once.
        let mut seen = [false; 3];
        for now in 1..=6 {
            let picked = sched.next_task(now, &mut ctx).0.unwrap();
            for (i, t) in tasks.iter_mut().enumerate() {
                if picked == tref(t) {
                    seen[i] = true;
                }
            }
        }
        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn sleeper_returns_poorer_and_preempts() {
        let mut sched = Cfs::<8>::new();
        let mut ctx = TestCtx::default();
        let mut worker = make_task(TaskState::Ready);
        let mut sleeper = make_task(TaskState::Ready);
        add(&mut sched, &mut worker, 0);
        add(&mut sched, &mut sleeper, 0);

        // The sleeper runs a short slice, then blocks for a long stretch
        // while the worker accumulates runtime.
        assert_eq!(
            sched.next_task(1, &mut ctx).0,
            Some(tref(&mut sleeper))
        );
        sleeper.tcb.descriptor.state = TaskState::Wait;
        sleeper.tcb.descriptor.timing.next_run = 500;
        for now in [6, 100, 200, 300, 400] {
            assert_eq!(
                sched.next_task(now, &mut ctx).0,
                Some(tref(&mut worker))
            );
        }

        // On wakeup its old vruntime -- just the 5 ticks it actually ran,
        // nothing for the blocked stretch -- makes it the immediate
        // choice.
        assert_eq!(
            sched.next_task(500, &mut ctx).0,
            Some(tref(&mut sleeper))
        );
        assert_eq!(vruntime_of(tref(&mut sleeper)), 5);
    }

    #[test]
    fn done_task_is_released() {
        let mut sched = Cfs::<8>::new();
        let mut ctx = TestCtx::default();
        let mut t = make_task(TaskState::Ready);
        let mut u = make_task(TaskState::Ready);
        add(&mut sched, &mut t, 0);
        add(&mut sched, &mut u, 0);

        assert_eq!(sched.next_task(1, &mut ctx).0, Some(tref(&mut u)));
        t.tcb.descriptor.state = TaskState::Done;
        let (picked, _) = sched.next_task(2, &mut ctx);
        assert_eq!(picked, Some(tref(&mut u)));
        assert_eq!(ctx.done, vec![tref(&mut t)]);
        release_done(&mut sched, &mut ctx);
    }
}
