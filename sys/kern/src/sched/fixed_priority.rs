// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-priority scheduling: one ring per priority band, highest band
//! (numerically lowest) first, round-robin within a band.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use core::ptr::NonNull;
use fixedq::CircQueue;
use slotpool::Pool;

/// Number of priority bands. Band 0 is the most important.
pub const MAX_PRIORITY: usize = 3;

const GROUP: u16 = 1;

/// Config key: priority band, `0..MAX_PRIORITY`.
pub const PRIORITY: ConfigKey = ConfigKey::new(GROUP, 1 << 0);

struct TaskData {
    priority: u8,
}

pub struct FixedPriority<const N: usize> {
    ready: [CircQueue<NonNull<Tcb>, N>; MAX_PRIORITY],
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> FixedPriority<N> {
    pub const fn new() -> Self {
        Self {
            ready: [const { CircQueue::new() }; MAX_PRIORITY],
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }

    fn priority_of(task: NonNull<Tcb>) -> usize {
        // Safety: configure_task installed a TaskData for every task we
        // ever see.
        unsafe { data::<TaskData>(task).priority as usize }
    }
}

impl<const N: usize> Default for FixedPriority<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for FixedPriority<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData { priority: 0 })
            .expect("scheduler data pool exhausted");
        cfg.update(PRIORITY, &mut slot.priority);
        assert!(
            (slot.priority as usize) < MAX_PRIORITY,
            "bad priority value"
        );
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
        let band = Self::priority_of(task);
        debug_assert!(band < MAX_PRIORITY);
        let ok = self.ready[band].try_push(task);
        debug_assert!(ok, "ready ring sized below the task count");
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        // Wake due sleepers into their configured band first, so a
        // high-priority task never loses its turn to the scan below.
        let (ready, waiting) = (&mut self.ready, &mut self.waiting);
        waiting.process(now, |t| {
            let band =
                unsafe { data::<TaskData>(t).priority as usize };
            let ok = ready[band].try_push(t);
            debug_assert!(ok);
        });

        for band in 0..MAX_PRIORITY {
            while let Some(task) = self.ready[band].try_pop() {
                match task_state(task) {
                    TaskState::Ready | TaskState::Running => {
                        let ok = self.ready[band].try_push(task);
                        debug_assert!(ok);
                        return (Some(task), EVENT_OK);
                    }
                    TaskState::Done => ctx.task_done(task),
                    TaskState::Wait => self.waiting.push(task),
                    TaskState::None => {}
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

    fn add(
        sched: &mut FixedPriority<8>,
        task: &mut crate::task::TaskObject<STACK>,
        priority: usize,
    ) {
        let cfg = TaskConfig::new().set(PRIORITY, priority);
        sched.configure_task(tref(task), &cfg, 0);
        sched.add_task(tref(task));
    }

    #[test]
    fn highest_band_dominates() {
        let mut sched = FixedPriority::<8>::new();
        let mut ctx = TestCtx::default();
        let mut low = make_task(TaskState::Ready);
        let mut mid = make_task(TaskState::Ready);
        let mut high = make_task(TaskState::Ready);
        add(&mut sched, &mut low, 2);
        add(&mut sched, &mut mid, 1);
        add(&mut sched, &mut high, 0);

        // As long as a band-0 task is runnable, nothing else runs.
        for _ in 0..10 {
            assert_eq!(
                sched.next_task(0, &mut ctx).0,
                Some(tref(&mut high))
            );
        }
    }

    #[test]
    fn round_robins_within_a_band() {
        let mut sched = FixedPriority::<8>::new();
        let mut ctx = TestCtx::default();
        let mut a = make_task(TaskState::Ready);
        let mut b = make_task(TaskState::Ready);
        add(&mut sched, &mut a, 1);
        add(&mut sched, &mut b, 1);

        let p1 = sched.next_task(0, &mut ctx).0.unwrap();
        let p2 = sched.next_task(0, &mut ctx).0.unwrap();
        let p3 = sched.next_task(0, &mut ctx).0.unwrap();
        assert_ne!(p1, p2);
        assert_eq!(p1, p3);
    }

    #[test]
    fn lower_bands_run_when_higher_bands_drain() {
        let mut sched = FixedPriority::<8>::new();
        let mut ctx = TestCtx::default();
        let mut high = make_task(TaskState::Ready);
        let mut low = make_task(TaskState::Ready);
        add(&mut sched, &mut high, 0);
        add(&mut sched, &mut low, 2);

        assert_eq!(sched.next_task(0, &mut ctx).0, Some(tref(&mut high)));
        high.tcb.descriptor.state = TaskState::Done;
        assert_eq!(sched.next_task(0, &mut ctx).0, Some(tref(&mut low)));
        release_done(&mut sched, &mut ctx);
    }

    #[test]
    fn waking_sleeper_returns_to_its_band() {
        let mut sched = FixedPriority::<8>::new();
        let mut ctx = TestCtx::default();
        let mut bg = make_task(TaskState::Ready);
        let mut fg = make_task(TaskState::Wait);
        fg.tcb.descriptor.timing.next_run = 20;
        add(&mut sched, &mut bg, 2);
        add(&mut sched, &mut fg, 0);

        assert_eq!(sched.next_task(0, &mut ctx).0, Some(tref(&mut bg)));
        // Once awake, the band-0 task preempts the scan immediately.
        assert_eq!(sched.next_task(20, &mut ctx).0, Some(tref(&mut fg)));
    }

    #[test]
    #[should_panic(expected = "bad priority value")]
    fn out_of_range_priority_is_fatal() {
        let mut sched = FixedPriority::<8>::new();
        let mut t = make_task(TaskState::Ready);
        let cfg = TaskConfig::new().set(PRIORITY, MAX_PRIORITY);
        sched.configure_task(tref(&mut t), &cfg, 0);
    }
}
