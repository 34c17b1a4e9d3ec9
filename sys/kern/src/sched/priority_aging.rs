// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed priorities with aging: waiting in a lower band earns promotion.
//!
//! Selection works like the fixed-priority policy, with two twists. The
//! selected task has its effective priority reset to its configured base
//! before requeueing. And after every selection, each task sitting in a
//! band below the top accrues one point of aging score; at its threshold
//! the score clears and the task moves up one band. Starvation in the
//! lower bands therefore decays instead of persisting.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use core::ptr::NonNull;
use fixedq::CircQueue;
use slotpool::Pool;

pub use super::fixed_priority::MAX_PRIORITY;

const GROUP: u16 = 2;

/// Config key: base priority band, `0..MAX_PRIORITY`.
pub const PRIORITY: ConfigKey = ConfigKey::new(GROUP, 1 << 0);
/// Config key: selections spent in a lower band before promotion.
pub const AGING_THRESHOLD: ConfigKey = ConfigKey::new(GROUP, 1 << 1);

struct TaskData {
    current_priority: u8,
    base_priority: u8,
    aging_threshold: u8,
    aging_score: u8,
}

pub struct PriorityAging<const N: usize> {
    ready: [CircQueue<NonNull<Tcb>, N>; MAX_PRIORITY],
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> PriorityAging<N> {
    pub const fn new() -> Self {
        Self {
            ready: [const { CircQueue::new() }; MAX_PRIORITY],
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }

    fn pick(&mut self, ctx: &mut dyn SchedContext) -> Option<NonNull<Tcb>> {
        for band in 0..MAX_PRIORITY {
            while let Some(task) = self.ready[band].try_pop() {
                match task_state(task) {
                    TaskState::Ready | TaskState::Running => {
                        // Selection resets the task to its base band.
                        // Safety: configure_task installed the data.
                        let d = unsafe { data::<TaskData>(task) };
                        d.current_priority = d.base_priority;
                        let ok = self.ready[d.base_priority as usize]
                            .try_push(task);
                        debug_assert!(ok);
                        return Some(task);
                    }
                    TaskState::Done => ctx.task_done(task),
                    TaskState::Wait => self.waiting.push(task),
                    TaskState::None => {}
                }
            }
        }
        None
    }

    /// One aging round over every band below the top: bump each task's
    /// score and promote it one band when the score reaches its
    /// threshold.
    fn age_ready_tasks(&mut self) {
        for band in 1..MAX_PRIORITY {
            let in_band = self.ready[band].len();
            for _ in 0..in_band {
                let Some(task) = self.ready[band].try_pop() else {
                    break;
                };
                // Safety: configure_task installed the data.
                let d = unsafe { data::<TaskData>(task) };
                d.aging_score += 1;
                if d.aging_score >= d.aging_threshold {
                    d.aging_score = 0;
                    d.current_priority = band as u8 - 1;
                    let ok = self.ready[band - 1].try_push(task);
                    debug_assert!(ok);
                } else {
                    let ok = self.ready[band].try_push(task);
                    debug_assert!(ok);
                }
            }
        }
    }
}

impl<const N: usize> Default for PriorityAging<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for PriorityAging<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData {
                current_priority: 1,
                base_priority: 1,
                aging_threshold: 1,
                aging_score: 0,
            })
            .expect("scheduler data pool exhausted");
        cfg.update(PRIORITY, &mut slot.current_priority);
        assert!(
            (slot.current_priority as usize) < MAX_PRIORITY,
            "bad priority value"
        );
        slot.base_priority = slot.current_priority;
        cfg.update(AGING_THRESHOLD, &mut slot.aging_threshold);
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
        // Safety: configure_task installed the data.
        let band =
            unsafe { data::<TaskData>(task).current_priority as usize };
        debug_assert!(band < MAX_PRIORITY);
        let ok = self.ready[band].try_push(task);
        debug_assert!(ok, "ready ring sized below the task count");
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        let (ready, waiting) = (&mut self.ready, &mut self.waiting);
        waiting.process(now, |t| {
            let band = unsafe {
                data::<TaskData>(t).current_priority as usize
            };
            let ok = ready[band].try_push(t);
            debug_assert!(ok);
        });

        let picked = self.pick(ctx);
        self.age_ready_tasks();
        match picked {
            Some(task) => (Some(task), EVENT_OK),
            None => IDLE,
        }
    }
}
