// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lottery scheduling: each task holds tickets, each selection draws one.
//!
//! The ready set is a plain slot array; a selection sums the tickets of
//! runnable tasks, draws a pseudorandom number below the total, and walks
//! the slots accumulating tickets until the draw falls inside a task's
//! range. Expected CPU share is proportional to ticket count. The RNG is
//! reseeded from the SysTick subtick counter whenever a task is added, so
//! identical boots don't replay identical schedules.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::rand::XorShift32;
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use core::ptr::NonNull;
use slotpool::Pool;

const GROUP: u16 = 3;

/// Config key: ticket count, at least 1.
pub const TICKETS: ConfigKey = ConfigKey::new(GROUP, 1 << 0);

struct TaskData {
    tickets: u8,
}

pub struct Lottery<const N: usize> {
    ready: [Option<NonNull<Tcb>>; N],
    ready_count: usize,
    total_tickets: u32,
    rng: XorShift32,
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> Lottery<N> {
    pub const fn new() -> Self {
        Self {
            ready: [None; N],
            ready_count: 0,
            total_tickets: 0,
            rng: XorShift32::new(0),
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }

    fn tickets_of(task: NonNull<Tcb>) -> u32 {
        // Safety: configure_task installed a TaskData for every task.
        unsafe { data::<TaskData>(task).tickets as u32 }
    }

    fn insert(&mut self, task: NonNull<Tcb>) {
        for slot in self.ready.iter_mut() {
            if slot.is_none() {
                *slot = Some(task);
                self.ready_count += 1;
                self.total_tickets += Self::tickets_of(task);
                return;
            }
        }
        debug_assert!(false, "ready array sized below the task count");
    }

    fn remove(&mut self, task: NonNull<Tcb>) {
        for slot in self.ready.iter_mut() {
            if *slot == Some(task) {
                *slot = None;
                self.ready_count -= 1;
                self.total_tickets -= Self::tickets_of(task);
                return;
            }
        }
    }
}

impl<const N: usize> Default for Lottery<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for Lottery<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData { tickets: 1 })
            .expect("scheduler data pool exhausted");
        cfg.update(TICKETS, &mut slot.tickets);
        assert!(slot.tickets > 0, "a task needs at least one ticket");
        // Safety: the task ref is live; we own its sched_data slot.
        unsafe {
            task.as_mut().set_sched_data(slot as *mut TaskData as *mut ());
        }
    }

    fn clear_task(&mut self, task: NonNull<Tcb>) {
        self.remove(task);
        // Safety: sched_data was installed by configure_task above.
        unsafe {
            self.pool.free(task.as_ref().sched_data::<TaskData>());
        }
    }

    fn add_task(&mut self, task: NonNull<Tcb>) {
        self.insert(task);
        self.rng.reseed(crate::arch::systick_value());
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        // Collect due sleepers first; they buy back into the draw.
        let mut woken = [None; N];
        let mut woken_count = 0;
        self.waiting.process(now, |t| {
            woken[woken_count] = Some(t);
            woken_count += 1;
        });
        for slot in woken.iter().take(woken_count) {
            if let Some(t) = *slot {
                self.insert(t);
            }
        }

        if self.total_tickets == 0 {
            return IDLE;
        }
        let draw = self.rng.next() % self.total_tickets;

        let mut accumulated = 0;
        let mut checked = 0;
        for idx in 0..N {
            if checked >= self.ready_count {
                break;
            }
            let Some(task) = self.ready[idx] else {
                continue;
            };
            checked += 1;
            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    accumulated += Self::tickets_of(task);
                    if draw < accumulated {
                        return (Some(task), EVENT_OK);
                    }
                }
                TaskState::Done => {
                    self.remove(task);
                    ctx.task_done(task);
                }
                TaskState::Wait => {
                    self.remove(task);
                    self.waiting.push(task);
                }
                TaskState::None => {}
            }
        }
        // The draw landed in a range owned by a task that just left the
        // ready set; idle for one pass and redraw next time.
        IDLE
    }
}
