// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-robin scheduling: one ring, equal slices, no priorities.

use super::{
    task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{TaskConfig, TaskState};
use core::ptr::NonNull;
use fixedq::CircQueue;

pub struct RoundRobin<const N: usize> {
    ready: CircQueue<NonNull<Tcb>, N>,
    waiting: WaitQueue<N>,
}

impl<const N: usize> RoundRobin<N> {
    pub const fn new() -> Self {
        Self {
            ready: CircQueue::new(),
            waiting: WaitQueue::new(),
        }
    }
}

impl<const N: usize> Default for RoundRobin<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for RoundRobin<N> {
    fn configure_task(
        &mut self,
        _task: NonNull<Tcb>,
        _cfg: &TaskConfig,
        _now: u32,
    ) {
        // No per-task state: every task is equal here.
    }

    fn clear_task(&mut self, _task: NonNull<Tcb>) {}

    fn add_task(&mut self, task: NonNull<Tcb>) {
        let ok = self.ready.try_push(task);
        debug_assert!(ok, "ready ring sized below the task count");
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        let ready = &mut self.ready;
        self.waiting.process(now, |t| {
            let ok = ready.try_push(t);
            debug_assert!(ok);
        });

        while let Some(task) = self.ready.try_pop() {
            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    let ok = self.ready.try_push(task);
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
