// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative/preemptive hybrid: round-robin with a per-task quantum.
//!
//! Each task carries its own time slice, defaulting to the kernel's
//! launch-time quantum. On every selection the scheduler publishes the
//! chosen task's quantum through the kernel callback, so the SysTick
//! preemption counter measures against *that task's* slice. A task
//! configured with [`QUANTA_INFINITE`] is purely cooperative: SysTick
//! will never preempt it, and it runs until it sleeps, yields, or
//! terminates.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use core::ptr::NonNull;
use fixedq::CircQueue;
use slotpool::Pool;

const GROUP: u16 = 8;

/// Config key: this task's quantum in ticks; [`abi::QUANTA_INFINITE`]
/// makes the task cooperative.
pub const QUANTA: ConfigKey = ConfigKey::new(GROUP, 1 << 0);

struct TaskData {
    quanta: u32,
}

pub struct CoopPreemptive<const N: usize> {
    ready: CircQueue<NonNull<Tcb>, N>,
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> CoopPreemptive<N> {
    pub const fn new() -> Self {
        Self {
            ready: CircQueue::new(),
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }
}

impl<const N: usize> Default for CoopPreemptive<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for CoopPreemptive<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData {
                quanta: crate::time::default_quantum(),
            })
            .expect("scheduler data pool exhausted");
        cfg.update(QUANTA, &mut slot.quanta);
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
                    // Safety: configure_task installed the data.
                    let quanta = unsafe { data::<TaskData>(task).quanta };
                    ctx.set_quantum(quanta);
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
