// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler framework.
//!
//! A scheduling policy implements [`Policy`]: configure per-task state
//! from the config blob, account for a departing task, enqueue a ready
//! task, and pick the next one. The kernel talks back through
//! [`SchedContext`] -- releasing completed tasks and changing the
//! preemption quantum -- so policies stay free of kernel internals.
//!
//! Every policy follows the same drain pattern in its picker: first run
//! the [`WaitQueue`] (sleeping tasks whose wakeup tick has arrived go back
//! to the ready structure), then pull from the ready structure and act on
//! the task's lifecycle state -- READY/RUNNING tasks are requeued and
//! returned, DONE tasks are reported for release, WAIT tasks move to the
//! wait queue.

use crate::task::Tcb;
use abi::{TaskState, EVENT_OK};
use binheap::{BinaryHeap, Compare};
use core::ptr::NonNull;

pub mod cfs;
pub mod coop;
pub mod edf;
pub mod fixed_priority;
pub mod lottery;
pub mod mlfq;
pub mod priority_aging;
pub mod round_robin;
pub mod weighted_lottery;

pub use abi::{Decision, EventCode, EventHandler};

/// What a picker returns: possibly a task, plus an out-of-band event code
/// ([`EVENT_OK`] when there is nothing to report).
pub type Pick = (Option<NonNull<Tcb>>, EventCode);

/// The quiet pick with no task -- the kernel substitutes the idle task.
pub const IDLE: Pick = (None, EVENT_OK);

/// Kernel-side callbacks available to a policy while it picks.
pub trait SchedContext {
    /// Reports a task observed in the DONE state. The kernel will call
    /// [`Policy::clear_task`] and return the task object to its pool
    /// after the pick completes; the policy must already have dropped its
    /// own references to the task.
    fn task_done(&mut self, task: NonNull<Tcb>);

    /// Changes the preemption quantum for the task about to run.
    fn set_quantum(&mut self, quantum: u32);
}

/// A scheduling policy. Implementations size their internal structures
/// for the kernel's maximum task count.
pub trait Policy {
    /// Builds per-task scheduler state from the config blob. Called once
    /// per task at `add_task` time, before the first enqueue.
    fn configure_task(
        &mut self,
        task: NonNull<Tcb>,
        cfg: &abi::TaskConfig,
        now: u32,
    );

    /// Releases the per-task scheduler state. Called by the kernel after
    /// the policy reported the task via [`SchedContext::task_done`].
    fn clear_task(&mut self, task: NonNull<Tcb>);

    /// Enqueues a READY task.
    fn add_task(&mut self, task: NonNull<Tcb>);

    /// Picks the next task to run, or `None` for idle.
    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick;

    /// Dumps policy-specific per-task fields into `sink`; returns false
    /// when the policy keeps no statistics.
    fn statistics(&self, sink: &mut dyn StatSink) -> bool {
        let _ = sink;
        false
    }
}

/// Receiver for [`Policy::statistics`] snapshots: `(task index, field
/// index, value)` triples, field meanings defined per policy.
pub trait StatSink {
    fn add_field(&mut self, task: usize, field: usize, value: usize);
}

/// Reads a task's lifecycle state through its ref.
pub(crate) fn task_state(task: NonNull<Tcb>) -> TaskState {
    // Safety: task refs handed to policies stay valid until the policy
    // reports them done and the kernel releases them.
    unsafe { task.as_ref().descriptor.state }
}

pub(crate) fn set_task_state(mut task: NonNull<Tcb>, state: TaskState) {
    // Safety: as above; state transitions are serialized by the
    // single-core execution model.
    unsafe { task.as_mut().descriptor.state = state }
}

/// Borrows the policy-owned data of `task`.
///
/// # Safety
///
/// The task's `sched_data` must point at a live `T` owned by the calling
/// policy, and the borrow must not outlive the policy's pool slot.
pub(crate) unsafe fn data<'a, T>(task: NonNull<Tcb>) -> &'a mut T {
    &mut *task.as_ref().sched_data::<T>()
}

/// One sleeping task: the wakeup tick is captured at insert time, which
/// is also the heap key.
#[derive(Copy, Clone)]
struct Sleeper {
    next_run: u32,
    task: NonNull<Tcb>,
}

struct EarliestWake;

impl Compare<Sleeper> for EarliestWake {
    fn less(a: &Sleeper, b: &Sleeper) -> bool {
        // Inverted: the earliest wakeup surfaces first.
        b.next_run < a.next_run
    }
}

/// Min-heap of sleeping tasks ordered by wakeup tick, shared by every
/// policy.
pub struct WaitQueue<const N: usize> {
    heap: BinaryHeap<Sleeper, EarliestWake, N>,
}

impl<const N: usize> WaitQueue<N> {
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, task: NonNull<Tcb>) {
        // Safety: task refs in the scheduler are live; see task_state.
        let next_run = unsafe { task.as_ref().descriptor.timing.next_run };
        let ok = self.heap.try_push(Sleeper { next_run, task });
        debug_assert!(ok, "wait queue sized below the task count");
    }

    /// Wakes every task due at `now`: flips it to READY and hands it to
    /// `requeue` (typically the policy's `add_task`).
    pub fn process(
        &mut self,
        now: u32,
        mut requeue: impl FnMut(NonNull<Tcb>),
    ) {
        while let Some(top) = self.heap.peek() {
            if top.next_run > now {
                break;
            }
            self.heap.try_pop();
            set_task_state(top.task, TaskState::Ready);
            requeue(top.task);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(NonNull<Tcb>)) {
        self.heap.for_each(|s| f(s.task));
    }
}

impl<const N: usize> Default for WaitQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared scaffolding for the policy unit tests: fabricated task objects
/// and a recording `SchedContext`.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::task::TaskObject;
    use abi::TaskState;

    pub const STACK: usize = 64;

    extern "C" fn nop_entry(_arg: *mut ()) {}

    /// A boxed task object in the given state, ready to hand to a policy.
    pub fn make_task(state: TaskState) -> Box<TaskObject<STACK>> {
        let mut obj = Box::new(TaskObject::<STACK>::new());
        obj.reset_stack();
        obj.tcb.descriptor.entry = Some(nop_entry);
        obj.tcb.descriptor.state = state;
        obj
    }

    pub fn tref(obj: &mut TaskObject<STACK>) -> NonNull<Tcb> {
        NonNull::from(&mut obj.tcb)
    }

    /// Records everything a policy asks the kernel to do.
    #[derive(Default)]
    pub struct TestCtx {
        pub done: Vec<NonNull<Tcb>>,
        pub quanta: Vec<u32>,
    }

    impl SchedContext for TestCtx {
        fn task_done(&mut self, task: NonNull<Tcb>) {
            self.done.push(task);
        }

        fn set_quantum(&mut self, quantum: u32) {
            self.quanta.push(quantum);
        }
    }

    /// Runs the policy's release protocol for everything the last pick
    /// reported done, like the kernel would.
    pub fn release_done(policy: &mut impl Policy, ctx: &mut TestCtx) {
        for task in ctx.done.drain(..) {
            policy.clear_task(task);
        }
    }
}
