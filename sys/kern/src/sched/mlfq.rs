// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multilevel feedback queue with per-task quanta and periodic boost.
//!
//! Three levels, each with its own (task-configurable) quantum. Tasks
//! start at level 0 and sink one level every time they burn a full
//! quantum; blocking voluntarily resets the quantum accounting, so
//! interactive tasks keep their standing while CPU hogs descend. A global
//! boost every [`GLOBAL_BOOST_TICKS`] returns long-demoted tasks to the
//! top, bounded per task by its `boost_quanta`.
//!
//! This is the one policy that needs to see individual ticks: on its
//! first selection it registers a systick hook through the kernel, and
//! that hook charges the running task and forces a reschedule the moment
//! the task's level quantum is spent.

use super::{
    data, task_state, Pick, Policy, SchedContext, StatSink, WaitQueue,
    EVENT_OK, IDLE,
};
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use binheap::{BinaryHeap, Compare};
use core::ptr::NonNull;
use slotpool::Pool;

const GROUP: u16 = 7;

/// Config key: pointer to a [`QuantumLevels`] with per-level quanta. The
/// struct is copied during `configure_task`, so it only needs to outlive
/// the `add_task` call.
pub const LEVELS: ConfigKey = ConfigKey::new(GROUP, 1 << 0);
/// Config key: minimum ticks between boosts of this particular task.
pub const BOOST_QUANTA: ConfigKey = ConfigKey::new(GROUP, 1 << 1);

/// Number of feedback levels.
pub const LEVEL_COUNT: usize = 3;

/// Global boost period, in ticks.
pub const GLOBAL_BOOST_TICKS: u32 = 500;

/// Per-level quanta, passed by pointer under the [`LEVELS`] key.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct QuantumLevels {
    pub high: u8,
    pub middle: u8,
    pub low: u8,
}

impl Default for QuantumLevels {
    fn default() -> Self {
        Self {
            high: 10,
            middle: 20,
            low: 40,
        }
    }
}

/// Statistics field indices reported by [`Policy::statistics`].
pub mod stat_fields {
    pub const LEVEL: usize = 0;
    pub const STATE: usize = 1;
    pub const TASK_ENTRY: usize = 2;
    pub const TASK_PARAM: usize = 3;
}

struct TaskData {
    levels: [u8; LEVEL_COUNT],
    quantum_used: u32,
    level: usize,
    last_boost: u32,
    boost_quanta: u32,
}

struct LeastQuantumUsed;

impl Compare<NonNull<Tcb>> for LeastQuantumUsed {
    fn less(a: &NonNull<Tcb>, b: &NonNull<Tcb>) -> bool {
        // Inverted: within a level, the task with the least consumed
        // quantum surfaces first.
        // Safety: queued tasks carry live policy data.
        unsafe {
            data::<TaskData>(*b).quantum_used
                < data::<TaskData>(*a).quantum_used
        }
    }
}

pub struct Mlfq<const N: usize> {
    levels: [BinaryHeap<NonNull<Tcb>, LeastQuantumUsed, N>; LEVEL_COUNT],
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
    last_boost: u32,
    current: Option<NonNull<Tcb>>,
    hook_registered: bool,
}

impl<const N: usize> Mlfq<N> {
    pub const fn new() -> Self {
        Self {
            levels: [const { BinaryHeap::new() }; LEVEL_COUNT],
            waiting: WaitQueue::new(),
            pool: Pool::new(),
            last_boost: 0,
            current: None,
            hook_registered: false,
        }
    }

    /// The systick hook: charge the running task one tick against its
    /// level quantum. Returns true to force an immediate reschedule.
    ///
    /// Called from the SysTick handler with the pointer this scheduler
    /// registered.
    ///
    /// # Safety (of the registration)
    ///
    /// The scheduler lives inside the installed kernel static and never
    /// moves, and SysTick cannot preempt PendSV (equal priority), so the
    /// raw self pointer is valid and unaliased whenever the hook runs.
    fn systick_hook(arg: *mut ()) -> bool {
        let sched = unsafe { &mut *(arg as *mut Self) };
        sched.charge_current()
    }

    /// One tick of quantum accounting against the running task. On
    /// exhaustion, resets the count and demotes (clamped to the lowest
    /// level), answering "reschedule now".
    pub fn charge_current(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        // Safety: the current task was picked from our queues and is
        // still alive.
        let d = unsafe { data::<TaskData>(current) };
        d.quantum_used += 1;
        if d.quantum_used >= d.levels[d.level] as u32 {
            d.quantum_used = 0;
            if d.level < LEVEL_COUNT - 1 {
                d.level += 1;
            }
            return true;
        }
        false
    }

    /// Returns every long-demoted task to level 0, subject to the
    /// per-task boost interval. The boosted tasks migrate physically the
    /// next time their old level queue is drained.
    fn boost_levels(&mut self, now: u32) {
        for level in 1..LEVEL_COUNT {
            self.levels[level].for_each(|task| {
                // Safety: queued tasks carry live policy data.
                let d = unsafe { data::<TaskData>(*task) };
                if now.wrapping_sub(d.last_boost) >= d.boost_quanta {
                    d.last_boost = now;
                    d.level = 0;
                    d.quantum_used = 0;
                }
            });
        }
    }

    fn pick_from(
        &mut self,
        level: usize,
        ctx: &mut dyn SchedContext,
    ) -> Option<NonNull<Tcb>> {
        while let Some(task) = self.levels[level].try_pop() {
            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    // Requeue at the task's *current* level, which may
                    // differ after a boost or demotion.
                    // Safety: queued tasks carry live policy data.
                    let home = unsafe { data::<TaskData>(task).level };
                    let ok = self.levels[home].try_push(task);
                    debug_assert!(ok);
                    return Some(task);
                }
                TaskState::Done => ctx.task_done(task),
                TaskState::Wait => {
                    // A voluntary block wipes the quantum debt; that is
                    // the interactivity bonus.
                    // Safety: as above.
                    unsafe { data::<TaskData>(task).quantum_used = 0 };
                    self.waiting.push(task);
                }
                TaskState::None => {}
            }
        }
        None
    }
}

impl<const N: usize> Default for Mlfq<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for Mlfq<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData {
                levels: [10, 20, 40],
                quantum_used: 0,
                level: 0,
                last_boost: now,
                boost_quanta: GLOBAL_BOOST_TICKS,
            })
            .expect("scheduler data pool exhausted");

        let mut levels_ptr: usize = 0;
        cfg.update(LEVELS, &mut levels_ptr);
        if levels_ptr != 0 {
            // Safety: the config contract for LEVELS is a pointer to a
            // QuantumLevels that is valid for the duration of add_task.
            let ql = unsafe { &*(levels_ptr as *const QuantumLevels) };
            slot.levels = [ql.high, ql.middle, ql.low];
        }
        cfg.update(BOOST_QUANTA, &mut slot.boost_quanta);

        // Safety: the task ref is live; we own its sched_data slot.
        unsafe {
            task.as_mut().set_sched_data(slot as *mut TaskData as *mut ());
        }
    }

    fn clear_task(&mut self, task: NonNull<Tcb>) {
        if self.current == Some(task) {
            self.current = None;
        }
        // Safety: sched_data was installed by configure_task above.
        unsafe {
            self.pool.free(task.as_ref().sched_data::<TaskData>());
        }
    }

    fn add_task(&mut self, task: NonNull<Tcb>) {
        // Safety: configure_task installed the data.
        let level = unsafe { data::<TaskData>(task).level };
        let ok = self.levels[level].try_push(task);
        debug_assert!(ok, "level queue sized below the task count");
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        if !self.hook_registered {
            self.hook_registered = true;
            crate::kernel::register_systick_hook(
                Self::systick_hook,
                self as *mut Self as *mut (),
            );
        }

        if now.wrapping_sub(self.last_boost) >= GLOBAL_BOOST_TICKS {
            self.last_boost = now;
            self.boost_levels(now);
        }

        let (levels, waiting) = (&mut self.levels, &mut self.waiting);
        waiting.process(now, |t| {
            // Safety: configure_task installed the data.
            let level = unsafe { data::<TaskData>(t).level };
            let ok = levels[level].try_push(t);
            debug_assert!(ok);
        });

        for level in 0..LEVEL_COUNT {
            if let Some(task) = self.pick_from(level, ctx) {
                self.current = Some(task);
                return (Some(task), EVENT_OK);
            }
        }
        self.current = None;
        IDLE
    }

    fn statistics(&self, sink: &mut dyn StatSink) -> bool {
        let mut index = 0;
        let mut report = |task: NonNull<Tcb>| {
            // Safety: queued tasks carry live policy data.
            let d = unsafe { data::<TaskData>(task) };
            let tcb = unsafe { task.as_ref() };
            sink.add_field(index, stat_fields::LEVEL, d.level);
            sink.add_field(
                index,
                stat_fields::STATE,
                tcb.descriptor.state as usize,
            );
            sink.add_field(
                index,
                stat_fields::TASK_ENTRY,
                tcb.descriptor.entry.map_or(0, |e| e as usize),
            );
            sink.add_field(
                index,
                stat_fields::TASK_PARAM,
                tcb.descriptor.parameter as usize,
            );
            index += 1;
        };

        for level in &self.levels {
            level.for_each(|t| report(*t));
        }
        self.waiting.for_each(&mut report);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;
    use crate::task::TaskObject;

    fn add(sched: &mut Mlfq<8>, task: &mut TaskObject<STACK>, now: u32) {
        sched.configure_task(tref(task), &TaskConfig::new(), now);
        sched.add_task(tref(task));
    }

    fn data_of(task: NonNull<Tcb>) -> &'static mut TaskData {
        unsafe { data::<TaskData>(task) }
    }

    /// Right after a pick, the returned task's level and quantum
    /// accounting must be in range.
    fn assert_invariant(task: NonNull<Tcb>) {
        let d = data_of(task);
        assert!(d.level < LEVEL_COUNT);
        assert!(d.quantum_used < d.levels[d.level] as u32);
    }

    #[test]
    fn hog_descends_level_by_level() {
        let mut sched = Mlfq::<8>::new();
        let mut ctx = TestCtx::default();
        let mut hog = make_task(TaskState::Ready);
        add(&mut sched, &mut hog, 0);

        assert_eq!(sched.next_task(0, &mut ctx).0, Some(tref(&mut hog)));
        assert_invariant(tref(&mut hog));

        // Burn the level-0 quantum (10 ticks): the hook demands a switch
        // and the task lands on level 1.
        for tick in 0..10 {
            let fired = sched.charge_current();
            assert_eq!(fired, tick == 9);
        }
        assert_eq!(data_of(tref(&mut hog)).level, 1);
        assert_eq!(data_of(tref(&mut hog)).quantum_used, 0);

        // Level 1 quantum is 20; then the bottom level clamps.
        sched.next_task(10, &mut ctx);
        for _ in 0..20 {
            sched.charge_current();
        }
        assert_eq!(data_of(tref(&mut hog)).level, 2);
        sched.next_task(30, &mut ctx);
        for _ in 0..40 {
            sched.charge_current();
        }
        assert_eq!(data_of(tref(&mut hog)).level, 2, "clamped at bottom");
    }

    #[test]
    fn voluntary_wait_resets_quantum_debt() {
        let mut sched = Mlfq::<8>::new();
        let mut ctx = TestCtx::default();
        let mut t = make_task(TaskState::Ready);
        let mut other = make_task(TaskState::Ready);
        add(&mut sched, &mut t, 0);
        add(&mut sched, &mut other, 0);

        let mut first = sched.next_task(0, &mut ctx).0.unwrap();
        // Partially consume the quantum, then block voluntarily.
        for _ in 0..4 {
            sched.charge_current();
        }
        assert_eq!(data_of(first).quantum_used, 4);
        unsafe { first.as_mut() }.descriptor.state = TaskState::Wait;
        unsafe { first.as_mut() }.descriptor.timing.next_run = 50;

        sched.next_task(1, &mut ctx);
        assert_eq!(data_of(first).quantum_used, 0, "debt wiped on block");
        assert_eq!(data_of(first).level, 0, "no demotion for blocking");
    }

    #[test]
    fn global_boost_lifts_demoted_tasks() {
        let mut sched = Mlfq::<8>::new();
        let mut ctx = TestCtx::default();
        let mut hog = make_task(TaskState::Ready);
        let mut other = make_task(TaskState::Ready);
        add(&mut sched, &mut hog, 0);
        add(&mut sched, &mut other, 0);

        // Demote the hog to the bottom.
        let picked = sched.next_task(0, &mut ctx).0.unwrap();
        for _ in 0..10 {
            sched.charge_current();
        }
        sched.next_task(1, &mut ctx);
        // Make sure it is the hog we demoted; charge whoever is current
        // until the hog reaches level 2.
        for now in 2..200u32 {
            if data_of(tref(&mut hog)).level == 2 {
                break;
            }
            for _ in 0..40 {
                sched.charge_current();
            }
            sched.next_task(now, &mut ctx);
        }
        let _ = picked;
        assert_eq!(data_of(tref(&mut hog)).level, 2);

        // Past the boost period, the next selection pass lifts it back.
        sched.next_task(GLOBAL_BOOST_TICKS + 1, &mut ctx);
        assert_eq!(data_of(tref(&mut hog)).level, 0);
        assert_eq!(data_of(tref(&mut hog)).quantum_used, 0);
    }

    #[test]
    fn custom_levels_config_is_honored() {
        let mut sched = Mlfq::<8>::new();
        let mut t = make_task(TaskState::Ready);
        let levels = QuantumLevels {
            high: 2,
            middle: 4,
            low: 6,
        };
        let cfg = TaskConfig::new()
            .set(LEVELS, &levels as *const QuantumLevels as usize)
            .set(BOOST_QUANTA, 123);
        sched.configure_task(tref(&mut t), &cfg, 0);
        let d = data_of(tref(&mut t));
        assert_eq!(d.levels, [2, 4, 6]);
        assert_eq!(d.boost_quanta, 123);
    }

    #[test]
    fn statistics_cover_every_task() {
        struct CountingSink {
            rows: usize,
            fields: usize,
        }
        impl StatSink for CountingSink {
            fn add_field(&mut self, task: usize, _f: usize, _v: usize) {
                self.rows = self.rows.max(task + 1);
                self.fields += 1;
            }
        }

        let mut sched = Mlfq::<8>::new();
        let mut ctx = TestCtx::default();
        let mut a = make_task(TaskState::Ready);
        let mut b = make_task(TaskState::Ready);
        add(&mut sched, &mut a, 0);
        add(&mut sched, &mut b, 0);
        sched.next_task(0, &mut ctx);

        let mut sink = CountingSink { rows: 0, fields: 0 };
        assert!(sched.statistics(&mut sink));
        assert_eq!(sink.rows, 2);
        assert_eq!(sink.fields, 8);
    }
}
