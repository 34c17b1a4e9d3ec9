// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel core: task lifecycle, the tick/quantum machinery, and the
//! PendSV dispatch loop.
//!
//! The application instantiates one [`Kernel`] in a `static`, binding a
//! scheduler policy to a stack size and task count, and calls
//! [`Kernel::install`] exactly once. The handlers and API functions reach
//! the installed kernel through a process-wide slot, manufacturing their
//! exclusive reference at each entry point -- entries are serialized by
//! the single-core execution model (API calls mask IRQs; PendSV and
//! SysTick share one preemption level and never nest).
//!
//! Size the policy's internal structures for at least `MAX_TASKS`; the
//! kernel cannot check that for you.

use crate::arch;
use crate::sched::{Policy, SchedContext, StatSink};
use crate::task::{TaskObject, Tcb};
use crate::time;
use abi::{
    Decision, EventCode, EventHandler, TaskConfig, TaskEntry, TaskFlags,
    TaskState, EVENT_OK,
};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use fixedq::CircQueue;
use slotpool::Pool;

/// The task the CPU is (or is about to be) running. Updated from the
/// PendSV dispatch loop; read by the context-switch assembly, which is
/// why the symbol is unmangled.
#[no_mangle]
pub static CURRENT_TCB_PTR: AtomicPtr<Tcb> =
    AtomicPtr::new(core::ptr::null_mut());

/// The installed kernel. Written once by [`Kernel::install`].
static mut INSTANCE: Option<&'static mut dyn KernelCore> = None;

/// Registered scheduler event handler, as a `usize`-encoded function
/// pointer (0 = none) so handler swaps are atomic.
static EVENT_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Registered systick hook and its argument; same encoding.
static SYSTICK_HOOK_FN: AtomicUsize = AtomicUsize::new(0);
static SYSTICK_HOOK_ARG: AtomicPtr<()> =
    AtomicPtr::new(core::ptr::null_mut());

/// Idle hook, installed from the kernel settings.
static IDLE_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Preemption accounting; owned by the SysTick handler alone.
static mut PREEMPT: time::PreemptState = time::PreemptState::new();

/// A per-tick hook: returns true to force an immediate reschedule. Used
/// by schedulers (MLFQ) that do their own quantum accounting.
pub type SystickHook = fn(*mut ()) -> bool;

/// Stack for the built-in idle task, in words.
const IDLE_STACK_WORDS: usize = 256;

/// Launch-time configuration that does not need const generics.
#[derive(Copy, Clone)]
pub struct KernelSettings {
    /// CPU cycles per kernel tick; the SysTick reload for 1 ms.
    pub tick_divisor: u32,
    /// Called by the idle task before each WFI.
    pub idle_hook: Option<fn()>,
    /// Mark new tasks FPU-using by default (relevant with the `fpu`
    /// feature).
    pub task_fpu_default: bool,
}

impl KernelSettings {
    pub const fn new(tick_divisor: u32) -> Self {
        Self {
            tick_divisor,
            idle_hook: None,
            task_fpu_default: false,
        }
    }
}

/// Object-safe face of the generic kernel, for the process-wide slot.
trait KernelCore {
    fn add_task(
        &mut self,
        entry: TaskEntry,
        cfg: &TaskConfig,
        param: *mut (),
    ) -> NonNull<Tcb>;
    fn next_task(&mut self, now: u32) -> (NonNull<Tcb>, EventCode);
    fn tick_divisor(&self) -> u32;
    fn statistics(&mut self, sink: &mut dyn StatSink) -> bool;
    fn live_tasks(&self) -> usize;
}

/// The kernel: a scheduler policy bound to a fixed pool of
/// `MAX_TASKS` tasks with `STACK_WORDS`-word stacks.
pub struct Kernel<P: Policy, const STACK_WORDS: usize, const MAX_TASKS: usize>
{
    inner: UnsafeCell<Inner<P, STACK_WORDS, MAX_TASKS>>,
}

// Safety: all access to the inner state funnels through the install slot
// and is serialized by the single-core execution model described in the
// module docs.
unsafe impl<P: Policy, const SW: usize, const MT: usize> Sync
    for Kernel<P, SW, MT>
{
}

struct Inner<P: Policy, const STACK_WORDS: usize, const MAX_TASKS: usize> {
    policy: P,
    pool: Pool<TaskObject<STACK_WORDS>, MAX_TASKS>,
    idle: TaskObject<IDLE_STACK_WORDS>,
    /// Tasks the policy reported DONE during the current pick; drained
    /// (clear + free) before the pick returns.
    done: CircQueue<NonNull<Tcb>, MAX_TASKS>,
    settings: KernelSettings,
}

impl<P: Policy, const SW: usize, const MT: usize> Kernel<P, SW, MT> {
    pub const fn new(policy: P, settings: KernelSettings) -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                policy,
                pool: Pool::new(),
                idle: TaskObject::new(),
                done: CircQueue::new(),
                settings,
            }),
        }
    }

    /// Publishes this kernel as *the* kernel. Panics on a second install
    /// -- reinitializing a running kernel is a configuration mistake, not
    /// a recoverable condition.
    pub fn install(&'static self) {
        arch::interrupt_free(|| {
            // Safety: the slot is only written here, under the critical
            // section.
            let slot =
                unsafe { &mut *core::ptr::addr_of_mut!(INSTANCE) };
            if slot.is_some() {
                panic!("kernel already initialized");
            }
            // Safety: before installation nothing else can reach the
            // inner state.
            let inner = unsafe { &mut *self.inner.get() };
            inner.idle.reset_stack();
            inner.idle.prime_stack(idle_entry as usize as u32);
            if let Some(hook) = inner.settings.idle_hook {
                IDLE_HOOK.store(hook as usize, Ordering::Relaxed);
            }
            *slot = Some(inner);
        });
        klog!("kernel installed");
    }
}

impl<P: Policy, const SW: usize, const MT: usize> KernelCore
    for Inner<P, SW, MT>
{
    fn add_task(
        &mut self,
        entry: TaskEntry,
        cfg: &TaskConfig,
        param: *mut (),
    ) -> NonNull<Tcb> {
        // Running out of task slots is a sizing mistake in the
        // application, and this is the kernel's one deliberate
        // fail-loudly allocation.
        let Some(obj) = self.pool.alloc(TaskObject::new()) else {
            panic!("task pool exhausted");
        };
        obj.reset_stack();
        obj.prime_stack(task_wrapper as usize as u32);
        obj.tcb.descriptor.entry = Some(entry);
        obj.tcb.descriptor.parameter = param;
        obj.tcb.descriptor.state = TaskState::Ready;
        if self.settings.task_fpu_default {
            obj.tcb.flags |= TaskFlags::FPU_USED;
        }

        let task = NonNull::from(&mut obj.tcb);
        let now = time::tick_count();
        self.policy.configure_task(task, cfg, now);
        self.policy.add_task(task);
        task
    }

    fn next_task(&mut self, now: u32) -> (NonNull<Tcb>, EventCode) {
        let (policy, done) = (&mut self.policy, &mut self.done);
        let mut ctx = ReleaseCtx { done };
        let (picked, event) = policy.next_task(now, &mut ctx);

        // Release everything the policy reported: policy state first,
        // then the task object itself. The policy already dropped its
        // queue references.
        while let Some(task) = self.done.try_pop() {
            self.policy.clear_task(task);
            // The TCB is the first field of its TaskObject, so the
            // pointers coincide.
            self.pool.free(task.as_ptr() as *mut TaskObject<SW>);
        }

        match picked {
            Some(task) => (task, event),
            None => (NonNull::from(&mut self.idle.tcb), event),
        }
    }

    fn tick_divisor(&self) -> u32 {
        self.settings.tick_divisor
    }

    fn statistics(&mut self, sink: &mut dyn StatSink) -> bool {
        self.policy.statistics(sink)
    }

    fn live_tasks(&self) -> usize {
        self.pool.live()
    }
}

/// The `SchedContext` the kernel hands each pick.
struct ReleaseCtx<'a, const MT: usize> {
    done: &'a mut CircQueue<NonNull<Tcb>, MT>,
}

impl<const MT: usize> SchedContext for ReleaseCtx<'_, MT> {
    fn task_done(&mut self, task: NonNull<Tcb>) {
        let ok = self.done.try_push(task);
        debug_assert!(ok, "done queue sized below the task count");
    }

    fn set_quantum(&mut self, quantum: u32) {
        time::set_quantum(quantum);
    }
}

fn with_instance<R>(f: impl FnOnce(&mut dyn KernelCore) -> R) -> R {
    // Safety: entries are serialized (module docs); the slot is written
    // once before any of them can run.
    let slot = unsafe { &mut *core::ptr::addr_of_mut!(INSTANCE) };
    match slot {
        Some(k) => f(&mut **k),
        None => panic!("kernel not initialized"),
    }
}

fn event_handler() -> Option<EventHandler> {
    let raw = EVENT_HANDLER.load(Ordering::Relaxed);
    if raw == 0 {
        None
    } else {
        // Safety: the only writer stores a valid `EventHandler`.
        Some(unsafe { core::mem::transmute::<usize, EventHandler>(raw) })
    }
}

/// Every task starts here. Runs the entry function, then parks the task
/// in DONE until the scheduler collects it.
extern "C" fn task_wrapper() {
    let tcb_ptr = CURRENT_TCB_PTR.load(Ordering::Relaxed);
    assert!(!tcb_ptr.is_null(), "no current TCB");
    // Safety: the pointer was planted by the dispatch loop and stays
    // valid while the task exists; the task itself is the only code
    // touching its descriptor here.
    let tcb = unsafe { &mut *tcb_ptr };
    if let Some(entry) = tcb.descriptor.entry {
        tcb.descriptor.state = TaskState::Running;
        entry(tcb.descriptor.parameter);
    }
    tcb.descriptor.state = TaskState::Done;
    // The switch pended by yield_now fires before the wrapper could
    // return; the loop is insurance against a spurious wakeup.
    loop {
        yield_now();
    }
}

/// The idle task: runs the application's idle hook, then sleeps until
/// the next interrupt. Scheduled whenever the policy has nothing
/// runnable.
extern "C" fn idle_entry() {
    loop {
        let raw = IDLE_HOOK.load(Ordering::Relaxed);
        if raw != 0 {
            // Safety: the only writer stores a valid `fn()`.
            let hook: fn() = unsafe { core::mem::transmute(raw) };
            hook();
        }
        arch::wait_for_interrupt();
    }
}

// --- Public API -----------------------------------------------------------

/// Installs a task. The first task added becomes the initial running
/// task. Pool exhaustion panics by design.
pub fn add_task(entry: TaskEntry, cfg: &TaskConfig, param: *mut ()) {
    arch::interrupt_free(|| {
        let added = with_instance(|k| k.add_task(entry, cfg, param));
        let _ = CURRENT_TCB_PTR.compare_exchange(
            core::ptr::null_mut(),
            added.as_ptr(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    });
}

/// [`add_task`] with an empty config and no parameter.
pub fn add_task_simple(entry: TaskEntry) {
    add_task(entry, &TaskConfig::new(), core::ptr::null_mut());
}

/// Starts the scheduler: programs SysTick for 1 ms ticks, records the
/// default quantum, picks the initial task, and jumps into it. Never
/// returns.
pub fn launch(default_quanta: u32) -> ! {
    time::set_default_quantum(default_quanta);
    time::set_quantum(default_quanta);

    let tick_divisor =
        arch::interrupt_free(|| with_instance(|k| k.tick_divisor()));

    let now = time::tick_count();
    let (first, _event) =
        arch::interrupt_free(|| with_instance(|k| k.next_task(now)));
    CURRENT_TCB_PTR.store(first.as_ptr(), Ordering::Relaxed);
    arch::assert_layout();

    klog!("launch: default quantum {}", default_quanta);
    // Safety: single call site on the boot path, current TCB is primed.
    unsafe { arch::start_first_task(tick_divisor) }
}

/// Requests a reschedule; returns immediately (the switch happens on
/// handler exit).
pub fn yield_now() {
    arch::pend_context_switch();
}

/// The running task's control block, if the kernel has started one.
pub fn current_tcb() -> Option<NonNull<Tcb>> {
    NonNull::new(CURRENT_TCB_PTR.load(Ordering::Relaxed))
}

/// Blocks the calling task for at least `ms` ticks.
pub fn sleep(ms: u32) {
    let Some(mut task) = current_tcb() else {
        panic!("sleep outside task context");
    };
    // Safety: the current task is live and this runs in its context.
    let tcb = unsafe { task.as_mut() };
    tcb.descriptor.timing.next_run = time::tick_count().wrapping_add(ms);
    tcb.descriptor.state = TaskState::Wait;
    arch::pend_context_switch();
}

/// Marks the calling task DONE. The next scheduler pass frees it; this
/// does not return to the task (unless called from interrupt context,
/// where the switch is deferred to the pending handlers).
pub fn terminate_current() {
    let Some(mut task) = current_tcb() else {
        panic!("terminate outside task context");
    };
    // Safety: as in sleep.
    let tcb = unsafe { task.as_mut() };
    tcb.descriptor.state = TaskState::Done;
    if !arch::in_interrupt() {
        arch::pend_context_switch();
    }
}

/// Installs the callback the PendSV dispatch loop consults when the
/// scheduler reports a non-OK event.
pub fn register_scheduler_event_handler(handler: EventHandler) {
    EVENT_HANDLER.store(handler as usize, Ordering::Relaxed);
}

/// Gives the active scheduler a per-tick hook; see [`SystickHook`].
pub fn register_systick_hook(hook: SystickHook, arg: *mut ()) {
    SYSTICK_HOOK_ARG.store(arg, Ordering::Relaxed);
    SYSTICK_HOOK_FN.store(hook as usize, Ordering::Relaxed);
}

/// Snapshot of scheduler-specific per-task state, when the active policy
/// keeps any.
pub fn scheduler_statistics(sink: &mut dyn StatSink) -> bool {
    arch::interrupt_free(|| with_instance(|k| k.statistics(sink)))
}

/// Number of live entries in the task pool; the install/terminate leak
/// check reads this.
pub fn live_tasks() -> usize {
    arch::interrupt_free(|| with_instance(|k| k.live_tasks()))
}

// --- Handler entry points -------------------------------------------------

/// SysTick: advance time, run the hook or the quantum counter, maybe
/// pend a switch.
pub(crate) fn systick_entry() {
    time::advance_tick();

    let hook_fired = {
        let raw = SYSTICK_HOOK_FN.load(Ordering::Relaxed);
        if raw == 0 {
            None
        } else {
            // Safety: the only writer stores a valid `SystickHook`.
            let hook: SystickHook =
                unsafe { core::mem::transmute(raw) };
            Some(hook(SYSTICK_HOOK_ARG.load(Ordering::Relaxed)))
        }
    };

    // Safety: PREEMPT is only touched here, and SysTick does not nest.
    let preempt = unsafe { &mut *core::ptr::addr_of_mut!(PREEMPT) };
    if time::preempt_on_tick(preempt, hook_fired, time::quantum()) {
        arch::pend_context_switch();
    }
}

/// The scheduler half of the context switch, called from the PendSV
/// assembly between the save and the restore.
///
/// Asks the policy for the next task; on a non-OK event consults the
/// registered handler, which may demand a retry (it has typically
/// terminated and replaced the offending task). Without a handler,
/// events are accepted silently and the returned task runs anyway.
#[no_mangle]
pub extern "C" fn kernel_pendsv_entry() {
    loop {
        let now = time::tick_count();
        let (next, event) = with_instance(|k| k.next_task(now));
        CURRENT_TCB_PTR.store(next.as_ptr(), Ordering::Relaxed);
        if event != EVENT_OK {
            if let Some(handler) = event_handler() {
                if handler(event) == Decision::Retry {
                    continue;
                }
            }
        }
        break;
    }
}
