// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task model: control block, descriptor, and stack object.
//!
//! A [`Tcb`] is the kernel's handle to one task. The context-switch
//! assembly addresses two of its fields by offset -- the saved stack
//! pointer at offset 0 and the flags word at offset 4 -- so the front of
//! the struct is ABI, checked by a compile-time assertion on ARM builds.
//!
//! The stack itself belongs to a [`TaskObject`], which pairs a TCB with an
//! 8-byte aligned word array. On creation the stack is primed with a
//! synthetic exception frame, so the very first restore of a task is
//! indistinguishable from a restore after a real preemption.

use abi::{TaskEntry, TaskFlags, TaskState, TimingInfo};

/// The descriptor embedded in every TCB: what to run, with which
/// argument, and where the task is in its lifecycle.
#[derive(Debug)]
pub struct Descriptor {
    pub entry: Option<TaskEntry>,
    pub parameter: *mut (),
    pub timing: TimingInfo,
    pub state: TaskState,
}

impl Descriptor {
    pub const fn new() -> Self {
        Self {
            entry: None,
            parameter: core::ptr::null_mut(),
            timing: TimingInfo {
                period_ms: 0,
                next_run: 0,
            },
            state: TaskState::None,
        }
    }
}

/// Task control block.
///
/// The `stack` and `flags` fields are read and written by the PendSV
/// assembly; everything else is reached from Rust only. `sched_data` is
/// opaque to the kernel -- each scheduler policy parks its per-task state
/// there, allocated from the policy's own pool.
#[repr(C, align(8))]
pub struct Tcb {
    /// Saved process stack pointer; the top of this task's private stack
    /// after a context save.
    stack: *mut u32,
    /// FPU bookkeeping bits, see [`TaskFlags`].
    pub flags: TaskFlags,
    pub descriptor: Descriptor,
    sched_data: *mut (),
}

// The PendSV handler hard-codes these two offsets.
#[cfg(any(armv7m, armv8m))]
const _: () = {
    assert!(core::mem::offset_of!(Tcb, stack) == 0);
    assert!(core::mem::offset_of!(Tcb, flags) == 4);
};

impl Tcb {
    pub const fn new() -> Self {
        Self {
            stack: core::ptr::null_mut(),
            flags: TaskFlags::empty(),
            descriptor: Descriptor::new(),
            sched_data: core::ptr::null_mut(),
        }
    }

    /// Pushes one word onto the task's (full-descending) stack.
    pub fn push(&mut self, value: u32) {
        // Safety: the owning TaskObject sized the stack and pointed
        // `stack` at its top; priming pushes far fewer words than the
        // enforced minimum stack size.
        unsafe {
            self.stack = self.stack.sub(1);
            self.stack.write_volatile(value);
        }
    }

    pub fn stack_pointer(&self) -> *mut u32 {
        self.stack
    }

    pub fn set_sched_data(&mut self, data: *mut ()) {
        self.sched_data = data;
    }

    /// The policy-owned per-task state, as stashed by `configure_task`.
    pub fn sched_data<T>(&self) -> *mut T {
        self.sched_data as *mut T
    }
}

// Safety: TCBs are shared between task context and handlers, serialized
// by the single-core execution model (IRQ critical sections and PendSV).
unsafe impl Sync for Tcb {}
unsafe impl Send for Tcb {}

/// Smallest stack we accept, in words: one full context frame (16 words,
/// or 16 + 18 with the FPU lane) plus working headroom.
pub const MIN_STACK_WORDS: usize = 64;

/// xPSR for a fresh task: only the Thumb bit, required on M-profile.
const INITIAL_XPSR: u32 = 1 << 24;

/// EXC_RETURN for "thread mode, process stack, no FPU frame". Planted in
/// the synthetic frame's LR slot; a task entry returning through it would
/// fault, which is the desired loud failure.
const INITIAL_LR: u32 = 0xFFFF_FFFD;

/// A TCB plus the stack it runs on. `STACK_WORDS` is in 32-bit words.
#[repr(C, align(8))]
pub struct TaskObject<const STACK_WORDS: usize> {
    pub tcb: Tcb,
    stack: [u32; STACK_WORDS],
}

/// Pattern the stack is filled with in debug builds, so a post-mortem dump
/// shows how deep the task ever got.
pub const STACK_FILL: u32 = 0xDEAD_BEEF;

impl<const STACK_WORDS: usize> TaskObject<STACK_WORDS> {
    const _MIN: () = assert!(STACK_WORDS >= MIN_STACK_WORDS);

    /// A fresh object with a null stack pointer. Call [`reset_stack`]
    /// after the object has reached its final memory location -- the TCB
    /// points into the embedded array, so priming a temporary would leave
    /// a dangling pointer behind.
    ///
    /// [`reset_stack`]: TaskObject::reset_stack
    pub const fn new() -> Self {
        // Evaluating the assertion here makes undersized stacks a compile
        // error instead of a dead constant.
        let _ = Self::_MIN;
        Self {
            tcb: Tcb::new(),
            stack: [0; STACK_WORDS],
        }
    }

    /// Points the TCB at the top of the embedded stack and, in debug
    /// builds, paints the stack with [`STACK_FILL`].
    pub fn reset_stack(&mut self) {
        if cfg!(debug_assertions) {
            for word in self.stack.iter_mut() {
                *word = STACK_FILL;
            }
        }
        // Safety: one-past-the-end is a valid pointer; this is a full
        // descending stack, so the top address itself is never written.
        self.tcb.stack = unsafe { self.stack.as_mut_ptr().add(STACK_WORDS) };
    }

    /// Primes the stack with a synthetic exception frame returning into
    /// `entry_address`, then the callee-saved registers the switch code
    /// pops by hand. The register pattern values make a raw stack dump
    /// self-describing.
    pub fn prime_stack(&mut self, entry_address: u32) {
        let tcb = &mut self.tcb;

        // Hardware-stacked frame, top down.
        tcb.push(INITIAL_XPSR);
        tcb.push(entry_address);
        tcb.push(INITIAL_LR);
        tcb.push(0x1212_1212); // R12
        tcb.push(0x0303_0303); // R3
        tcb.push(0x0202_0202); // R2
        tcb.push(0x0101_0101); // R1
        tcb.push(0x0000_0000); // R0

        // Callee-saved registers, saved and restored by the switch code.
        tcb.push(0x1111_1111); // R11
        tcb.push(0x1010_1010); // R10
        tcb.push(0x0909_0909); // R9
        tcb.push(0x0808_0808); // R8
        tcb.push(0x0707_0707); // R7
        tcb.push(0x0606_0606); // R6
        tcb.push(0x0505_0505); // R5
        tcb.push(0x0404_0404); // R4
    }
}

impl<const STACK_WORDS: usize> Default for TaskObject<STACK_WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_frame_layout() {
        let mut obj = TaskObject::<64>::new();
        obj.reset_stack();
        obj.prime_stack(0x0800_1234);

        let sp = obj.tcb.stack_pointer();
        let top = unsafe { obj.stack.as_ptr().add(64) };
        // 8 hardware-stacked words plus 8 callee-saved words.
        assert_eq!(unsafe { top.offset_from(sp) }, 16);

        let words: Vec<u32> =
            (0..16).map(|i| unsafe { *sp.add(i) }).collect();
        // Ascending memory order: R4..R11, R0..R3, R12, LR, PC, xPSR.
        assert_eq!(words[0], 0x0404_0404);
        assert_eq!(words[7], 0x1111_1111);
        assert_eq!(words[8], 0x0000_0000);
        assert_eq!(words[12], 0x1212_1212);
        assert_eq!(words[13], INITIAL_LR);
        assert_eq!(words[14], 0x0800_1234);
        assert_eq!(words[15], INITIAL_XPSR);
    }

    #[test]
    fn debug_builds_paint_the_stack() {
        let mut obj = TaskObject::<64>::new();
        obj.reset_stack();
        if cfg!(debug_assertions) {
            assert!(obj.stack.iter().all(|&w| w == STACK_FILL));
        }
    }

    #[test]
    fn tcb_alignment() {
        assert_eq!(core::mem::align_of::<Tcb>(), 8);
        assert_eq!(core::mem::align_of::<TaskObject<64>>(), 8);
        // The TCB sits at the front of its object, which is what lets the
        // kernel recover the object pointer from a TCB pointer.
        assert_eq!(core::mem::offset_of!(TaskObject<64>, tcb), 0);
    }
}
