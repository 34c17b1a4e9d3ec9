// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M.
//!
//! Three handlers get linked into the vector table (names are dictated by
//! the `cortex-m` ecosystem):
//!
//! - `SysTick` maintains kernel time and decides when to preempt.
//! - `PendSV` performs the deferred context switch at the lowest exception
//!   priority, so it never interrupts another ISR -- it follows them.
//! - `SVCall` is the syscall gate.
//!
//! The PendSV sequence mirrors the classic Cortex-M pattern: the hardware
//! stacks {xPSR, PC, LR, R12, R3..R0} on the process stack at exception
//! entry; we push R4-R11 (and the upper FPU lane when the task uses it),
//! park the PSP in the outgoing TCB, let the scheduler move
//! `CURRENT_TCB_PTR`, then unwind the same steps from the incoming TCB.
//! The TCB layout contract (stack pointer at offset 0, flags at offset 4)
//! is asserted in `task.rs`.

use core::arch::global_asm;
use core::sync::atomic::Ordering;

use crate::kernel::CURRENT_TCB_PTR;

/// Sets the PendSV bit; the switch happens once every higher-priority
/// handler has finished.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Runs `f` with interrupts masked.
#[inline(always)]
pub fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    cortex_m::interrupt::free(|_| f())
}

/// True when executing in handler mode.
pub fn in_interrupt() -> bool {
    cortex_m::peripheral::SCB::vect_active()
        != cortex_m::peripheral::scb::VectActive::ThreadMode
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Current SysTick down-counter value. Changes every processor cycle,
/// which makes it a serviceable entropy source for the lottery RNG.
pub fn systick_value() -> u32 {
    // Safety: read-only access to a read-only counter register.
    unsafe { (*cortex_m::peripheral::SYST::PTR).cvr.read() }
}

/// Grants full access to CP10/CP11 and turns on lazy FPU state
/// preservation. Must run before any task touches the FPU.
#[cfg(feature = "fpu")]
pub fn enable_fpu_hardware() {
    const CPACR: *mut u32 = 0xE000_ED88 as *mut u32;
    const FPCCR: *mut u32 = 0xE000_EF34 as *mut u32;
    const FPCCR_ASPEN: u32 = 1 << 31;
    const FPCCR_LSPEN: u32 = 1 << 30;
    // Safety: architectural registers, write-only configuration; the
    // barriers order the enable against subsequent FPU instructions.
    unsafe {
        CPACR.write_volatile(CPACR.read_volatile() | (0b1111 << 20));
        FPCCR.write_volatile(
            FPCCR.read_volatile() | FPCCR_ASPEN | FPCCR_LSPEN,
        );
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Programs the timer and exception priorities, then jumps into the first
/// task by popping its synthetic frame.
///
/// `tick_divisor` is CPU cycles per kernel tick (1 ms).
///
/// # Safety
///
/// Call exactly once, from thread mode on the main stack, after
/// `CURRENT_TCB_PTR` points at a primed task.
pub unsafe fn start_first_task(tick_divisor: u32) -> ! {
    {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // PendSV to the lowest configurable priority so the context
        // switch follows every other handler; SysTick above it so ticks
        // keep flowing while a switch is pending.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0x80);
    }

    {
        // SysTick at 1 ms: processor clock, interrupt on, counter on.
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111);
    }

    klog!("launching first task");
    kernel_launch_asm()
}

extern "C" {
    /// Defined in the `global_asm!` block below.
    fn kernel_launch_asm() -> !;
}

// First-task launch: load PSP from the current TCB, switch thread mode to
// the process stack (CONTROL = 2, still privileged), and pop the synthetic
// frame by hand. Popping PC last jumps straight into the task.
global_asm! {"
    .section .text.kernel_launch_asm
    .globl kernel_launch_asm
    .type kernel_launch_asm,function
kernel_launch_asm:
    movw r0, #:lower16:CURRENT_TCB_PTR
    movt r0, #:upper16:CURRENT_TCB_PTR
    ldr r1, [r0]
    ldr r2, [r1]
    msr PSP, r2
    movs r0, #2
    msr CONTROL, r0
    isb
    pop {{r4-r11}}
    pop {{r0-r3}}
    pop {{r12}}
    pop {{lr}}
    pop {{pc}}
"}

/// Handler that gets linked into the vector table for the System Tick
/// Timer. Kernel time and preemption live on the Rust side.
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn SysTick() {
    crate::kernel::systick_entry();
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fpu")] {
        // Context switch with FPU lane management. Bit 0 of the TCB flags
        // word marks a task as FPU-using; bit 1 records whether the upper
        // lane (s16-s31, the caller-saved half is hardware-stacked) is
        // currently parked on its stack. EXC_RETURN selects the matching
        // frame format on the way out.
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
        PendSV:
            cpsid i

            mrs r0, PSP
            movw r1, #:lower16:CURRENT_TCB_PTR
            movt r1, #:upper16:CURRENT_TCB_PTR
            ldr r2, [r1]
            ldr r3, [r2, #4]

            tst r3, #1
            beq 1f
            vstmdb r0!, {{s16-s31}}
            orr r3, r3, #2
            str r3, [r2, #4]
            b 2f
        1:
            bic r3, r3, #2
            str r3, [r2, #4]
        2:
            stmdb r0!, {{r4-r11}}
            str r0, [r2]

            push {{lr}}
            bl kernel_pendsv_entry
            pop {{lr}}

            movw r1, #:lower16:CURRENT_TCB_PTR
            movt r1, #:upper16:CURRENT_TCB_PTR
            ldr r2, [r1]
            ldr r0, [r2]
            ldmia r0!, {{r4-r11}}
            ldr r3, [r2, #4]

            tst r3, #1
            beq 3f
            ldr lr, =0xFFFFFFED
            b 4f
        3:
            ldr lr, =0xFFFFFFFD
        4:
            tst r3, #2
            beq 5f
            vldmia r0!, {{s16-s31}}
        5:
            msr PSP, r0
            cpsie i
            bx lr
        "}
    } else {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
        PendSV:
            cpsid i

            mrs r0, PSP
            stmdb r0!, {{r4-r11}}
            movw r1, #:lower16:CURRENT_TCB_PTR
            movt r1, #:upper16:CURRENT_TCB_PTR
            ldr r2, [r1]
            str r0, [r2]

            push {{lr}}
            bl kernel_pendsv_entry
            pop {{lr}}

            movw r1, #:lower16:CURRENT_TCB_PTR
            movt r1, #:upper16:CURRENT_TCB_PTR
            ldr r2, [r1]
            ldr r0, [r2]
            ldmia r0!, {{r4-r11}}
            msr PSP, r0

            cpsie i
            bx lr
        "}
    }
}

// Syscall gate: pick the frame that was active at the SVC (bit 2 of LR
// distinguishes MSP from PSP) and hand it to the dispatcher. Branching
// rather than calling lets the dispatcher's return be the exception
// return.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
SVCall:
    tst lr, #4
    ite eq
    mrseq r0, msp
    mrsne r0, psp
    b kernel_svcall_entry
"}

/// Used by the launch path to double-check the contract the assembly
/// relies on.
pub(crate) fn assert_layout() {
    let ptr = CURRENT_TCB_PTR.load(Ordering::Relaxed);
    assert!(!ptr.is_null(), "launch before any task was added");
}
