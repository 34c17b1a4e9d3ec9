// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side stand-in for the ARM support module.
//!
//! Provides the same names as `arm_m` with just enough behavior for unit
//! and scenario tests: the pend flag is recorded instead of raising an
//! exception, the subtick value is settable, and the launch path panics
//! because there is no hardware to jump into.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static PEND_FLAG: AtomicBool = AtomicBool::new(false);
static SUBTICK: AtomicU32 = AtomicU32::new(0x1234_5678);

/// Records that a context switch was requested. Tests observe and clear
/// this with [`take_pending_switch`].
pub fn pend_context_switch() {
    PEND_FLAG.store(true, Ordering::Relaxed);
}

/// Reads and clears the recorded pend flag.
pub fn take_pending_switch() -> bool {
    PEND_FLAG.swap(false, Ordering::Relaxed)
}

/// No interrupts on the host; the closure just runs.
#[inline(always)]
pub fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    f()
}

pub fn in_interrupt() -> bool {
    false
}

pub fn wait_for_interrupt() {}

/// The "hardware" subtick counter; see [`set_systick_value`].
pub fn systick_value() -> u32 {
    SUBTICK.load(Ordering::Relaxed)
}

/// Lets tests pin the RNG seed source to a known value.
pub fn set_systick_value(value: u32) {
    SUBTICK.store(value, Ordering::Relaxed);
}

/// Fires the SysTick handler by hand -- the host-side stand-in for the
/// hardware timer interrupt. Advances kernel time and runs the normal
/// preemption accounting.
pub fn tick() {
    crate::kernel::systick_entry();
}

#[cfg(feature = "fpu")]
pub fn enable_fpu_hardware() {}

/// # Safety
///
/// Never returns on real hardware; on the host there is no first task to
/// run, so this panics.
pub unsafe fn start_first_task(_tick_divisor: u32) -> ! {
    panic!("start_first_task is only meaningful on ARM targets");
}

pub(crate) fn assert_layout() {}
