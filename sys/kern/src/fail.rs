// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The terminal panic path.
//!
//! Structural invariant violations in the kernel end in `panic!`; this
//! module turns that into a stopped machine on ARM targets: interrupts
//! off, a log line if a klog transport is configured, then an idle loop a
//! debugger can inspect. Host builds use the standard library's panic
//! machinery instead, so tests can `should_panic`.
//!
//! Stack overflow is deliberately *not* detected here: it manifests as a
//! hard fault, which belongs to the platform layer. The kernel's
//! contribution is the debug-build stack fill pattern (see `task`), which
//! makes the overflow visible in a post-mortem dump.

/// True once the panic path has been entered; a debugger checks this one
/// flag to triage a wedged system.
#[cfg(any(armv7m, armv8m))]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(any(armv7m, armv8m))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    cortex_m::interrupt::disable();

    // Safety: interrupts are off and this path never returns, so the
    // write cannot race.
    unsafe {
        core::ptr::addr_of_mut!(KERNEL_HAS_FAILED).write(true);
    }

    klog!("KERNEL PANIC: {}", info);
    let _ = info;

    loop {
        cortex_m::asm::wfi();
    }
}
