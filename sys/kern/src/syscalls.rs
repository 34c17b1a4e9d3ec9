// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! The `SVCall` handler (in the arch module) selects the stack frame
//! that was active at the `SVC` instruction and branches here with a
//! pointer to it. The frame holds the hardware-stacked registers in
//! ascending order `{r0, r1, r2, r3, r12, lr, pc, xpsr}`; the syscall
//! number arrives in `r0`, arguments in `r1..r3`, and the result is
//! written back over the saved `r0`.

use crate::kernel;
use abi::{Syscall, TaskConfig, TaskEntry};

/// Result written to the saved `r0` for unknown syscall numbers.
const ERR_BAD_SYSCALL: u32 = u32::MAX;

/// Rust side of the SVC gate.
///
/// # Safety
///
/// `frame` must point at a hardware-stacked exception frame, which the
/// `SVCall` assembly guarantees.
#[no_mangle]
pub unsafe extern "C" fn kernel_svcall_entry(frame: *mut u32) {
    let code = frame.read();
    let arg0 = frame.add(1).read();
    let arg1 = frame.add(2).read();

    match Syscall::from_u32(code) {
        Some(Syscall::Yield) => kernel::yield_now(),
        Some(Syscall::Sleep) => kernel::sleep(arg0),
        Some(Syscall::AddTask) => {
            // The entry address arrives as a raw register value; the SVC
            // gate trusts its caller the same way a C ABI call would.
            let entry: TaskEntry =
                core::mem::transmute(arg0 as usize);
            kernel::add_task(
                entry,
                &TaskConfig::new(),
                arg1 as usize as *mut (),
            );
        }
        None => {
            frame.write(ERR_BAD_SYSCALL);
            return;
        }
    }
    frame.write(0);
}
