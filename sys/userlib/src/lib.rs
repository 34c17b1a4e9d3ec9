// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-side support library.
//!
//! This contains the syscall stubs and re-exports the contents of the
//! `abi` crate that gets shared with the kernel. Tasks that link the
//! kernel directly may call its API functions instead; the stubs exist
//! for code that must cross the supervisor-call boundary -- loaded
//! modules, unprivileged task images, anything that can't or shouldn't
//! reach kernel symbols.
//!
//! The ABI is small: the syscall number goes in `r0`, arguments in
//! `r1..r3`, and `SVC 0` traps into the dispatcher, which writes the
//! result over the saved `r0`.

#![no_std]

pub use abi::*;

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn syscall(code: Syscall, arg0: u32, arg1: u32, arg2: u32) -> u32 {
    let mut result = code as u32;
    // Safety: the SVC immediate traps to the kernel's dispatcher, which
    // preserves everything except the saved r0.
    unsafe {
        core::arch::asm!(
            "svc 0",
            inlateout("r0") result,
            in("r1") arg0,
            in("r2") arg1,
            in("r3") arg2,
        );
    }
    result
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn syscall(_code: Syscall, _arg0: u32, _arg1: u32, _arg2: u32) -> u32 {
    // Host builds keep the symbols so the workspace compiles and tests;
    // nothing here can service a trap.
    unimplemented!("syscalls require an ARM target");
}

/// Gives up the CPU; returns when the scheduler next runs this task.
pub fn sys_yield() {
    let _ = syscall(Syscall::Yield, 0, 0, 0);
}

/// Blocks the calling task for at least `ms` milliseconds.
pub fn sys_sleep(ms: u32) {
    let _ = syscall(Syscall::Sleep, ms, 0, 0);
}

/// Installs a new task with the default configuration. Returns false if
/// the kernel rejected the syscall.
pub fn sys_add_task(entry: TaskEntry, parameter: *mut ()) -> bool {
    syscall(
        Syscall::AddTask,
        entry as usize as u32,
        parameter as usize as u32,
        0,
    ) == 0
}

/// A [`spinsync::YieldPolicy`] that gives up the CPU through the yield
/// syscall -- the right policy for locks contended between tasks, where
/// busy spinning would burn the loser's whole quantum.
pub struct TaskYield;

impl spinsync::YieldPolicy for TaskYield {
    fn yield_now() {
        sys_yield();
    }
}
