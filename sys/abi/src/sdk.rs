// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime API table handed to a loaded module's entry function.
//!
//! Modules are position-independent blobs compiled out-of-tree; they can't
//! link against kernel symbols, so the kernel passes them this table of
//! function pointers instead. Every pointer is nullable -- a host that
//! doesn't provide a service leaves the slot empty, and modules are
//! expected to check. The console writer is exactly the "injected function
//! contract" shape: the kernel core never implements a UART itself.

use crate::TaskEntry;

/// Where the module was placed and how big it is.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct ModuleInfo {
    pub base: usize,
    pub size: usize,
}

/// Heap access.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct MemoryApi {
    pub malloc: Option<unsafe extern "C" fn(usize) -> *mut u8>,
    pub realloc: Option<unsafe extern "C" fn(*mut u8, usize) -> *mut u8>,
    pub free: Option<unsafe extern "C" fn(*mut u8)>,
}

/// Kernel services a module may call from task context.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct KernelApi {
    pub add_task: Option<unsafe extern "C" fn(TaskEntry, *mut ())>,
}

/// Console plumbing, injected by the host application.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct DeviceApi {
    pub uart_read: Option<unsafe extern "C" fn(*mut u8, usize) -> usize>,
    pub uart_write: Option<unsafe extern "C" fn(*const u8, usize)>,
}

/// Operations on the calling task.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct CurrentTaskApi {
    pub sleep: Option<unsafe extern "C" fn(u32)>,
    pub yield_now: Option<unsafe extern "C" fn()>,
}

/// FPU gating, for modules with float-heavy entry points.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct FpuApi {
    pub enable: Option<unsafe extern "C" fn()>,
    pub disable: Option<unsafe extern "C" fn()>,
}

/// The full table. Layout is ABI shared with out-of-tree module builds;
/// extend only by appending.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct ModuleApi {
    pub module: ModuleInfo,
    pub memory: MemoryApi,
    pub kernel: KernelApi,
    pub device: DeviceApi,
    pub this_task: CurrentTaskApi,
    pub fpu: FpuApi,
}

/// Module entry signature: `int module_entry(const struct module_api *)`.
pub type ModuleEntry = unsafe extern "C" fn(*const ModuleApi) -> i32;
