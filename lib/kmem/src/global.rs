// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide allocator singleton.
//!
//! The application bootstraps exactly one [`RawAllocator`] over its heap
//! region and installs it here; the C-shaped entry points and the
//! [`KernelHeap`] `GlobalAlloc` forward to it. Every entry point runs
//! inside an IRQ critical section on ARM, because tasks and interrupt
//! handlers share the heap.

use crate::{RawAllocator, ALIGN};
use core::alloc::{GlobalAlloc, Layout};

/// The installed allocator. Written once by [`set_allocator`]; read at
/// every allocation entry point, always inside the critical section.
static mut CURRENT: Option<&'static mut dyn RawAllocator> = None;

/// Runs `f` with interrupts masked. On non-ARM (test) builds interrupts
/// are not a thing and `f` just runs.
#[inline(always)]
fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    {
        cortex_m::interrupt::free(|_| f())
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        f()
    }
}

/// Installs `allocator` as the process-wide heap. Panics on a second call;
/// swapping allocators under live allocations has no sound meaning.
pub fn set_allocator(allocator: &'static mut dyn RawAllocator) {
    interrupt_free(|| {
        // Safety: guarded by the critical section, and the singleton is
        // only ever written here.
        let slot = unsafe { &mut *core::ptr::addr_of_mut!(CURRENT) };
        if slot.is_some() {
            panic!("allocator already installed");
        }
        *slot = Some(allocator);
    })
}

fn with_allocator<R>(f: impl FnOnce(&mut dyn RawAllocator) -> R) -> R {
    interrupt_free(|| {
        // Safety: guarded by the critical section; `set_allocator` is the
        // only writer.
        let slot = unsafe { &mut *core::ptr::addr_of_mut!(CURRENT) };
        match slot {
            Some(a) => f(&mut **a),
            None => panic!("allocator not installed"),
        }
    })
}

/// True once [`set_allocator`] has run.
pub fn is_installed() -> bool {
    interrupt_free(|| {
        // Safety: read under the critical section.
        unsafe { (*core::ptr::addr_of!(CURRENT)).is_some() }
    })
}

pub fn alloc(size: usize) -> *mut u8 {
    with_allocator(|a| a.alloc(size))
}

/// Allocates and zeroes, in the shape of `calloc`.
pub fn alloc_zeroed(size: usize) -> *mut u8 {
    with_allocator(|a| {
        let ptr = a.alloc(size);
        if !ptr.is_null() {
            // Safety: a non-null result covers `size` writable bytes.
            unsafe { core::ptr::write_bytes(ptr, 0, size) };
        }
        ptr
    })
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this module's `alloc`
/// family.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    with_allocator(|a| a.realloc(ptr, size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this module's `alloc`
/// family, not freed since.
pub unsafe fn free(ptr: *mut u8) {
    with_allocator(|a| a.free(ptr))
}

/// Managed byte count of the installed allocator.
pub fn total() -> usize {
    with_allocator(|a| a.total())
}

/// C-ABI allocation entry points, for foreign code that can't link the
/// Rust API -- loaded modules reach these through the runtime API table.
/// Bare-metal only: on hosted targets these names belong to libc.
#[cfg(target_os = "none")]
mod c_api {
    #[no_mangle]
    unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
        super::alloc(size)
    }

    #[no_mangle]
    unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut u8 {
        match count.checked_mul(size) {
            Some(total) => super::alloc_zeroed(total),
            None => core::ptr::null_mut(),
        }
    }

    #[no_mangle]
    unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
        super::realloc(ptr, size)
    }

    #[no_mangle]
    unsafe extern "C" fn free(ptr: *mut u8) {
        super::free(ptr)
    }
}

/// `GlobalAlloc` front for the installed allocator, so an application can
/// write `#[global_allocator] static HEAP: kmem::global::KernelHeap =
/// kmem::global::KernelHeap;` and use `alloc::boxed::Box` and friends.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        crate::global::alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr)
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: Layout,
        new_size: usize,
    ) -> *mut u8 {
        if layout.align() > ALIGN {
            return core::ptr::null_mut();
        }
        crate::global::realloc(ptr, new_size)
    }
}
