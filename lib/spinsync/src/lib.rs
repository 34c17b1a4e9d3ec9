// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spin-based synchronization primitives.
//!
//! These are for task-context code on a single core: contention is resolved
//! by spinning, optionally yielding to the scheduler between attempts via a
//! [`YieldPolicy`]. Nothing here masks interrupts; kernel-internal state is
//! protected by IRQ critical sections instead, which live in the kernel's
//! arch layer.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// What a spinning waiter does between attempts.
pub trait YieldPolicy {
    fn yield_now();
}

/// Busy spin. The right choice inside short critical sections and in
/// interrupt-free contexts.
pub struct NoYield;

impl YieldPolicy for NoYield {
    #[inline(always)]
    fn yield_now() {}
}

/// A test-and-set spin lock guarding a `T`.
///
/// `lock` acquires with acquire ordering and returns a guard; dropping the
/// guard releases with release ordering, so writes made under the lock are
/// visible to the next holder.
pub struct SpinLock<T, Y: YieldPolicy = NoYield> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
    _marker: core::marker::PhantomData<Y>,
}

// Safety: the lock serializes all access to the inner value.
unsafe impl<T: Send, Y: YieldPolicy> Sync for SpinLock<T, Y> {}
unsafe impl<T: Send, Y: YieldPolicy> Send for SpinLock<T, Y> {}

impl<T, Y: YieldPolicy> SpinLock<T, Y> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
            _marker: core::marker::PhantomData,
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T, Y> {
        while self.locked.swap(true, Ordering::Acquire) {
            Y::yield_now();
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, Y>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }
}

pub struct SpinLockGuard<'a, T, Y: YieldPolicy> {
    lock: &'a SpinLock<T, Y>,
}

impl<T, Y: YieldPolicy> Drop for SpinLockGuard<'_, T, Y> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T, Y: YieldPolicy> core::ops::Deref for SpinLockGuard<'_, T, Y> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, Y: YieldPolicy> core::ops::DerefMut for SpinLockGuard<'_, T, Y> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means holding the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

/// One node of the condition variable's waiter list. Lives on the waiting
/// task's stack for the duration of the wait.
struct Waiter {
    notified: AtomicBool,
    next: *mut Waiter,
}

/// A condition variable built on a lock-free LIFO stack of waiters.
///
/// `wait` pushes a stack-allocated node with a CAS loop, releases the
/// caller's lock, spins on the node's `notified` flag, then reacquires.
/// `notify_one` pops the most recent waiter; `notify_all` detaches the whole
/// list and wakes every node on it. Acquire/release pairs on the list head
/// and the flags make a waiter's prior writes visible to its notifier and
/// vice versa.
pub struct SpinCondVar<Y: YieldPolicy = NoYield> {
    waiters: AtomicPtr<Waiter>,
    _marker: core::marker::PhantomData<Y>,
}

// Safety: all shared state is managed through atomics.
unsafe impl<Y: YieldPolicy> Sync for SpinCondVar<Y> {}
unsafe impl<Y: YieldPolicy> Send for SpinCondVar<Y> {}

impl<Y: YieldPolicy> SpinCondVar<Y> {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicPtr::new(core::ptr::null_mut()),
            _marker: core::marker::PhantomData,
        }
    }

    /// Atomically enqueues the caller and releases `guard`, then blocks
    /// until notified and reacquires the lock.
    pub fn wait<'a, T, LY: YieldPolicy>(
        &self,
        guard: SpinLockGuard<'a, T, LY>,
    ) -> SpinLockGuard<'a, T, LY> {
        let mut node = Waiter {
            notified: AtomicBool::new(false),
            next: core::ptr::null_mut(),
        };

        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            node.next = head;
            match self.waiters.compare_exchange_weak(
                head,
                &mut node,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let lock = guard.lock;
        drop(guard);

        while !node.notified.load(Ordering::Acquire) {
            Y::yield_now();
        }

        lock.lock()
    }

    /// Wakes the most recently enqueued waiter, if any.
    pub fn notify_one(&self) {
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return;
            }
            // Safety: a non-null head points at a Waiter that stays alive
            // until its `notified` flag is set, and only we may set it once
            // the CAS below removes it from the list.
            let next = unsafe { (*head).next };
            match self.waiters.compare_exchange_weak(
                head,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    unsafe {
                        (*head).notified.store(true, Ordering::Release);
                    }
                    return;
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Wakes every waiter currently enqueued.
    pub fn notify_all(&self) {
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return;
            }
            match self.waiters.compare_exchange_weak(
                head,
                core::ptr::null_mut(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        while !head.is_null() {
            // Safety: each node stays alive until its flag is set; we read
            // `next` before setting the flag because the store frees the
            // waiter to unwind its stack frame.
            unsafe {
                let next = (*head).next;
                (*head).notified.store(true, Ordering::Release);
                head = next;
            }
        }
    }
}

impl<Y: YieldPolicy> Default for SpinCondVar<Y> {
    fn default() -> Self {
        Self::new()
    }
}
