// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time and the preemption quantum.
//!
//! The tick counter is a monotonic 32-bit count of SysTick interrupts,
//! nominally 1 ms apart. The *quantum* is a kernel-global word: how many
//! ticks the running task may consume before SysTick pends a context
//! switch. Schedulers rewrite it (through their context callback) when
//! they pick a task that wants a different slice; the sentinel
//! [`QUANTA_INFINITE`] disables preemption entirely for the running task.

use abi::QUANTA_INFINITE;
use core::sync::atomic::{AtomicU32, Ordering};

static TICKS: AtomicU32 = AtomicU32::new(0);
static QUANTA: AtomicU32 = AtomicU32::new(0);
static DEFAULT_QUANTA: AtomicU32 = AtomicU32::new(0);

/// Monotonic tick count, 1 ms resolution. Wraps after ~49.7 days.
pub fn tick_count() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Advances the clock by one tick; called from the SysTick handler only.
pub(crate) fn advance_tick() -> u32 {
    TICKS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

pub fn quantum() -> u32 {
    QUANTA.load(Ordering::Relaxed)
}

pub(crate) fn set_quantum(quanta: u32) {
    QUANTA.store(quanta, Ordering::Relaxed);
}

pub fn default_quantum() -> u32 {
    DEFAULT_QUANTA.load(Ordering::Relaxed)
}

pub(crate) fn set_default_quantum(quanta: u32) {
    DEFAULT_QUANTA.store(quanta, Ordering::Relaxed);
}

/// SysTick-side preemption accounting. Lives in a single static owned by
/// the SysTick handler; factored into a plain struct so the decision logic
/// is testable without hardware.
#[derive(Debug, Default)]
pub struct PreemptState {
    counter: u32,
    cached_quantum: u32,
}

impl PreemptState {
    pub const fn new() -> Self {
        Self {
            counter: 0,
            cached_quantum: 0,
        }
    }
}

/// One tick of preemption accounting. Returns true when a context switch
/// should be pended.
///
/// When a systick hook is registered, its verdict (`hook_fired`) replaces
/// quantum counting entirely: the hook's owner does its own accounting
/// (MLFQ charges the running task per-tick). Otherwise, a change of the
/// kernel quantum restarts the count, and hitting the quantum pends a
/// switch -- unless the quantum is the "infinite" sentinel, which never
/// preempts.
pub fn preempt_on_tick(
    state: &mut PreemptState,
    hook_fired: Option<bool>,
    current_quantum: u32,
) -> bool {
    if let Some(fired) = hook_fired {
        if fired {
            state.counter = 0;
            return true;
        }
        return false;
    }

    if current_quantum != state.cached_quantum {
        state.cached_quantum = current_quantum;
        state.counter = 0;
    }

    state.counter += 1;
    if current_quantum != QUANTA_INFINITE && state.counter >= current_quantum
    {
        state.counter = 0;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_every_quantum_ticks() {
        let mut s = PreemptState::new();
        let mut fired = 0;
        for _ in 0..30 {
            if preempt_on_tick(&mut s, None, 10) {
                fired += 1;
            }
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn quantum_change_restarts_the_count() {
        let mut s = PreemptState::new();
        for _ in 0..9 {
            assert!(!preempt_on_tick(&mut s, None, 10));
        }
        // New quantum right before the old one would have expired: the
        // counter starts over.
        assert!(!preempt_on_tick(&mut s, None, 5));
        for _ in 0..3 {
            assert!(!preempt_on_tick(&mut s, None, 5));
        }
        assert!(preempt_on_tick(&mut s, None, 5));
    }

    #[test]
    fn infinite_quantum_never_preempts() {
        let mut s = PreemptState::new();
        for _ in 0..100_000 {
            assert!(!preempt_on_tick(&mut s, None, QUANTA_INFINITE));
        }
    }

    #[test]
    fn hook_verdict_overrides_counting() {
        let mut s = PreemptState::new();
        // Hook present and quiet: never fires, regardless of quantum.
        for _ in 0..50 {
            assert!(!preempt_on_tick(&mut s, Some(false), 1));
        }
        // Hook demands a switch: fires immediately and resets the count.
        assert!(preempt_on_tick(&mut s, Some(true), 1000));
    }
}
