// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, tailored for the current target. Each support
//! module defines the same set of names: pending the context switch,
//! masking interrupts, the SysTick subtick value, interrupt-context
//! detection, WFI, and the first-task launch sequence. On ARM the module
//! additionally owns the `SysTick`/`PendSV`/`SVCall` vector entries.

cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
