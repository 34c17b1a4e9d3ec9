// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set `cfg(armv7m)` or `cfg(armv8m)` depending on the value of the
/// `TARGET` environment variable. Non-thumb targets get neither cfg, which
/// leaves the architecture-specific parts of the kernel out of the build so
/// the portable core can be built and tested on the host.
pub fn expose_m_profile() {
    // Tell rustc these cfgs are deliberate so it doesn't warn on them.
    println!("cargo:rustc-check-cfg=cfg(armv7m)");
    println!("cargo:rustc-check-cfg=cfg(armv8m)");

    let target = env::var("TARGET").unwrap();

    if target.starts_with("thumbv7m") || target.starts_with("thumbv7em") {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
    }
}
