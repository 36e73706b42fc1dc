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
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: `set_clock_freq`, `signal_event`, `wait_for_event`,
//! `mmu_barrier`, `halt`, `enable_interrupts_on_return`, `enable_mmu`, and
//! `start_first_task`. `build.rs` sets `cfg(armv7a)` only for real
//! `armv7a-*` targets (see `build-util::expose_arch_profile`); every other
//! target, notably the host triple under `cargo test`, falls through to the
//! `sim` backend.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(not(target_pointer_width = "32"))] {
        compile_error!("non-32-bit targets not supported (even for simulation)");
    } else if #[cfg(armv7a)] {
        #[macro_use]
        pub mod armv7a;
        pub use armv7a::*;
    } else {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    }
}
