// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application description and startup.
//!
//! An "application" here is the primordial task set and configuration that
//! customizes the generic kernel. Most of the interesting types in this
//! module are sourced from the `abi` crate, where they can be shared with
//! task code; this module adds the statically-generated table type that
//! `kern::startup` walks at boot.

// Re-export ABI types.
pub use abi::*;

/// Record describing a single primordial task, as emitted by `build.rs`
/// into `kconfig.rs` from the application's TOML manifest.
///
/// Unlike a task's runtime `OSTaskSlot`, this carries no memory-block
/// table: a primordial task's initial mapping is established from the
/// `owned_regions`/`shared_regions` the manifest names, which `startup`
/// resolves into `AppMemoryBlock`s when it builds the task's first slot.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// Address of the task's entry point. This is the first instruction
    /// that will be executed whenever the task is (re)started.
    pub entry_point: u32,
    /// Address of the task's initial stack pointer, to be loaded at
    /// (re)start.
    pub initial_stack: u32,
    /// Core this task starts running on.
    pub initial_core: u32,
    /// Should this task be started automatically on boot?
    pub start_at_boot: bool,
}

/// One entry of `kconfig::GLOBAL_REGIONS`: a region `crate::startup` maps
/// globally (every core, before any task runs) rather than installing
/// into a single slot's memory-block table. Newtype instead of a bare
/// `abi::AppMemoryBlock` so `startup` can't accidentally treat a global
/// region as a per-task one.
#[derive(Copy, Clone, Debug)]
pub struct GlobalRegion(pub abi::AppMemoryBlock);
