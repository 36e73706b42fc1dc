// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Application configuration passed into the kernel build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Features enabled in the kernel.
    pub features: Vec<String>,

    /// Number of cores the image is built for. Core numbers handed to
    /// `OSTask_SwitchToCore` and named in `irqs`/`TaskConfig::cores` below
    /// must be less than this.
    pub cores: u32,

    /// First physical page, and page count, of the RAM the raw-page pool
    /// (`kern::rawpage::POOL`) manages. Everything outside this range is
    /// either flashed task memory (named by `TaskConfig::owned_regions`)
    /// or device MMIO (named by `extern_regions`), neither of which the
    /// page pool ever hands out.
    pub ram_base_page: u32,
    pub ram_total_pages: u32,

    /// Fixed virtual address and size of the privileged heap
    /// (`kern::heap::PRIVILEGED`), backed by pages claimed from the raw
    /// pool at boot per spec §4.3.
    pub privileged_heap: HeapConfig,
    /// Same, for the user-readable shared heap (`kern::heap::SHARED`).
    pub shared_heap: HeapConfig,

    /// External regions used in the kernel (device MMIO windows, mostly).
    pub extern_regions: BTreeMap<String, std::ops::Range<u32>>,

    /// Primordial tasks in the app image. The order of tasks is
    /// significant: it determines `OSTaskSlot` table index, and therefore
    /// the low bits of every `TaskHandle` derived from it.
    pub tasks: Vec<TaskConfig>,

    /// Regions that tasks have shared access to, keyed by the name the task
    /// config used to grant access (often peripheral name). These are
    /// typically memory-mapped peripherals or a shared heap arena.
    pub shared_regions: BTreeMap<String, RegionConfig>,

    /// Interrupt sources hooked by the application, keyed by IRQ number.
    pub irqs: BTreeMap<u32, InterruptConfig>,

    /// Modules preloaded at boot, in SWI-chunk order. `modules[i]` answers
    /// SWI chunk `i` (see `abi::ModuleSwi`).
    pub modules: Vec<ModuleConfig>,
}

/// Fixed virtual address and page count for one of the kernel's two boot
/// heaps (see `KernelConfig::privileged_heap`/`shared_heap`).
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct HeapConfig {
    pub va: u32,
    pub pages: u32,
}

/// Configuration for a single hooked interrupt.
#[derive(
    Copy,
    Clone,
    Debug,
    Serialize,
    Deserialize,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
)]
pub struct InterruptConfig {
    /// Index of task (in the application task array) woken when this
    /// interrupt fires.
    pub task_index: usize,
    /// Core this interrupt is routed to at boot. A task blocked in
    /// `OSTask_WaitForInterrupt` for this source is woken regardless of
    /// which core it's currently assigned to; this field only affects
    /// which core's vector table enables the line.
    pub routed_core: u32,
}

/// Record describing a single primordial task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Named memory regions that this task has exclusive access to, keyed
    /// by name.
    pub owned_regions: BTreeMap<String, MultiRegionConfig>,

    /// Names of regions (in the app-level `shared_regions`) that this task
    /// needs access to.
    pub shared_regions: BTreeSet<String>,

    /// Address of the task's entry point. This is the first instruction
    /// that will be executed whenever the task is (re)started.
    pub entry_point: OwnedAddress,

    /// Address of the task's initial stack pointer, to be loaded at
    /// (re)start. It must be pointing into or *just past* one of the
    /// task's memory regions.
    pub initial_stack: OwnedAddress,

    /// Core this task starts running on. Tasks may migrate via
    /// `OSTask_SwitchToCore` at runtime; this is only the boot placement.
    pub initial_core: u32,

    /// Should this task be started automatically on boot?
    pub start_at_boot: bool,
}

/// An address within an owned region of memory.
///
/// Certain analyses benefit from being able to tell that an address like a
/// stack pointer points into a particular class of memory region. While we
/// could determine this by e.g. comparing the address to all memory
/// regions, this type explicitly encodes the intended relationship between
/// an address and region, simplifying the analysis.
///
/// Note that an `OwnedAddress` can encode an offset that is out of range
/// for the region. This is an error and should be rejected. As a special
/// case, certain fields (particularly stack pointers) accept an
/// "off the end" address in a region, since the address will not be
/// directly dereferenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnedAddress {
    /// Name of region in the task's `owned_regions` table.
    pub region_name: String,
    /// Offset within the region.
    pub offset: u32,
}

/// Description of one memory region.
///
/// A memory region spans a range of physical addresses, and applies access
/// permissions to whatever lies in that range. Despite our use of the term
/// "memory" here, the region may not describe RAM -- a `Device` region
/// describes a memory-mapped peripheral window instead.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Address of start of region. VMSA section/supersection alignment
    /// rules apply if this region is large enough to be mapped as one.
    pub base: u32,
    /// Size of region, in bytes.
    pub size: u32,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

/// Description of one memory span containing multiple adjacent regions.
///
/// Equivalent to [`RegionConfig`], but represents a single memory span
/// that should be split into several page-table entries, e.g. a run of
/// stack-guard-separated per-task stacks within one owned arena.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiRegionConfig {
    pub base: u32,
    /// Size of region, in bytes, for each chunk.
    pub sizes: Vec<u32>,
    pub attributes: RegionAttributes,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RegionAttributes {
    /// Region can be read by tasks that include it.
    pub read: bool,
    /// Region can be written by tasks that include it.
    pub write: bool,
    /// Region can contain executable code for tasks that include it.
    pub execute: bool,
    /// Special role assigned to this region, if any.
    pub special_role: Option<SpecialRole>,
}

impl RegionAttributes {
    /// Picks the `abi::MappingType` variant name (as a bare identifier,
    /// for `build.rs` to splice into generated source) matching these
    /// flags. A `Device` special role always wins, regardless of the
    /// read/write/execute bits named alongside it.
    pub fn mapping_type_ident(&self) -> &'static str {
        if matches!(self.special_role, Some(SpecialRole::Device)) {
            return "Device";
        }
        match (self.read, self.write, self.execute) {
            (true, true, true) => "Rwx",
            (true, true, false) => "Rw",
            (true, false, true) => "Rx",
            _ => "R",
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum SpecialRole {
    /// Region contains memory-mapped registers: mapped strongly-ordered,
    /// never cached, never used as a `memcpy` source/destination by the
    /// kernel.
    Device,
    /// Region is shared with another core or a DMA engine and must not be
    /// marked as a globally-mapped section even if it would otherwise
    /// qualify, so that the two cores' TLBs can be invalidated
    /// independently.
    Dma,
}

/// A module preloaded at boot and assigned a fixed SWI chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Region (in `shared_regions` or an owned region of the kernel image)
    /// holding the module's ROM image, header included.
    pub image_region: String,
    /// SWI chunk this module answers to; must match the `swi_chunk` field
    /// baked into the module's own `ModuleHeader` at build time.
    pub swi_chunk: u32,
}
