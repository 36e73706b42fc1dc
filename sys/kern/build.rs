// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use build_kconfig::KernelConfig;

const PAGE_SIZE: u32 = 4096;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    build_util::expose_arch_profile();

    generate_statics()?;

    Ok(())
}

fn generate_statics() -> Result<(), Box<dyn std::error::Error>> {
    let kconfig: KernelConfig = build_util::config()?;

    let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
    let mut file = File::create(out.join("kconfig.rs")).unwrap();

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const CORE_COUNT: usize = {};", kconfig.cores)?;
    writeln!(
        file,
        "pub const TASK_COUNT: usize = {};",
        kconfig.tasks.len()
    )?;

    writeln!(file, "pub const RAM_BASE_PAGE: u32 = {:#x};", kconfig.ram_base_page)?;
    writeln!(file, "pub const RAM_TOTAL_PAGES: u32 = {:#x};", kconfig.ram_total_pages)?;
    writeln!(file, "pub const PRIVILEGED_HEAP_VA: u32 = {:#010x};", kconfig.privileged_heap.va)?;
    writeln!(file, "pub const PRIVILEGED_HEAP_PAGES: u32 = {:#x};", kconfig.privileged_heap.pages)?;
    writeln!(file, "pub const SHARED_HEAP_VA: u32 = {:#010x};", kconfig.shared_heap.va)?;
    writeln!(file, "pub const SHARED_HEAP_PAGES: u32 = {:#x};", kconfig.shared_heap.pages)?;

    writeln!(
        file,
        "static TASK_DESCS: [crate::app::TaskDesc; TASK_COUNT] = ["
    )?;
    for task in &kconfig.tasks {
        let entry = resolve(&kconfig, &task.entry_point)?;
        let sp = resolve(&kconfig, &task.initial_stack)?;
        writeln!(file, "    crate::app::TaskDesc {{")?;
        writeln!(file, "        entry_point: {:#010x},", entry)?;
        writeln!(file, "        initial_stack: {:#010x},", sp)?;
        writeln!(file, "        initial_core: {},", task.initial_core)?;
        writeln!(file, "        start_at_boot: {},", task.start_at_boot)?;
        writeln!(file, "    }},")?;
    }
    writeln!(file, "];")?;

    writeln!(
        file,
        "static mut TASK_TABLE_SPACE: \
        core::mem::MaybeUninit<[crate::task::OSTask; TASK_COUNT]> = \
        core::mem::MaybeUninit::uninit();",
    )?;

    // Per-task memory-block tables. Owned regions (identity-mapped: an
    // embedded image's task memory lives at a fixed physical address, so
    // this port uses that same address as the task's view per
    // DESIGN.md) contribute one block per `MultiRegionConfig` chunk;
    // named `shared_regions` each contribute one block pointing at the
    // app-wide `shared_regions` table entry of the same name.
    writeln!(
        file,
        "pub static MEMORY_BLOCKS: [[Option<abi::AppMemoryBlock>; abi::MAX_MEMORY_BLOCKS]; TASK_COUNT] = ["
    )?;
    for task in &kconfig.tasks {
        let mut blocks = Vec::new();
        for region in task.owned_regions.values() {
            let mut base = region.base;
            for &size in &region.sizes {
                blocks.push(region_block(base, size, &region.attributes)?);
                base += size;
            }
        }
        for name in &task.shared_regions {
            let region = kconfig.shared_regions.get(name).ok_or_else(|| {
                format!("task names unknown shared region {name:?}")
            })?;
            blocks.push(region_block(region.base, region.size, &region.attributes)?);
        }
        if blocks.len() > abi::MAX_MEMORY_BLOCKS {
            return Err(format!(
                "task has {} memory blocks, more than abi::MAX_MEMORY_BLOCKS",
                blocks.len()
            )
            .into());
        }
        write!(file, "    [")?;
        for b in &blocks {
            write!(file, "Some({b}), ")?;
        }
        for _ in blocks.len()..abi::MAX_MEMORY_BLOCKS {
            write!(file, "None, ")?;
        }
        writeln!(file, "],")?;
    }
    writeln!(file, "];")?;

    // Regions mapped once at boot, globally (every core, per spec §4.2),
    // before any task runs: device MMIO windows and RAM shared between
    // more than one task that isn't already covered by a per-task block
    // above. Built from every `shared_regions` entry; a task that also
    // names one in its own `shared_regions` set gets the identical
    // mapping reinstalled into its slot's block table above, which is
    // harmless -- `mmu::map_memory` on an already-mapped global entry is
    // idempotent.
    writeln!(
        file,
        "pub static GLOBAL_REGIONS: &[crate::app::GlobalRegion] = &["
    )?;
    for region in kconfig.shared_regions.values() {
        let block = region_block(region.base, region.size, &region.attributes)?;
        writeln!(file, "    crate::app::GlobalRegion({block}),")?;
    }
    writeln!(file, "];")?;

    // Build a perfect hash from IRQ number to (task index, routed core), so
    // the default interrupt handler can look up the owning task in O(1).
    let irq_entries: Vec<(u32, (usize, u32))> = kconfig
        .irqs
        .iter()
        .map(|(irq, cfg)| (*irq, (cfg.task_index, cfg.routed_core)))
        .collect();

    if irq_entries.is_empty() {
        writeln!(
            file,
            "pub const IRQ_TASK_LOOKUP: phash::PerfectHash<'static, u32, (u32, usize, u32)> = \
            phash::PerfectHash {{ m: 0, values: &[] }};"
        )?;
    } else {
        let table = phash_gen::OwnedPerfectHashMap::build(irq_entries, |rng| {
            use rand::Rng;
            rng.random()
        })
        .map_err(|e| format!("building IRQ perfect hash: {e}"))?;

        let values = table
            .values
            .iter()
            .map(|slot| match slot {
                Some((irq, (task_index, core))) => {
                    format!("({}, {}, {})", irq, task_index, core)
                }
                None => "(u32::MAX, usize::MAX, u32::MAX)".to_string(),
            })
            .collect::<Vec<_>>()
            .join(",\n        ");

        writeln!(
            file,
            "pub const IRQ_TASK_LOOKUP: phash::PerfectHash<'static, u32, (u32, usize, u32)> = \
            phash::PerfectHash {{\n    m: {:#x},\n    values: &[\n        {}\n    ],\n}};",
            table.m, values
        )?;
    }

    Ok(())
}

/// Formats one `abi::AppMemoryBlock` literal, identity-mapping `base` (a
/// physical address, per the embedded image's fixed task layout) as both
/// the task's virtual and physical view. See DESIGN.md for why this port
/// resolves owned/shared region addresses this way.
fn region_block(
    base: u32,
    size: u32,
    attributes: &build_kconfig::RegionAttributes,
) -> Result<String, Box<dyn std::error::Error>> {
    if base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(format!(
            "region at {base:#x} size {size:#x} isn't page-aligned"
        )
        .into());
    }
    let pages = size / PAGE_SIZE;
    let mapping = attributes.mapping_type_ident();
    Ok(format!(
        "abi::AppMemoryBlock {{ va_page: {:#x}, pa_page: {:#x}, pages: {:#x}, \
         mapping: abi::MappingType::{} as u8, _pad: [0; 3] }}",
        base / PAGE_SIZE,
        base / PAGE_SIZE,
        pages,
        mapping,
    ))
}

/// Resolves an `OwnedAddress` (a named owned region plus an offset) to an
/// absolute address. Owned regions are looked up across every task's
/// `owned_regions` map, since an `entry_point`/`initial_stack` always
/// belongs to the task that names it.
fn resolve(
    kconfig: &KernelConfig,
    addr: &build_kconfig::OwnedAddress,
) -> Result<u32, Box<dyn std::error::Error>> {
    for task in &kconfig.tasks {
        if let Some(region) = task.owned_regions.get(&addr.region_name) {
            return Ok(region.base + addr.offset);
        }
    }
    Err(format!("no owned region named {}", addr.region_name).into())
}
