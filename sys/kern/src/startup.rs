// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L10: kernel startup.
//!
//! Boot is split across two entry points, per spec §2/§4.10 and §5's core
//! discovery: [`start_kernel`] runs once, on whichever core the HAL
//! designates the boot core, and does every piece of global setup (the
//! raw-page pool, both heaps, the MMU's table pools, the task/slot pools,
//! and the primordial task set); [`start_secondary_core`] runs on every
//! other core once the boot core has published [`CORES_READY`], and only
//! has to bring its own local L1 table and first task online.
//!
//! We currently expect the HAL to provide its own low-level reset handler,
//! which does basic hardware bring-up (clocks, the QA7 core-control block)
//! and then calls one of these two functions -- never both on the same
//! core.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::MappingType;

use crate::heap;
use crate::mmu::{self, L1TableStorage, Mapping};
use crate::rawpage;
use crate::task::{self, OSTask, OSTaskSlot};

/// Set by the boot core once global state is initialized; secondary cores
/// spin on this (via `arch::wait_for_event`) before touching any shared
/// structure.
static CORES_READY: AtomicBool = AtomicBool::new(false);

static mut LOCAL_L1_TABLES: [L1TableStorage; task::MAX_CORES] = {
    const EMPTY: L1TableStorage = L1TableStorage::new();
    [EMPTY; task::MAX_CORES]
};
static mut GLOBAL_L1_TABLE: L1TableStorage = L1TableStorage::new();

static mut PRIVILEGED_HEAP_REGION: MaybeUninit<&'static mut [u8]> = MaybeUninit::uninit();
static mut SHARED_HEAP_REGION: MaybeUninit<&'static mut [u8]> = MaybeUninit::uninit();

/// The main kernel entry point, run exactly once by the boot core.
///
/// `tick_divisor` is a platform-specific way of converting "machine
/// ticks" into "kernel ticks" (spec §5's ≈1 ms `Tick`); the HAL resolves
/// this from whatever clock it has and hands it down rather than the
/// portable core guessing at a frequency.
///
/// # Safety
///
/// Must run exactly once per boot, before any other core calls
/// [`start_secondary_core`], and before interrupts are unmasked.
pub unsafe fn start_kernel(tick_divisor: u32) -> ! {
    klog!("starting: laziness");

    crate::arch::set_clock_freq(tick_divisor);

    rawpage::POOL.init(RAM_BASE_PAGE, RAM_TOTAL_PAGES, 0);

    unsafe {
        mmu::MMU.init(
            &mut *core::ptr::addr_of_mut!(LOCAL_L1_TABLES),
            &mut *core::ptr::addr_of_mut!(GLOBAL_L1_TABLE),
            0,
        );
        crate::arch::init_exception_stacks(0);
        crate::arch::enable_mmu(local_l1_pa(0), 0);
    }

    install_heap(&heap::PRIVILEGED, PRIVILEGED_HEAP_VA, PRIVILEGED_HEAP_PAGES, false);
    install_heap(&heap::SHARED, SHARED_HEAP_VA, SHARED_HEAP_PAGES, true);

    for region in GLOBAL_REGIONS {
        map_global_region(region.0);
    }

    klog!("starting: impatience");
    // The HAL (out of scope per spec §1) is expected to use these handles,
    // together with `kconfig::IRQ_TASK_LOOKUP`, to tell `irq::IRQ_TABLE`
    // how many interrupt sources exist and which board IRQ line maps to
    // which portable source number before unmasking interrupts.
    let _tasks = build_primordial_tasks();

    CORES_READY.store(true, Ordering::Release);
    crate::arch::signal_event();

    klog!("starting: first task");
    enter_first_task(0)
}

/// Per-core entry point for every core other than the boot core.
///
/// # Safety
///
/// Must run exactly once per secondary core, strictly after the boot
/// core has entered [`start_kernel`].
pub unsafe fn start_secondary_core(core: u32, tick_divisor: u32) -> ! {
    while !CORES_READY.load(Ordering::Acquire) {
        crate::arch::wait_for_event();
    }
    crate::arch::set_clock_freq(tick_divisor);
    unsafe {
        mmu::MMU.init(
            &mut *core::ptr::addr_of_mut!(LOCAL_L1_TABLES),
            &mut *core::ptr::addr_of_mut!(GLOBAL_L1_TABLE),
            core,
        );
        crate::arch::init_exception_stacks(core);
        crate::arch::enable_mmu(local_l1_pa(core), core);
    }
    enter_first_task(core)
}

/// Physical address of `core`'s local L1 table, for `crate::arch::enable_mmu`.
/// Identity-mapped like the rest of boot-time kernel state, so this is
/// just the table's link-time address.
fn local_l1_pa(core: u32) -> u32 {
    unsafe { core::ptr::addr_of!(LOCAL_L1_TABLES[core as usize]) as u32 }
}

/// Claims physical pages from the raw pool and maps them at `va`,
/// globally and supervisor-only, as this core's view of one of the two
/// fixed heap regions (spec §4.3).
fn install_heap(heap: &heap::SimpleHeap, va: u32, pages: u32, usr32_access: bool) {
    let base_page = rawpage::POOL
        .claim_contiguous(pages, 0)
        .unwrap_or_else(|| crate::fail::die("no pages for boot heap"));
    mmu::MMU
        .map_memory(
            Mapping {
                base_page,
                pages,
                va,
                mapping_type: MappingType::Rw,
                all_cores: true,
                usr32_access,
                not_shared: false,
            },
            0,
        )
        .unwrap_or_else(|_| crate::fail::die("mapping boot heap"));
    let region =
        unsafe { core::slice::from_raw_parts_mut(va as *mut u8, pages as usize * rawpage::PAGE_SIZE as usize) };
    unsafe { heap.init(region, 0) };
}

fn map_global_region(block: abi::AppMemoryBlock) {
    let mapping_type = decode_mapping(block.mapping);
    mmu::MMU
        .map_memory(
            Mapping {
                base_page: block.pa_page,
                pages: block.pages,
                va: block.va_page,
                mapping_type,
                all_cores: true,
                usr32_access: true,
                not_shared: mapping_type.is_device(),
            },
            0,
        )
        .unwrap_or_else(|_| crate::fail::die("mapping global region"));
}

fn decode_mapping(raw: u8) -> MappingType {
    match raw {
        x if x == MappingType::Rwx as u8 => MappingType::Rwx,
        x if x == MappingType::Rw as u8 => MappingType::Rw,
        x if x == MappingType::Rx as u8 => MappingType::Rx,
        x if x == MappingType::R as u8 => MappingType::R,
        _ => MappingType::Device,
    }
}

/// Allocates one `OSTaskSlot` + `OSTask` per primordial task, installs
/// its owned/shared memory blocks, and injects the ones marked
/// `start_at_boot` onto their assigned core's running list. Returns the
/// resolved task handles in task-index order (matching `TASK_DESCS`) for
/// callers that want to refer back to them, e.g. interrupt routing.
fn build_primordial_tasks() -> [Option<core::ptr::NonNull<OSTask>>; TASK_COUNT] {
    let mut handles = [None; TASK_COUNT];
    for (i, desc) in TASK_DESCS.iter().enumerate() {
        let asid = crate::swi::alloc_asid();
        let slot_index = task::SLOTS
            .alloc(asid, 0)
            .unwrap_or_else(|| crate::fail::die("out of slots at boot"));
        unsafe {
            let slot: &mut OSTaskSlot = &mut *task::SLOTS.get(slot_index);
            for (dst, src) in slot.memory_blocks.iter_mut().zip(MEMORY_BLOCKS[i].iter()) {
                *dst = src.map(task::AppMemoryBlock::from);
            }
        }
        let task = task::TASKS
            .alloc(desc.entry_point, desc.initial_stack, &[], slot_index, 0)
            .unwrap_or_else(|_| crate::fail::die("out of tasks at boot"));
        if i < handles.len() {
            handles[i] = Some(task);
        }
        if desc.start_at_boot {
            task::SCHED.running_list(desc.initial_core).push_back(task);
            unsafe {
                (*task.as_ptr()).membership = task::Membership::Running(desc.initial_core);
            }
        }
    }
    handles
}

/// Drops this core into its first runnable task, or parks on
/// `wait_for_event` if nothing was assigned here yet (a core with no
/// `start_at_boot` task waits for a `SwitchToCore` to bring it one, per
/// spec §5's "no resident idle `OSTask`" design).
fn enter_first_task(core: u32) -> ! {
    loop {
        if let Some(current) = task::SCHED.current(core) {
            crate::arch::start_first_task(core, current)
        }
        if !task::SCHED.reschedule(core) {
            crate::arch::wait_for_event();
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
