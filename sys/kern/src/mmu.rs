// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L1: the VMSAv6 short-descriptor MMU driver.
//!
//! Each core owns a *local* first-level table (16 KiB, 4096 entries); there
//! is also one *global* first-level table shared by every core. A global
//! mapping is written into both; a local (non-global, ASID-tagged) mapping
//! goes only into the calling core's own table. Second-level (coarse page)
//! tables are 1 KiB / 256 entries and come from a shared pool gated by
//! [`crate::spinlock::KernelLock`], per spec §4.2.
//!
//! Invalid first-level and second-level entries store a fault-handler
//! function pointer in their upper bits (the `00` type-bit encoding leaves
//! the rest free, and ARM code addresses are naturally 4-byte aligned, so
//! the low two bits of a function pointer are already zero). The default
//! handler installed when an L2 table is carved out of a global-backed
//! entry is [`check_global_table`], which lazily mirrors a global mapping
//! into the faulting core's local tree.

use abi::{MappingFlags, MappingType, UsageError};

use crate::spinlock::KernelLock;

pub const PAGE_SIZE: u32 = 4096;
pub const PAGES_PER_SECTION: u32 = 256;
pub const PAGES_PER_SUPERSECTION: u32 = 256 * 16;
pub const L1_ENTRY_COUNT: usize = 4096;
pub const L2_ENTRY_COUNT: usize = 256;

/// Number of second-level tables carved out of the shared pool. Sized for
/// a teaching kernel's handful of primordial tasks plus a few dynamically
/// spawned slots and pipe mappings.
pub const MAX_L2_TABLES: usize = 128;

mod l1bits {
    pub const TYPE_MASK: u32 = 0b11;
    pub const TYPE_FAULT: u32 = 0b00;
    pub const TYPE_TABLE: u32 = 0b01;
    pub const TYPE_SECTION: u32 = 0b10;
    pub const SUPERSECTION_BIT: u32 = 1 << 18;
    pub const NG_BIT: u32 = 1 << 17;
    pub const SHARED_BIT: u32 = 1 << 16;
    pub const AP2_BIT: u32 = 1 << 15;
    pub const TEX_SHIFT: u32 = 12;
    pub const AP_SHIFT: u32 = 10;
    pub const DOMAIN_SHIFT: u32 = 5;
    pub const XN_BIT: u32 = 1 << 4;
    pub const C_BIT: u32 = 1 << 3;
    pub const B_BIT: u32 = 1 << 2;
    pub const SECTION_BASE_MASK: u32 = 0xFFF0_0000;
    pub const SUPERSECTION_BASE_MASK: u32 = 0xFF00_0000;
    pub const TABLE_BASE_MASK: u32 = 0xFFFF_FC00;
}

mod l2bits {
    pub const XN_BIT: u32 = 1 << 0;
    pub const SMALL_PAGE_BIT: u32 = 1 << 1;
    pub const B_BIT: u32 = 1 << 2;
    pub const C_BIT: u32 = 1 << 3;
    pub const AP_SHIFT: u32 = 4;
    pub const TEX_SHIFT: u32 = 6;
    pub const AP2_BIT: u32 = 1 << 9;
    pub const S_BIT: u32 = 1 << 10;
    pub const NG_BIT: u32 = 1 << 11;
    pub const BASE_MASK: u32 = 0xFFFF_F000;
}

/// Why a data/prefetch abort was taken. Only `Translation` levels 1 and 2
/// are handled here; anything else is escalated per spec §4.2.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultKind {
    TranslationLevel1,
    TranslationLevel2,
    Other,
}

/// A fault handler stored in an invalid entry's vacant bits.
pub type FaultHandler = fn(va: u32, kind: FaultKind, core: u32) -> bool;

#[derive(Copy, Clone)]
struct L1Entry(u32);

impl L1Entry {
    const fn fault(handler: FaultHandler) -> Self {
        // Function pointers are 4-byte aligned in ARM state, so the low
        // two bits -- which double as the fault/invalid type tag -- are
        // already clear.
        L1Entry(handler as usize as u32)
    }

    fn is_fault(self) -> bool {
        self.0 & l1bits::TYPE_MASK == l1bits::TYPE_FAULT
    }

    fn is_table(self) -> bool {
        self.0 & l1bits::TYPE_MASK == l1bits::TYPE_TABLE
    }

    fn is_section(self) -> bool {
        self.0 & l1bits::TYPE_MASK == l1bits::TYPE_SECTION
    }

    fn is_supersection(self) -> bool {
        self.is_section() && self.0 & l1bits::SUPERSECTION_BIT != 0
    }

    fn fault_handler(self) -> FaultHandler {
        debug_assert!(self.is_fault());
        let addr = self.0 & !l1bits::TYPE_MASK;
        unsafe { core::mem::transmute::<usize, FaultHandler>(addr as usize) }
    }

    fn table_base(self) -> u32 {
        debug_assert!(self.is_table());
        self.0 & l1bits::TABLE_BASE_MASK
    }

    fn section_base(self) -> u32 {
        if self.is_supersection() {
            self.0 & l1bits::SUPERSECTION_BASE_MASK
        } else {
            self.0 & l1bits::SECTION_BASE_MASK
        }
    }

    /// Recovers the [`MappingType`] and `usr32_access` bit a mapped section
    /// entry was built from, inverting [`access_permissions`] and the
    /// device/TEX/C/B encoding in [`L1Entry::new_section`]. Used by
    /// `walk_global_tree` so a fault that mirrors a global section into a
    /// local tree (`check_global_table`) carries over the real attributes
    /// instead of guessing at them.
    fn mapping_type_and_access(self) -> (MappingType, bool) {
        debug_assert!(self.is_section());
        decode_access(
            self.0 & l1bits::AP2_BIT != 0,
            (self.0 >> l1bits::AP_SHIFT) & 0b11,
            self.0 & l1bits::XN_BIT != 0,
            (self.0 >> l1bits::TEX_SHIFT) & 0b111,
            self.0 & l1bits::C_BIT != 0,
            self.0 & l1bits::B_BIT != 0,
        )
    }

    /// Rebuilds the small-page entry for page `index` within this (mapped,
    /// non-super) section, carrying over its access permissions, memory
    /// type, and executability. Used when a section is split into an L2
    /// table so existing pages don't lose their mapping.
    fn section_to_page(self, index: u32) -> L2Entry {
        debug_assert!(self.is_section() && !self.is_supersection());
        let ap2 = self.0 & l1bits::AP2_BIT != 0;
        let ap = (self.0 >> l1bits::AP_SHIFT) & 0b11;
        let tex = (self.0 >> l1bits::TEX_SHIFT) & 0b111;
        let c = self.0 & l1bits::C_BIT != 0;
        let b = self.0 & l1bits::B_BIT != 0;
        let xn = self.0 & l1bits::XN_BIT != 0;
        let ng = self.0 & l1bits::NG_BIT != 0;

        let mut bits =
            (self.section_base() + index * PAGE_SIZE) & l2bits::BASE_MASK;
        bits |= l2bits::SMALL_PAGE_BIT;
        bits |= l2bits::S_BIT;
        if ng {
            bits |= l2bits::NG_BIT;
        }
        if ap2 {
            bits |= l2bits::AP2_BIT;
        }
        bits |= ap << l2bits::AP_SHIFT;
        bits |= tex << l2bits::TEX_SHIFT;
        if c {
            bits |= l2bits::C_BIT;
        }
        if b {
            bits |= l2bits::B_BIT;
        }
        if xn {
            bits |= l2bits::XN_BIT;
        }
        L2Entry(bits)
    }

    fn new_table(table_base: u32, domain: u32, global: bool) -> Self {
        let mut bits = table_base & l1bits::TABLE_BASE_MASK;
        bits |= l1bits::TYPE_TABLE;
        bits |= (domain & 0xF) << l1bits::DOMAIN_SHIFT;
        if !global {
            bits |= l1bits::NG_BIT;
        }
        L1Entry(bits)
    }

    fn new_section(
        base_page: u32,
        super_section: bool,
        flags: MappingFlags,
        device: bool,
        global: bool,
        usr32_access: bool,
    ) -> Self {
        let base = base_page * PAGE_SIZE;
        let mut bits = if super_section {
            (base & l1bits::SUPERSECTION_BASE_MASK) | l1bits::SUPERSECTION_BIT
        } else {
            base & l1bits::SECTION_BASE_MASK
        };
        bits |= l1bits::TYPE_SECTION;
        bits |= l1bits::SHARED_BIT;
        if !global {
            bits |= l1bits::NG_BIT;
        }
        let (ap2, ap) = access_permissions(flags, usr32_access);
        if ap2 {
            bits |= l1bits::AP2_BIT;
        }
        bits |= (ap as u32) << l1bits::AP_SHIFT;
        if device {
            // Strongly-ordered device memory: TEX=0, C=0, B=0.
        } else {
            bits |= 0b001 << l1bits::TEX_SHIFT; // normal, outer/inner WB cacheable-ish
            bits |= l1bits::C_BIT | l1bits::B_BIT;
        }
        if !flags.contains(MappingFlags::EXECUTE) {
            bits |= l1bits::XN_BIT;
        }
        L1Entry(bits)
    }
}

#[derive(Copy, Clone)]
struct L2Entry(u32);

impl L2Entry {
    const fn fault(handler: FaultHandler) -> Self {
        L2Entry(handler as usize as u32)
    }

    fn is_fault(self) -> bool {
        self.0 & 0b11 == 0b00
    }

    fn fault_handler(self) -> FaultHandler {
        debug_assert!(self.is_fault());
        unsafe { core::mem::transmute::<usize, FaultHandler>(self.0 as usize) }
    }

    fn page_base(self) -> u32 {
        self.0 & l2bits::BASE_MASK
    }

    /// Page-entry counterpart of [`L1Entry::mapping_type_and_access`];
    /// inverts [`L2Entry::new_page`].
    fn mapping_type_and_access(self) -> (MappingType, bool) {
        decode_access(
            self.0 & l2bits::AP2_BIT != 0,
            (self.0 >> l2bits::AP_SHIFT) & 0b11,
            self.0 & l2bits::XN_BIT != 0,
            (self.0 >> l2bits::TEX_SHIFT) & 0b111,
            self.0 & l2bits::C_BIT != 0,
            self.0 & l2bits::B_BIT != 0,
        )
    }

    fn new_page(
        base_page: u32,
        flags: MappingFlags,
        device: bool,
        global: bool,
        usr32_access: bool,
    ) -> Self {
        let mut bits = (base_page * PAGE_SIZE) & l2bits::BASE_MASK;
        bits |= l2bits::SMALL_PAGE_BIT;
        bits |= l2bits::S_BIT;
        if !global {
            bits |= l2bits::NG_BIT;
        }
        let (ap2, ap) = access_permissions(flags, usr32_access);
        if ap2 {
            bits |= l2bits::AP2_BIT;
        }
        bits |= (ap as u32) << l2bits::AP_SHIFT;
        if device {
            // TEX=0, C=0, B=0: strongly ordered.
        } else {
            bits |= 0b001 << l2bits::TEX_SHIFT;
            bits |= l2bits::C_BIT | l2bits::B_BIT;
        }
        if !flags.contains(MappingFlags::EXECUTE) {
            bits |= l2bits::XN_BIT;
        }
        L2Entry(bits)
    }
}

/// Maps `(flags, usr32_access)` onto the classic ARM `(AP[2], AP[1:0])`
/// access-permission encoding: full RW for a user-accessible writable
/// mapping, privileged-only RW for kernel-private data, and read-only (both
/// privilege levels) when the mapping forbids writes.
fn access_permissions(flags: MappingFlags, usr32_access: bool) -> (bool, u8) {
    if !flags.contains(MappingFlags::WRITE) {
        (true, 0b10) // AP[2]=1: read-only at both privilege levels
    } else if usr32_access {
        (false, 0b11) // full access, user and privileged
    } else {
        (false, 0b01) // privileged RW, no user access
    }
}

/// Inverts [`access_permissions`] plus the device/TEX/C/B encoding shared by
/// [`L1Entry::new_section`]/[`L2Entry::new_page`], recovering the
/// [`MappingType`] and `usr32_access` bit a mapped entry was built from.
fn decode_access(
    ap2: bool,
    ap: u32,
    xn: bool,
    tex: u32,
    c: bool,
    b: bool,
) -> (MappingType, bool) {
    let usr32_access = !ap2 && ap == 0b11;
    if tex == 0 && !c && !b {
        return (MappingType::Device, usr32_access);
    }
    let write = !ap2;
    let execute = !xn;
    let mapping_type = match (write, execute) {
        (true, true) => MappingType::Rwx,
        (true, false) => MappingType::Rw,
        (false, true) => MappingType::Rx,
        (false, false) => MappingType::R,
    };
    (mapping_type, usr32_access)
}

#[repr(C, align(16384))]
struct L1Table([L1Entry; L1_ENTRY_COUNT]);

#[repr(C, align(1024))]
struct L2Table([L2Entry; L2_ENTRY_COUNT]);

/// Result of [`MmuDriver::walk_global_tree`]: what physical pages (if any)
/// back a virtual address in the global tree right now.
#[derive(Copy, Clone, Debug)]
pub struct MemoryPages {
    pub base_page: u32,
    pub count: u32,
    pub virtual_base: u32,
    /// The mapping's real access rights, recovered from the global entry so
    /// a caller mirroring it elsewhere (`check_global_table`) doesn't have
    /// to guess at AP/TEX/C/B/XN.
    pub mapping_type: MappingType,
    pub usr32_access: bool,
}

/// A request to install a mapping, per spec §4.2's `map_memory(mapping)`.
#[derive(Copy, Clone, Debug)]
pub struct Mapping {
    pub base_page: u32,
    pub pages: u32,
    pub va: u32,
    pub mapping_type: MappingType,
    pub all_cores: bool,
    pub usr32_access: bool,
    pub not_shared: bool,
}

fn va_l1_index(va: u32) -> usize {
    (va >> 20) as usize & (L1_ENTRY_COUNT - 1)
}

fn va_l2_index(va: u32) -> usize {
    (va >> 12) as usize & (L2_ENTRY_COUNT - 1)
}

/// The default fault handler installed in an L2 table carved out of a
/// global-backed L1 entry: copies the corresponding global-tree entry into
/// the local tree. Spec §4.2.
pub fn check_global_table(va: u32, kind: FaultKind, core: u32) -> bool {
    MMU.handle_check_global(va, kind, core)
}

struct L2Pool {
    tables: [L2Table; MAX_L2_TABLES],
    in_use: [bool; MAX_L2_TABLES],
}

struct Inner {
    local: *mut [L1Table],
    global: *mut L1Table,
    l2: L2Pool,
}

/// The MMU driver. One instance, shared across cores, behind
/// `shared.mmu.lock`.
pub struct MmuDriver {
    lock: KernelLock,
    inner: core::cell::UnsafeCell<Option<Inner>>,
}

// Safety: all access mediated by `lock`.
unsafe impl Sync for MmuDriver {}

pub static MMU: MmuDriver = MmuDriver::new();

impl MmuDriver {
    pub const fn new() -> Self {
        MmuDriver {
            lock: KernelLock::new(),
            inner: core::cell::UnsafeCell::new(None),
        }
    }

    /// Installs the local-table and global-table storage. Must run once at
    /// boot, before any core enables its MMU.
    ///
    /// # Safety
    /// `local` must have `core_count` elements and outlive the kernel;
    /// `global` likewise.
    pub unsafe fn init(
        &self,
        local: &'static mut [L1TableStorage],
        global: &'static mut L1TableStorage,
        core: u32,
    ) {
        self.lock.with(core, || {
            for t in local.iter_mut() {
                for e in t.0 .0.iter_mut() {
                    *e = L1Entry::fault(default_invalid_handler);
                }
            }
            for e in global.0 .0.iter_mut() {
                *e = L1Entry::fault(default_invalid_handler);
            }
            let inner = unsafe { &mut *self.inner.get() };
            *inner = Some(Inner {
                local: local as *mut [L1TableStorage] as *mut [L1Table],
                global: &mut global.0 as *mut L1Table,
                l2: L2Pool {
                    tables: unsafe {
                        core::mem::zeroed()
                    },
                    in_use: [false; MAX_L2_TABLES],
                },
            });
            // zeroed L2Table entries happen to be all-0 L2Entry, which is
            // a fault entry pointing at address 0 -- immediately
            // overwritten below by a real handler whenever a table is
            // actually allocated, so the zeroed state is never dispatched
            // through.
        })
    }

    fn with_inner<R>(&self, core: u32, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.lock.with(core, || {
            let inner = unsafe { &mut *self.inner.get() };
            f(inner.as_mut().expect("mmu not initialized"))
        })
    }

    fn alloc_l2(inner: &mut Inner) -> Result<usize, UsageError> {
        for (i, used) in inner.l2.in_use.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i);
            }
        }
        Err(UsageError::OutOfTranslationTables)
    }

    fn free_l2(inner: &mut Inner, index: usize) {
        inner.l2.in_use[index] = false;
    }

    fn l2_table_mut(inner: &mut Inner, index: usize) -> &mut L2Table {
        &mut inner.l2.tables[index]
    }

    fn l2_table_pa(inner: &Inner, index: usize) -> u32 {
        &inner.l2.tables[index] as *const L2Table as u32
    }

    fn local_l1(inner: &Inner, core: u32) -> &mut L1Table {
        unsafe { &mut (*inner.local)[core as usize] }
    }

    fn global_l1(inner: &Inner) -> &mut L1Table {
        unsafe { &mut *inner.global }
    }

    /// Ensures the L1 entry at `index` in `table` is a page table, promoting
    /// a fault or section entry into one by allocating an L2 table and
    /// (for a promoted section) filling it with equivalent small-page
    /// entries, or (for a promoted fault) filling it with copies of the
    /// fault handler that was there before.
    fn promote_to_table(
        inner: &mut Inner,
        table: &mut L1Table,
        index: usize,
        domain: u32,
        global: bool,
    ) -> Result<usize, UsageError> {
        let entry = table.0[index];
        if entry.is_table() {
            let base = entry.table_base();
            for (i, t) in inner.l2.tables.iter().enumerate() {
                if t as *const L2Table as u32 == base {
                    return Ok(i);
                }
            }
            unreachable!("table entry points outside the L2 pool");
        }

        let l2_index = Self::alloc_l2(inner)?;
        let l2 = Self::l2_table_mut(inner, l2_index);
        if entry.is_fault() {
            let fill = L2Entry::fault(entry.fault_handler());
            for e in l2.0.iter_mut() {
                *e = fill;
            }
        } else {
            debug_assert!(
                entry.is_section() && !entry.is_supersection(),
                "supersection split not supported"
            );
            for (i, e) in l2.0.iter_mut().enumerate() {
                *e = entry.section_to_page(i as u32);
            }
        }
        let base = Self::l2_table_pa(inner, l2_index);
        table.0[index] = L1Entry::new_table(base, domain, global);
        Ok(l2_index)
    }

    /// `map_memory`, per spec §4.2.
    pub fn map_memory(
        &self,
        mapping: Mapping,
        core: u32,
    ) -> Result<(), UsageError> {
        self.with_inner(core, |inner| {
            let section_aligned = mapping.va % (PAGES_PER_SECTION * PAGE_SIZE)
                == 0
                && mapping.base_page % PAGES_PER_SECTION == 0;
            let whole_sections =
                section_aligned && mapping.pages % PAGES_PER_SECTION == 0;

            let flags = mapping.mapping_type.flags();
            let device = mapping.mapping_type.is_device();
            let global = mapping.all_cores;

            if whole_sections {
                let mut remaining = mapping.pages;
                let mut va = mapping.va;
                let mut pa = mapping.base_page;
                while remaining > 0 {
                    let super_section = !mapping.not_shared
                        && remaining >= PAGES_PER_SUPERSECTION
                        && va % (PAGES_PER_SUPERSECTION * PAGE_SIZE) == 0
                        && pa % PAGES_PER_SUPERSECTION == 0;
                    let run = if super_section {
                        PAGES_PER_SUPERSECTION
                    } else {
                        PAGES_PER_SECTION
                    };
                    let entry = L1Entry::new_section(
                        pa,
                        super_section,
                        flags,
                        device,
                        global,
                        mapping.usr32_access,
                    );
                    let idx = va_l1_index(va);
                    if global {
                        Self::global_l1(inner).0[idx] = entry;
                        for c in 0..Self::core_count(inner) {
                            Self::local_l1(inner, c).0[idx] = entry;
                        }
                    } else {
                        Self::local_l1(inner, core).0[idx] = entry;
                    }
                    va += run * PAGE_SIZE;
                    pa += run;
                    remaining -= run;
                }
            } else {
                let mut remaining = mapping.pages;
                let mut va = mapping.va;
                let mut pa = mapping.base_page;
                while remaining > 0 {
                    let l1_idx = va_l1_index(va);
                    let table = if global {
                        Self::global_l1(inner)
                    } else {
                        Self::local_l1(inner, core)
                    };
                    let l2_index = Self::promote_to_table(
                        inner, table, l1_idx, 0, global,
                    )?;
                    if global {
                        for c in 0..Self::core_count(inner) {
                            Self::local_l1(inner, c).0[l1_idx] =
                                table.0[l1_idx];
                        }
                    }
                    let l2 = Self::l2_table_mut(inner, l2_index);
                    let l2_idx = va_l2_index(va);
                    l2.0[l2_idx] = L2Entry::new_page(
                        pa,
                        flags,
                        device,
                        global,
                        mapping.usr32_access,
                    );
                    va += PAGE_SIZE;
                    pa += 1;
                    remaining -= 1;
                }
            }
            Ok(())
        })?;
        crate::arch::mmu_barrier();
        Ok(())
    }

    /// `clear_memory_region`, per spec §4.2: reinstalls `handler` across
    /// `[va, va+pages*PAGE_SIZE)` and releases any L2 tables that become
    /// wholly unused.
    pub fn clear_memory_region(
        &self,
        va: u32,
        pages: u32,
        handler: FaultHandler,
        all_cores: bool,
        core: u32,
    ) {
        self.with_inner(core, |inner| {
            let mut remaining = pages;
            let mut cur = va;
            while remaining > 0 {
                let l1_idx = va_l1_index(cur);
                let table = if all_cores {
                    Self::global_l1(inner)
                } else {
                    Self::local_l1(inner, core)
                };
                let entry = table.0[l1_idx];
                let section_pages = if entry.is_section() && entry.is_supersection() {
                    PAGES_PER_SUPERSECTION
                } else {
                    PAGES_PER_SECTION
                };
                let section_base_va = cur & !(section_pages * PAGE_SIZE - 1);
                let whole_section = entry.is_section()
                    && cur == section_base_va
                    && remaining >= section_pages;

                if entry.is_section() && whole_section {
                    table.0[l1_idx] = L1Entry::fault(handler);
                    cur += section_pages * PAGE_SIZE;
                    remaining -= section_pages;
                    continue;
                }

                let l2_index = if entry.is_table() {
                    let base = entry.table_base();
                    inner
                        .l2
                        .tables
                        .iter()
                        .position(|t| t as *const L2Table as u32 == base)
                        .expect("table entry points outside the L2 pool")
                } else {
                    Self::promote_to_table(inner, table, l1_idx, 0, all_cores)
                        .expect("L2 pool exhausted while splitting a section for clearing")
                };
                let l2 = Self::l2_table_mut(inner, l2_index);
                l2.0[va_l2_index(cur)] = L2Entry::fault(handler);
                if l2.0.iter().all(|e| e.is_fault()) {
                    Self::free_l2(inner, l2_index);
                    table.0[l1_idx] = L1Entry::fault(default_invalid_handler);
                }
                cur += PAGE_SIZE;
                remaining -= 1;
            }
        });
        crate::arch::mmu_barrier();
    }

    /// `walk_global_tree`, per spec §4.2.
    pub fn walk_global_tree(&self, va: u32, core: u32) -> Option<MemoryPages> {
        self.with_inner(core, |inner| {
            let global = Self::global_l1(inner);
            let idx = va_l1_index(va);
            let entry = global.0[idx];
            if entry.is_fault() {
                return None;
            }
            if entry.is_section() {
                let count = if entry.is_supersection() {
                    PAGES_PER_SUPERSECTION
                } else {
                    PAGES_PER_SECTION
                };
                let vbase = va & !((count * PAGE_SIZE) - 1);
                let (mapping_type, usr32_access) = entry.mapping_type_and_access();
                return Some(MemoryPages {
                    base_page: entry.section_base() / PAGE_SIZE,
                    count,
                    virtual_base: vbase,
                    mapping_type,
                    usr32_access,
                });
            }
            let base = entry.table_base();
            let l2_index = inner
                .l2
                .tables
                .iter()
                .position(|t| t as *const L2Table as u32 == base)?;
            let l2 = &inner.l2.tables[l2_index];
            let e = l2.0[va_l2_index(va)];
            if e.is_fault() {
                return None;
            }
            let (mapping_type, usr32_access) = e.mapping_type_and_access();
            Some(MemoryPages {
                base_page: e.page_base() / PAGE_SIZE,
                count: 1,
                virtual_base: va & !(PAGE_SIZE - 1),
                mapping_type,
                usr32_access,
            })
        })
    }

    /// Dispatches a translation fault on `core` for address `va`: finds the
    /// invalid entry's stored handler and calls it. Returns whether the
    /// handler resolved the fault.
    pub fn dispatch_fault(&self, va: u32, kind: FaultKind, core: u32) -> bool {
        if kind == FaultKind::Other {
            return false;
        }
        let handler = self.with_inner(core, |inner| {
            let local = Self::local_l1(inner, core);
            let idx = va_l1_index(va);
            let entry = local.0[idx];
            if entry.is_fault() {
                return entry.fault_handler();
            }
            debug_assert!(entry.is_table());
            let base = entry.table_base();
            let l2_index = inner
                .l2
                .tables
                .iter()
                .position(|t| t as *const L2Table as u32 == base)
                .expect("table entry points outside the L2 pool");
            let l2 = &inner.l2.tables[l2_index];
            let e = l2.0[va_l2_index(va)];
            debug_assert!(e.is_fault());
            e.fault_handler()
        });
        handler(va, kind, core)
    }

    fn handle_check_global(&self, va: u32, kind: FaultKind, core: u32) -> bool {
        if let Some(pages) = self.walk_global_tree(va, core) {
            let entry_result = self.map_memory(
                Mapping {
                    base_page: pages.base_page,
                    pages: pages.count,
                    va: pages.virtual_base,
                    mapping_type: pages.mapping_type,
                    all_cores: false,
                    usr32_access: pages.usr32_access,
                    not_shared: pages.mapping_type.is_device(),
                },
                core,
            );
            entry_result.is_ok()
        } else {
            let _ = kind;
            false
        }
    }

    fn core_count(_inner: &Inner) -> u32 {
        crate::startup::CORE_COUNT as u32
    }
}

fn default_invalid_handler(_va: u32, _kind: FaultKind, _core: u32) -> bool {
    false
}

/// Backing storage for one local or global L1 table; boot code allocates
/// `CORE_COUNT` of these plus one for the global table and hands references
/// to [`MmuDriver::init`].
#[repr(C, align(16384))]
pub struct L1TableStorage(L1Table);

impl L1TableStorage {
    pub const fn new() -> Self {
        L1TableStorage(L1Table(
            [L1Entry(0); L1_ENTRY_COUNT],
        ))
    }
}

impl Default for L1TableStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::MappingType;

    fn dummy_handler(_va: u32, _kind: FaultKind, _core: u32) -> bool {
        false
    }

    #[test]
    fn l1_entry_fault_roundtrip() {
        let e = L1Entry::fault(dummy_handler);
        assert!(e.is_fault());
        let h = e.fault_handler();
        assert_eq!(h as usize, dummy_handler as usize);
    }

    #[test]
    fn section_entry_encodes_base_and_execute() {
        let e = L1Entry::new_section(
            0x1000, // page number -> 0x1000 * 4096 = 0x0100_0000
            false,
            MappingType::Rwx.flags(),
            false,
            true,
            true,
        );
        assert!(e.is_section());
        assert!(!e.is_supersection());
        assert_eq!(e.section_base(), 0x0100_0000);
        assert_eq!(e.0 & l1bits::XN_BIT, 0);
    }

    #[test]
    fn readonly_mapping_sets_ap2() {
        let e = L1Entry::new_section(
            0,
            false,
            MappingType::R.flags(),
            false,
            true,
            true,
        );
        assert_ne!(e.0 & l1bits::AP2_BIT, 0);
    }

    #[test]
    fn l2_entry_small_page_roundtrip() {
        let e = L2Entry::new_page(
            0x55,
            MappingType::Rw.flags(),
            false,
            false,
            false,
        );
        assert_eq!(e.page_base(), 0x55 * PAGE_SIZE);
        assert_ne!(e.0 & l2bits::NG_BIT, 0);
    }

    #[test]
    fn section_mapping_type_roundtrips_through_decode() {
        for (ty, usr32) in [
            (MappingType::Rwx, true),
            (MappingType::Rw, false),
            (MappingType::Rx, true),
            (MappingType::R, true),
            (MappingType::Device, true),
        ] {
            let e = L1Entry::new_section(
                0x1000,
                false,
                ty.flags(),
                ty.is_device(),
                true,
                usr32,
            );
            let (decoded_ty, decoded_usr32) = e.mapping_type_and_access();
            assert_eq!(decoded_ty, ty);
            assert_eq!(decoded_usr32, usr32);
        }
    }

    #[test]
    fn page_mapping_type_roundtrips_through_decode() {
        for (ty, usr32) in [
            (MappingType::Rwx, false),
            (MappingType::Rx, false),
            (MappingType::R, false),
            (MappingType::Device, false),
        ] {
            let e = L2Entry::new_page(0x55, ty.flags(), ty.is_device(), false, usr32);
            let (decoded_ty, decoded_usr32) = e.mapping_type_and_access();
            assert_eq!(decoded_ty, ty);
            assert_eq!(decoded_usr32, usr32);
        }
    }
}
