// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L0: the raw physical-page pool.
//!
//! A bitmap of 1 MiB *sections* (one bit per section, set = free) backs
//! allocations of a whole number of sections. Smaller requests are served
//! from `fragments`, a small table of leftover sub-section page runs; when
//! the table has nothing big enough, we split a fresh section off the
//! bitmap to refill it. This mirrors spec §4.1 exactly, including its
//! choice to leave deeper fragmentation unhandled (spec §9(b)) beyond the
//! one level of section-splitting spelled out in SPEC_FULL.md's "Section
//! split on demand" decision.
//!
//! All mutation happens under [`crate::spinlock::KernelLock`]; callers are
//! expected to serialize through [`Pool::claim_contiguous`] /
//! [`Pool::free_contiguous`], not the raw fields.

use abi::UsageError;

use crate::spinlock::KernelLock;

pub const PAGE_SIZE: u32 = 4096;
pub const PAGES_PER_SECTION: u32 = 256; // 1 MiB / 4 KiB

/// Upper bound on the number of 1 MiB sections this pool can track. Chosen
/// generously (1 GiB of RAM) for a teaching kernel; a deployment with more
/// physical memory would raise this and the dependent bitmap storage.
pub const MAX_SECTIONS: usize = 1024;
const BITMAP_WORDS: usize = MAX_SECTIONS / 32;

/// Depth of the sub-section fragment table. Spec describes this as "a small
/// table"; we size it to comfortably hold the fragments produced by a
/// handful of concurrent sub-section allocators (pipes, L2 tables) before a
/// section needs splitting again.
const MAX_FRAGMENTS: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Fragment {
    base_page: u32,
    count: u32,
}

struct Inner {
    base_page: u32,
    section_count: u32,
    bitmap: [u32; BITMAP_WORDS],
    fragments: [Option<Fragment>; MAX_FRAGMENTS],
}

impl Inner {
    fn bit(&self, section: u32) -> bool {
        self.bitmap[(section / 32) as usize] & (1 << (section % 32)) != 0
    }

    fn set_bit(&mut self, section: u32, free: bool) {
        let word = &mut self.bitmap[(section / 32) as usize];
        let mask = 1 << (section % 32);
        if free {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Scans for `n` consecutive free (bit-set) sections. Simple linear
    /// scan: spec's leading-zero/leading-one word-scanning is a performance
    /// optimization over this same bit-vector semantics, which we forgo in
    /// favor of an implementation that's easy to convince yourself is
    /// correct.
    fn find_free_run(&self, n: u32) -> Option<u32> {
        if n == 0 || n > self.section_count {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0u32;
        for s in 0..self.section_count {
            if self.bit(s) {
                if run_len == 0 {
                    run_start = Some(s);
                }
                run_len += 1;
                if run_len >= n {
                    return run_start;
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }
        None
    }

    fn claim_sections(&mut self, n: u32) -> Option<u32> {
        let start = self.find_free_run(n)?;
        for s in start..start + n {
            self.set_bit(s, false);
        }
        Some(self.base_page + start * PAGES_PER_SECTION)
    }

    fn free_sections(&mut self, base_page: u32, n: u32) {
        let start = (base_page - self.base_page) / PAGES_PER_SECTION;
        for s in start..start + n {
            debug_assert!(
                !self.bit(s),
                "double free of physical section {s}"
            );
            if self.bit(s) {
                crate::fail::die("raw page pool double free");
            }
            self.set_bit(s, true);
        }
    }

    fn push_fragment(&mut self, base_page: u32, count: u32) {
        if count == 0 {
            return;
        }
        for slot in self.fragments.iter_mut() {
            if slot.is_none() {
                *slot = Some(Fragment { base_page, count });
                return;
            }
        }
        crate::fail::die("raw page pool fragment table exhausted");
    }

    /// Finds the first fragment with `count >= pages`, per spec's
    /// first-fit-over-the-fragment-list rule (no best-fit search).
    fn take_fragment_fitting(&mut self, pages: u32) -> Option<(u32, u32)> {
        for slot in self.fragments.iter_mut() {
            if let Some(f) = slot {
                if f.count >= pages {
                    let base = f.base_page;
                    let count = f.count;
                    *slot = None;
                    return Some((base, count));
                }
            }
        }
        None
    }

    /// Finds a fragment that is adjacent to `[base_page, base_page+count)`
    /// on either side and merges it in, for double-free/coalescing safety.
    fn merge_adjacent_fragment(&mut self, base_page: u32, count: u32) -> (u32, u32) {
        let mut base_page = base_page;
        let mut count = count;
        loop {
            let mut merged = false;
            for slot in self.fragments.iter_mut() {
                if let Some(f) = slot {
                    if f.base_page + f.count == base_page {
                        base_page = f.base_page;
                        count += f.count;
                        *slot = None;
                        merged = true;
                        break;
                    } else if base_page + count == f.base_page {
                        count += f.count;
                        *slot = None;
                        merged = true;
                        break;
                    }
                }
            }
            if !merged {
                return (base_page, count);
            }
        }
    }
}

/// The physical-page pool itself. One instance is shared across all cores,
/// under `shared.rawmemory.lock`.
pub struct Pool {
    lock: KernelLock,
    inner: core::cell::UnsafeCell<Inner>,
}

// Safety: all access to `inner` is mediated by `lock`.
unsafe impl Sync for Pool {}

impl Pool {
    /// Constructs a pool over `total_pages` pages of physical RAM starting
    /// at `base_page`. Any pages beyond the last whole section are
    /// deposited as an initial fragment rather than discarded.
    pub const fn new_empty() -> Self {
        Pool {
            lock: KernelLock::new(),
            inner: core::cell::UnsafeCell::new(Inner {
                base_page: 0,
                section_count: 0,
                bitmap: [0; BITMAP_WORDS],
                fragments: [None; MAX_FRAGMENTS],
            }),
        }
    }

    /// Must be called exactly once, at boot, before any claim/free.
    pub fn init(&self, base_page: u32, total_pages: u32, core: u32) {
        self.lock.with(core, || {
            let inner = unsafe { &mut *self.inner.get() };
            let section_count = total_pages / PAGES_PER_SECTION;
            assert!(
                (section_count as usize) <= MAX_SECTIONS,
                "physical memory exceeds MAX_SECTIONS"
            );
            inner.base_page = base_page;
            inner.section_count = section_count;
            for s in 0..section_count {
                inner.set_bit(s, true);
            }
            let leftover = total_pages - section_count * PAGES_PER_SECTION;
            if leftover > 0 {
                inner.push_fragment(
                    base_page + section_count * PAGES_PER_SECTION,
                    leftover,
                );
            }
        })
    }

    /// `claim_contiguous(pages) -> base_page | UNAVAILABLE`, per spec §4.1.
    pub fn claim_contiguous(
        &self,
        pages: u32,
        core: u32,
    ) -> Result<u32, UsageError> {
        self.lock.with(core, || {
            let inner = unsafe { &mut *self.inner.get() };
            if pages % PAGES_PER_SECTION == 0 {
                inner
                    .claim_sections(pages / PAGES_PER_SECTION)
                    .ok_or(UsageError::OutOfPhysicalMemory)
            } else if let Some((base, count)) =
                inner.take_fragment_fitting(pages)
            {
                let leftover = count - pages;
                if leftover > 0 {
                    inner.push_fragment(base + pages, leftover);
                }
                Ok(base)
            } else {
                // Split a fresh section to refill the fragment list.
                let base = inner
                    .claim_sections(1)
                    .ok_or(UsageError::OutOfPhysicalMemory)?;
                let leftover = PAGES_PER_SECTION - pages;
                if leftover > 0 {
                    inner.push_fragment(base + pages, leftover);
                }
                Ok(base)
            }
        })
    }

    /// `free_contiguous(base, pages)`, per spec §4.1: splits into a partial
    /// leading section, whole sections, and a partial trailing section,
    /// recursing on the partial pieces.
    pub fn free_contiguous(&self, base_page: u32, pages: u32, core: u32) {
        self.lock.with(core, || {
            let inner = unsafe { &mut *self.inner.get() };
            free_recursive(inner, base_page, pages);
        })
    }

    /// Total free pages across bitmap and fragments, for the conservation
    /// property in spec §8.
    pub fn free_page_count(&self, core: u32) -> u32 {
        self.lock.with(core, || {
            let inner = unsafe { &*self.inner.get() };
            let mut total = 0;
            for s in 0..inner.section_count {
                if inner.bit(s) {
                    total += PAGES_PER_SECTION;
                }
            }
            for f in inner.fragments.iter().flatten() {
                total += f.count;
            }
            total
        })
    }
}

/// The one physical-page pool for the system, initialised by `crate::startup`
/// before anything else claims memory.
pub static POOL: Pool = Pool::new_empty();

fn free_recursive(inner: &mut Inner, base_page: u32, pages: u32) {
    if pages == 0 {
        return;
    }
    let section_of = |p: u32| (p - inner.base_page) / PAGES_PER_SECTION;
    let section_start_page =
        |s: u32| inner.base_page + s * PAGES_PER_SECTION;

    let start_section = section_of(base_page);
    let start_section_base = section_start_page(start_section);

    if base_page != start_section_base {
        // Leading partial section.
        let run = pages.min(
            section_start_page(start_section + 1) - base_page,
        );
        let (mbase, mcount) = inner.merge_adjacent_fragment(base_page, run);
        if mcount == PAGES_PER_SECTION
            && mbase == start_section_base
        {
            inner.free_sections(mbase, 1);
        } else {
            inner.push_fragment(mbase, mcount);
        }
        free_recursive(inner, base_page + run, pages - run);
        return;
    }

    let whole_sections = pages / PAGES_PER_SECTION;
    if whole_sections > 0 {
        inner.free_sections(base_page, whole_sections);
        let consumed = whole_sections * PAGES_PER_SECTION;
        free_recursive(
            inner,
            base_page + consumed,
            pages - consumed,
        );
        return;
    }

    // Whatever remains is a trailing partial section.
    let (mbase, mcount) = inner.merge_adjacent_fragment(base_page, pages);
    if mcount == PAGES_PER_SECTION && mbase == start_section_base {
        inner.free_sections(mbase, 1);
    } else {
        inner.push_fragment(mbase, mcount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(total_pages: u32) -> Pool {
        let p = Pool::new_empty();
        p.init(0, total_pages, 0);
        p
    }

    #[test]
    fn claim_whole_section() {
        let p = pool(PAGES_PER_SECTION * 4);
        let base = p.claim_contiguous(PAGES_PER_SECTION, 0).unwrap();
        assert_eq!(base, 0);
        assert_eq!(
            p.free_page_count(0),
            PAGES_PER_SECTION * 3
        );
    }

    #[test]
    fn claim_sub_section_splits_a_section() {
        let p = pool(PAGES_PER_SECTION);
        let base = p.claim_contiguous(8, 0).unwrap();
        assert_eq!(base, 0);
        // Whole section was consumed from the bitmap; 248 pages now sit as
        // a fragment.
        assert_eq!(p.free_page_count(0), PAGES_PER_SECTION - 8);
    }

    #[test]
    fn page_pool_conservation_across_claim_and_free() {
        let p = pool(PAGES_PER_SECTION * 16);
        let initial = p.free_page_count(0);

        let a = p.claim_contiguous(PAGES_PER_SECTION, 0).unwrap();
        let b = p.claim_contiguous(8, 0).unwrap();
        assert_eq!(
            p.free_page_count(0),
            initial - PAGES_PER_SECTION - 8
        );

        p.free_contiguous(a, PAGES_PER_SECTION, 0);
        p.free_contiguous(b, 8, 0);
        assert_eq!(p.free_page_count(0), initial);
    }

    #[test]
    fn scenario_page_pool_split_then_reclaim() {
        // Concrete end-to-end scenario 6 from spec §8.
        let p = pool(64 * 1024 * 1024 / 4096); // 64 MiB
        let a = p.claim_contiguous(0x100, 0).unwrap();
        let _b = p.claim_contiguous(0x8, 0).unwrap();
        p.free_contiguous(a, 0x100, 0);
        let c = p.claim_contiguous(0x100, 0).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn claim_more_than_available_fails() {
        let p = pool(PAGES_PER_SECTION);
        assert_eq!(
            p.claim_contiguous(PAGES_PER_SECTION * 2, 0),
            Err(UsageError::OutOfPhysicalMemory)
        );
    }
}
