// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L8: interrupt dispatch.
//!
//! `irq_tasks[core][source]` is a two-dimensional table of `OSTask`
//! pointers, one non-null entry per task currently blocked in
//! `OSTask_WaitForInterrupt` on that `(core, source)` pair. The table is
//! sized lazily: the HAL tells us how many sources exist via
//! [`InterruptTable::register_sources`] before any `WaitForInterrupt` call
//! (spec §4.9), and we carve the `cores * sources` array out of the
//! privileged heap at that point rather than guess a static bound.
//!
//! The IRQ vector path (`crate::arch`) reads and clears an entry with a
//! single atomic swap, so a source firing twice in a row before the
//! handler task gets scheduled can never double-wake it.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use abi::UsageError;

use crate::heap;
use crate::task::{self, Extras, OSTask};

pub struct InterruptTable {
    sources: AtomicUsize,
    table: AtomicPtr<AtomicPtr<OSTask>>,
}

unsafe impl Sync for InterruptTable {}

impl InterruptTable {
    pub const fn new() -> Self {
        InterruptTable {
            sources: AtomicUsize::new(0),
            table: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// `RegisterInterruptSources`: sizes and allocates the table. Idempotent
    /// after the first successful call, matching a HAL that calls this once
    /// per board bring-up.
    pub fn register_sources(
        &self,
        sources: usize,
        core: u32,
    ) -> Result<(), UsageError> {
        if !self.table.load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let count = task::MAX_CORES * sources;
        let bytes = count * core::mem::size_of::<AtomicPtr<OSTask>>();
        let region = heap::PRIVILEGED
            .allocate(bytes, core)
            .ok_or(UsageError::OutOfHeap)?;
        let table = region.as_ptr() as *mut AtomicPtr<OSTask>;
        for i in 0..count {
            unsafe {
                table.add(i).write(AtomicPtr::new(core::ptr::null_mut()));
            }
        }
        self.sources.store(sources, Ordering::Release);
        self.table.store(table, Ordering::Release);
        Ok(())
    }

    fn slot(&self, core: u32, source: u32) -> Option<&AtomicPtr<OSTask>> {
        let sources = self.sources.load(Ordering::Acquire);
        let table = self.table.load(Ordering::Acquire);
        if table.is_null() || sources == 0 || source as usize >= sources {
            return None;
        }
        let index = core as usize * sources + source as usize;
        Some(unsafe { &*table.add(index) })
    }

    /// `OSTask_WaitForInterrupt(source)`. Caller must already have set
    /// SPSR's interrupt-disable bit via a prior `EnablingInterrupts` (spec
    /// §4.5); detaches the current task from `core`'s running list and
    /// records it so the IRQ vector can find it.
    pub fn wait_for_interrupt(
        &self,
        core: u32,
        source: u32,
    ) -> Result<(), UsageError> {
        let slot = self
            .slot(core, source)
            .ok_or(UsageError::BadArgument)?;
        let caller = task::SCHED
            .block_for_interrupt(core)
            .ok_or(UsageError::BadArgument)?;
        unsafe {
            (*caller.as_ptr()).extras = Extras::InterruptSource(source);
        }
        slot.store(caller.as_ptr(), Ordering::Release);
        Ok(())
    }

    /// IRQ vector entry for a raised `source` on `core`: atomically reads
    /// and clears the slot, and if a task was waiting, promotes it to the
    /// head of `core`'s running list (the new current task), per spec
    /// §4.9. Returns whether a task was woken, so the caller knows whether
    /// a context switch is pending.
    pub fn dispatch(&self, core: u32, source: u32) -> bool {
        let Some(slot) = self.slot(core, source) else {
            return false;
        };
        let raw = slot.swap(core::ptr::null_mut(), Ordering::AcqRel);
        let Some(task) = NonNull::new(raw) else {
            return false;
        };
        task::SCHED.irq_wake(core, task);
        true
    }
}

pub static IRQ_TABLE: InterruptTable = InterruptTable::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TASKS;

    fn init_heap_once() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let region: &'static mut [u8] =
                Box::leak(vec![0u8; 1 << 16].into_boxed_slice());
            unsafe { heap::PRIVILEGED.init(region, 0) };
        });
    }

    #[test]
    fn wait_then_dispatch_wakes_task() {
        init_heap_once();
        let table = InterruptTable::new();
        table.register_sources(8, 0).unwrap();

        let t = TASKS.alloc(0, 0, &[], 0, 4).unwrap();
        unsafe { task::SCHED.running_list(4).push_back(t) };

        table.wait_for_interrupt(4, 3).unwrap();
        assert!(task::SCHED.running_list(4).is_empty());
        assert!(unsafe { t.as_ref().is_blocked() });

        assert!(table.dispatch(4, 3));
        assert_eq!(task::SCHED.running_list(4).head(), Some(t));
        assert!(!unsafe { t.as_ref().is_blocked() });

        unsafe { task::SCHED.running_list(4).detach(t) };
        TASKS.free(t, 4);
    }

    #[test]
    fn dispatch_with_no_waiter_is_noop() {
        init_heap_once();
        let table = InterruptTable::new();
        table.register_sources(4, 0).unwrap();
        assert!(!table.dispatch(0, 1));
    }

    #[test]
    fn unregistered_source_is_bad_argument() {
        let table = InterruptTable::new();
        assert!(matches!(
            table.wait_for_interrupt(0, 0),
            Err(UsageError::BadArgument)
        ));
    }
}
