// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `(core_id + 1)` owner-tagged spinlocks that protect every
//! cross-core kernel structure (`shared.ostask.lock`, `shared.mmu.lock`,
//! `shared.rawmemory.lock`, and friends, per spec §5).
//!
//! These are not the task-facing `OSTask_LockClaim` locks in [`crate::locks`]
//! -- those block the calling task and are visible to user code. A
//! [`KernelLock`] is held for the duration of a single kernel operation and
//! is never held across a point where the holding core could be interrupted
//! into a blocking wait; contention is expected to be brief, so we just spin.

use core::sync::atomic::{AtomicU32, Ordering};

/// A spinlock whose value is `0` (free) or `core_id + 1` (held by that
/// core). The `+1` bias is so `0` unambiguously means free on every core,
/// including core 0.
pub struct KernelLock {
    owner: AtomicU32,
}

impl KernelLock {
    pub const fn new() -> Self {
        KernelLock {
            owner: AtomicU32::new(0),
        }
    }

    /// Runs `f` with this lock held on behalf of `core`. Spins until
    /// acquired; panics (via `debug_assert`) if `core` already holds it,
    /// since these locks are non-recursive.
    pub fn with<R>(&self, core: u32, f: impl FnOnce() -> R) -> R {
        let owner = core + 1;
        loop {
            match self.owner.compare_exchange_weak(
                0,
                owner,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(holder) => {
                    debug_assert_ne!(
                        holder, owner,
                        "kernel lock is not recursive"
                    );
                    core::hint::spin_loop();
                }
            }
        }
        let r = f();
        self.owner.store(0, Ordering::Release);
        r
    }

    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_claim_release() {
        let lock = KernelLock::new();
        assert!(!lock.is_held());
        let r = lock.with(0, || {
            assert!(lock.is_held());
            42
        });
        assert_eq!(r, 42);
        assert!(!lock.is_held());
    }

    #[test]
    fn sequential_different_cores() {
        let lock = KernelLock::new();
        lock.with(0, || {});
        lock.with(1, || {});
        lock.with(2, || {});
        assert!(!lock.is_held());
    }
}
