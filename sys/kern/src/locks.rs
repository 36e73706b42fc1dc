// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L5: `OSTask_LockClaim`/`OSTask_LockRelease`, the task-facing FIFO locks.
//!
//! Distinct from [`crate::spinlock::KernelLock`]: these block the calling
//! task (parking it on `shared.blocked`) rather than spinning, and the
//! lock word itself lives in task-visible memory, not kernel state.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{TaskHandle, UsageError};

use crate::task::{self, Extras, Membership, OSTask};
use core::ptr::NonNull;

/// Low bit of a lock word: set when at least one task is parked on
/// `shared.blocked` waiting for this particular lock.
const WANTED_BIT: u32 = 1;

/// A lock word as userspace sees it: `0` free, `handle|0` owned with no
/// waiters, `handle|1` owned with waiters. Wraps an `AtomicU32` so
/// `Claim`/`Release` can CAS it directly; the word itself is ordinary task
/// memory the kernel is given a pointer to.
#[repr(transparent)]
pub struct LockWord(AtomicU32);

impl LockWord {
    pub const fn new() -> Self {
        LockWord(AtomicU32::new(0))
    }

    fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for LockWord {
    fn default() -> Self {
        Self::new()
    }
}

pub enum ClaimOutcome {
    Acquired,
    /// The caller already owned this lock (reentrant claim).
    Reclaimed,
    /// The caller is now parked on `shared.blocked`; the SWI dispatcher
    /// must not resume it until a matching `Release` promotes it.
    Blocked,
}

/// `OSTask_LockClaim`. `caller` must currently be the head of its core's
/// running list; on `Blocked`, the caller has already been detached from
/// running and the SWI dispatcher should move on to the next runnable
/// task without restoring the caller's registers.
pub fn claim(
    lock: &LockWord,
    handle: TaskHandle,
    caller: NonNull<OSTask>,
    core: u32,
) -> ClaimOutcome {
    let owner_bits = handle.owner_bits();
    loop {
        match lock
            .0
            .compare_exchange(0, owner_bits, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return ClaimOutcome::Acquired,
            Err(current) => {
                if current & !WANTED_BIT == owner_bits {
                    return ClaimOutcome::Reclaimed;
                }
                // Set the wanted bit (idempotent if already set), then
                // recheck: a racing release between our failed CAS and
                // here could have vacated the lock.
                let wanted = current | WANTED_BIT;
                if lock
                    .0
                    .compare_exchange(current, wanted, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                if lock.load() & !WANTED_BIT == 0 {
                    // Raced with a release; try to claim again.
                    continue;
                }
                park_on_lock(lock, caller, core);
                return ClaimOutcome::Blocked;
            }
        }
    }
}

fn park_on_lock(lock: &LockWord, task: NonNull<OSTask>, core: u32) {
    let lock_addr = lock as *const LockWord as u32;
    unsafe {
        task::SCHED.running_list(core).detach(task);
        (*task.as_ptr()).resumes = -1;
        (*task.as_ptr()).extras = Extras::LockAddress(lock_addr);
        (*task.as_ptr()).membership = Membership::Blocked;
    }
    task::SCHED.blocked.insert_at_tail(task);
}

/// `OSTask_LockRelease`. Hands the lock to the first FIFO waiter found on
/// `shared.blocked` whose `Extras::LockAddress` matches, if any, and
/// promotes it to `runnable`; otherwise frees the lock outright.
pub fn release(lock: &LockWord) {
    let current = lock.load();
    if current & WANTED_BIT == 0 {
        lock.0.store(0, Ordering::Release);
        return;
    }

    let lock_addr = lock as *const LockWord as u32;
    let winner = task::SCHED.blocked.manipulate(|list| {
        list.find_map(|candidate| unsafe {
            match candidate.as_ref().extras {
                Extras::LockAddress(addr) if addr == lock_addr => {
                    list.detach(candidate);
                    Some(candidate)
                }
                _ => None,
            }
        })
    });

    match winner {
        None => {
            // No waiter actually wants this lock (stale wanted bit from a
            // task that gave up some other way); clear it.
            lock.0.store(0, Ordering::Release);
        }
        Some(new_owner) => {
            let still_wanted = task::SCHED.blocked.manipulate(|list| {
                list.find_map(|candidate| unsafe {
                    match candidate.as_ref().extras {
                        Extras::LockAddress(addr) if addr == lock_addr => Some(()),
                        _ => None,
                    }
                })
            });
            let owner_bits = unsafe { new_owner.as_ref().handle().owner_bits() };
            let word = if still_wanted.is_some() {
                owner_bits | WANTED_BIT
            } else {
                owner_bits
            };
            lock.0.store(word, Ordering::Release);
            task::SCHED.wake(new_owner);
        }
    }
    crate::arch::signal_event();
}

/// Returns [`UsageError::LockAlreadyHeld`] / [`UsageError::NotLockOwner`]
/// style diagnostics used by `crate::swi` when a caller double-claims or
/// releases a lock it doesn't hold; kept here since only this module
/// knows the word's encoding.
pub fn check_owner(lock: &LockWord, handle: TaskHandle) -> Result<(), UsageError> {
    if lock.load() & !WANTED_BIT != handle.owner_bits() {
        return Err(UsageError::NotLockOwner);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TASKS;

    fn fresh_task(core: u32) -> (NonNull<OSTask>, TaskHandle) {
        let t = TASKS.alloc(0, 0, &[], 0, core).unwrap();
        let h = unsafe { t.as_ref().handle() };
        (t, h)
    }

    #[test]
    fn uncontended_claim_and_release() {
        let lock = LockWord::new();
        let (task, handle) = fresh_task(0);
        match claim(&lock, handle, task, 0) {
            ClaimOutcome::Acquired => {}
            _ => panic!("expected Acquired"),
        }
        assert!(check_owner(&lock, handle).is_ok());
        release(&lock);
        assert_eq!(lock.load(), 0);
        TASKS.free(task, 0);
    }

    #[test]
    fn reclaim_by_owner() {
        let lock = LockWord::new();
        let (task, handle) = fresh_task(0);
        claim(&lock, handle, task, 0);
        match claim(&lock, handle, task, 0) {
            ClaimOutcome::Reclaimed => {}
            _ => panic!("expected Reclaimed"),
        }
        release(&lock);
        TASKS.free(task, 0);
    }

    #[test]
    fn contended_claim_blocks_then_wakes_on_release() {
        let lock = LockWord::new();
        let (owner, owner_handle) = fresh_task(3);
        let (waiter, waiter_handle) = fresh_task(3);
        unsafe { task::SCHED.running_list(3).push_back(waiter) };

        claim(&lock, owner_handle, owner, 3);

        match claim(&lock, waiter_handle, waiter, 3) {
            ClaimOutcome::Blocked => {}
            _ => panic!("expected Blocked"),
        }
        assert_eq!(lock.load() & WANTED_BIT, WANTED_BIT);
        assert!(unsafe { waiter.as_ref().is_blocked() });

        release(&lock);

        assert!(!task::SCHED.runnable.is_empty());
        let woken = task::SCHED.runnable.detach_at_head().unwrap();
        assert_eq!(woken, waiter);
        assert!(check_owner(&lock, waiter_handle).is_ok());

        release(&lock);
        TASKS.free(owner, 3);
        TASKS.free(waiter, 3);
    }
}
