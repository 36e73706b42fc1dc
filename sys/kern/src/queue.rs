// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L7: multi-producer work queues pairing queued client calls with
//! registered handler tasks.
//!
//! A queue holds exactly one of two intrusive lists populated at any
//! moment (spec §3): `waiters`, handler tasks blocked in [`queue_wait`]
//! with nothing to do yet, or `work`, client tasks whose SWI got routed
//! here and found no admissible handler. [`enqueue_for_queue`] is the SWI
//! dispatcher's entry point for the latter; it also implements the
//! `ChangeController`/`RunThisForMe`/`ReleaseTask` mechanics a handler uses
//! to act on behalf of the client it picked up (spec §4.8).

use core::ptr::NonNull;

use abi::{QueueHandle, UsageError};

use crate::dll::List;
use crate::spinlock::KernelLock;
use crate::task::{self, OSTask, QueueFilter, SVC_REGISTER_COUNT};

pub const QUEUE_POOL_CAPACITY: usize = 16;

struct Queue {
    in_use: bool,
    waiters: List<OSTask>,
    work: List<OSTask>,
}

impl Queue {
    const fn empty() -> Self {
        Queue {
            in_use: false,
            waiters: List::new(),
            work: List::new(),
        }
    }
}

struct QueuePool {
    lock: KernelLock,
    queues: core::cell::UnsafeCell<[Queue; QUEUE_POOL_CAPACITY]>,
}

unsafe impl Sync for QueuePool {}

impl QueuePool {
    const fn new() -> Self {
        const EMPTY: Queue = Queue::empty();
        QueuePool {
            lock: KernelLock::new(),
            queues: core::cell::UnsafeCell::new([EMPTY; QUEUE_POOL_CAPACITY]),
        }
    }

    fn alloc(&self, core: u32) -> Option<NonNull<Queue>> {
        self.lock.with(core, || {
            let queues = unsafe { &mut *self.queues.get() };
            let slot = queues.iter_mut().find(|q| !q.in_use)?;
            slot.in_use = true;
            Some(unsafe { NonNull::new_unchecked(slot as *mut Queue) })
        })
    }

    fn resolve(&self, handle: QueueHandle) -> Result<NonNull<Queue>, UsageError> {
        let addr = handle.to_raw();
        let base = self.queues.get() as usize;
        let end = base + core::mem::size_of::<[Queue; QUEUE_POOL_CAPACITY]>();
        if (addr as usize) < base
            || (addr as usize) >= end
            || (addr as usize - base) % core::mem::size_of::<Queue>() != 0
        {
            return Err(UsageError::BadHandle);
        }
        let ptr = addr as *mut Queue;
        unsafe {
            if !(*ptr).in_use {
                return Err(UsageError::BadHandle);
            }
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    fn handle_of(&self, queue: NonNull<Queue>) -> QueueHandle {
        QueueHandle::from_raw(queue.as_ptr() as u32)
    }
}

static QUEUES: QueuePool = QueuePool::new();

/// `QueueCreate`.
pub fn create(core: u32) -> Result<QueueHandle, UsageError> {
    let queue = QUEUES.alloc(core).ok_or(UsageError::OutOfHeap)?;
    Ok(QUEUES.handle_of(queue))
}

/// What a handler gets back from a successful, non-blocking `QueueWait`.
#[derive(Copy, Clone, Debug)]
pub struct QueueMatch {
    pub client: NonNull<OSTask>,
    pub swi: u32,
    pub client_core: u32,
}

pub enum WaitOutcome {
    Matched(QueueMatch),
    Blocked,
}

/// `QueueWait(handle)`. `filter` is whatever `crate::module` registered for
/// this handler before it parked; `None` fields admit anything.
pub fn queue_wait(
    handle: QueueHandle,
    caller: NonNull<OSTask>,
    filter: QueueFilter,
    core: u32,
) -> Result<WaitOutcome, UsageError> {
    let ptr = QUEUES.resolve(handle)?;

    // `shared.ostask.queues_lock` (spec §5): serializes every edit to this
    // queue's waiter/work lists against `enqueue_for_queue` running on
    // another core.
    QUEUES.lock.with(core, || {
        let queue = unsafe { &mut *ptr.as_ptr() };

        if let Some(client) = queue.work.pop_front() {
            unsafe { (*client.as_ptr()).controller = Some(caller) };
            let (swi, client_core) =
                unsafe { ((*client.as_ptr()).queue_swi, (*client.as_ptr()).queue_core) };
            return Ok(WaitOutcome::Matched(QueueMatch {
                client,
                swi,
                client_core,
            }));
        }

        task::SCHED
            .block_for_interrupt(core)
            .ok_or(UsageError::BadArgument)?;
        unsafe {
            (*caller.as_ptr()).queue_filter = filter;
            (*caller.as_ptr()).membership = task::Membership::OnQueue;
            queue.waiters.push_back(caller);
        }
        Ok(WaitOutcome::Blocked)
    })
}

fn filter_admits(filter: QueueFilter, swi: u32, core: u32) -> bool {
    filter.match_swi.map_or(true, |s| s == swi)
        && filter.match_core.map_or(true, |c| c == core)
}

/// `enqueue_for_queue(caller_task, swi)`: invoked by `crate::swi` when a
/// SWI is bound to a queue. Always detaches `caller` from running first.
pub fn enqueue_for_queue(
    handle: QueueHandle,
    caller: NonNull<OSTask>,
    swi: u32,
    core: u32,
) -> Result<(), UsageError> {
    let ptr = QUEUES.resolve(handle)?;

    // Same `shared.ostask.queues_lock` `queue_wait` takes; the whole
    // waiter-list search plus the waiter/work-list edit it resolves to
    // must be atomic with respect to a concurrent `queue_wait`/
    // `enqueue_for_queue` on another core.
    QUEUES.lock.with(core, || {
        let queue = unsafe { &mut *ptr.as_ptr() };

        task::SCHED
            .block_for_interrupt(core)
            .ok_or(UsageError::BadArgument)?;
        unsafe {
            (*caller.as_ptr()).queue_swi = swi;
            (*caller.as_ptr()).queue_core = core;
        }

        let mut cursor = queue.waiters.head();
        let mut found = None;
        while let Some(node) = cursor {
            let filter = unsafe { node.as_ref().queue_filter };
            if filter_admits(filter, swi, core) {
                found = Some(node);
                break;
            }
            let next = unsafe { node.as_ref().link().next().unwrap() };
            cursor = if Some(next) == queue.waiters.head() {
                None
            } else {
                Some(next)
            };
        }

        match found {
            Some(handler) => {
                unsafe {
                    queue.waiters.detach(handler);
                    (*handler.as_ptr()).svc_registers[0] = caller.as_ref().handle().0;
                    (*handler.as_ptr()).svc_registers[1] = swi;
                    (*handler.as_ptr()).svc_registers[2] = core;
                    (*caller.as_ptr()).controller = Some(handler);
                    (*caller.as_ptr()).membership = task::Membership::OnQueue;
                }
                task::SCHED.inject_after_current(core, handler);
            }
            None => {
                unsafe {
                    (*caller.as_ptr()).membership = task::Membership::OnQueue;
                    queue.work.push_back(caller);
                }
            }
        }
        Ok(())
    })
}

fn require_controller(
    client: NonNull<OSTask>,
    controller: NonNull<OSTask>,
) -> Result<(), UsageError> {
    if unsafe { client.as_ref().controller } == Some(controller) {
        Ok(())
    } else {
        Err(UsageError::BadTaskHandle)
    }
}

/// `GetRegisters(client)`.
pub fn get_registers(
    client: NonNull<OSTask>,
    controller: NonNull<OSTask>,
) -> Result<[u32; SVC_REGISTER_COUNT], UsageError> {
    require_controller(client, controller)?;
    Ok(unsafe { client.as_ref().svc_registers })
}

/// `SetRegisters(client)`.
pub fn set_registers(
    client: NonNull<OSTask>,
    controller: NonNull<OSTask>,
    regs: &[u32; SVC_REGISTER_COUNT],
) -> Result<(), UsageError> {
    require_controller(client, controller)?;
    unsafe { (*client.as_ptr()).svc_registers = *regs };
    Ok(())
}

/// `RunThisForMe(client, entry)`: grafts `entry` onto the client's saved
/// resume address and schedules it on `core`, so it re-enters user space
/// running the handler-supplied code with the handler's register edits in
/// place (spec §4.8).
pub fn run_this_for_me(
    client: NonNull<OSTask>,
    controller: NonNull<OSTask>,
    entry: u32,
    core: u32,
) -> Result<(), UsageError> {
    require_controller(client, controller)?;
    unsafe {
        (*client.as_ptr()).svc_registers[SVC_REGISTER_COUNT - 2] = entry;
    }
    task::SCHED.inject_after_current(core, client);
    Ok(())
}

/// `ChangeController(task, new_controller)`.
pub fn change_controller(
    client: NonNull<OSTask>,
    new_controller: Option<NonNull<OSTask>>,
    core: u32,
) -> Result<(), UsageError> {
    task::SCHED.detach_anywhere(core, client);
    unsafe { (*client.as_ptr()).controller = new_controller };
    Ok(())
}

/// `ReleaseTask(client)`: the controller is done; resume the client
/// normally.
pub fn release_task(
    client: NonNull<OSTask>,
    controller: NonNull<OSTask>,
) -> Result<(), UsageError> {
    require_controller(client, controller)?;
    unsafe { (*client.as_ptr()).controller = None };
    task::SCHED.wake(client);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(core: u32) -> NonNull<OSTask> {
        task::TASKS.alloc(0, 0, &[], 0, core).unwrap()
    }

    /// Spec §8 scenario 4: module SWI routing end to end.
    #[test]
    fn handler_doubles_client_register_and_releases() {
        let client = make_task(0);
        let handler = make_task(1);
        unsafe {
            task::SCHED.running_list(0).push_back(client);
            task::SCHED.running_list(1).push_back(handler);
        }

        let q = create(1).unwrap();
        assert!(matches!(
            queue_wait(q, handler, QueueFilter::default(), 1).unwrap(),
            WaitOutcome::Blocked
        ));

        unsafe { (*client.as_ptr()).svc_registers[0] = 42 };
        enqueue_for_queue(q, client, 0, 0).unwrap();

        // Handler was matched immediately and injected onto the client's
        // core (0), displacing nothing else there.
        assert_eq!(task::SCHED.running_list(0).head(), Some(client));
        unsafe {
            assert_eq!(handler.as_ref().svc_registers[0], client.as_ref().handle().0);
            assert_eq!(handler.as_ref().svc_registers[1], 0);
            assert_eq!(handler.as_ref().svc_registers[2], 0);
        }

        let mut regs = get_registers(client, handler).unwrap();
        regs[0] *= 2;
        set_registers(client, handler, &regs).unwrap();
        release_task(client, handler).unwrap();

        assert_eq!(unsafe { client.as_ref().svc_registers[0] }, 84);
        assert!(unsafe { client.as_ref().controller }.is_none());

        unsafe {
            task::SCHED.running_list(0).detach(client);
            task::SCHED.running_list(1).detach(handler);
        }
        task::TASKS.free(client, 0);
        task::TASKS.free(handler, 1);
    }

    #[test]
    fn queue_wait_blocks_with_empty_work_list() {
        let t = make_task(2);
        unsafe { task::SCHED.running_list(2).push_back(t) };
        let q = create(2).unwrap();
        assert!(matches!(
            queue_wait(q, t, QueueFilter::default(), 2).unwrap(),
            WaitOutcome::Blocked
        ));
        assert!(task::SCHED.running_list(2).is_empty());
        task::TASKS.free(t, 2);
    }

    #[test]
    fn filter_mismatch_parks_caller_on_work_list() {
        let handler = make_task(3);
        let client = make_task(3);
        unsafe { task::SCHED.running_list(3).push_back(client) };

        let q = create(3).unwrap();
        queue_wait(
            q,
            handler,
            QueueFilter {
                match_swi: Some(99),
                match_core: None,
            },
            3,
        )
        .unwrap();

        enqueue_for_queue(q, client, 7, 3).unwrap();
        assert_eq!(unsafe { client.as_ref().controller }, None);

        task::TASKS.free(handler, 3);
        task::TASKS.free(client, 3);
    }
}
