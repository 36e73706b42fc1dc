// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L4: `OSTask` records, slots, the per-core run queues, and the
//! cooperative scheduler operations dispatched from [`crate::swi`].

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use abi::{TaskHandle, UsageError};

use crate::dll::{Link, List, MpList, Node};
use crate::spinlock::KernelLock;

/// 13 general-purpose registers, link register, SPSR.
pub const SVC_REGISTER_COUNT: usize = 15;

pub const MAX_CORES: usize = 8;
/// Total number of `OSTask` records carved from the boot-time task pool
/// region. Sized generously; `Create`/`Spawn` fail with
/// [`UsageError::OutOfHeap`]-equivalent once exhausted (see
/// [`TaskPool::alloc`]).
pub const TASK_POOL_CAPACITY: usize = 64;
pub const MAX_MEMORY_BLOCKS: usize = abi::MAX_MEMORY_BLOCKS;
pub const MAX_PIPE_MAPPINGS: usize = 8;

/// Subsystem-specific scratch carried by a blocked task, reused across
/// whichever mechanism currently owns it. Mirrors spec §3's "extras"
/// field -- a real union on the reference implementation, an enum here
/// since Rust gives us a checked one for free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extras {
    None,
    /// Remaining ticks until this task (in `shared.sleeping`) wakes,
    /// expressed as a delta above its list predecessor.
    SleepDelta(u32),
    /// IRQ source this task is waiting on, for bookkeeping symmetry with
    /// `irq_tasks`; the table entry is the authoritative copy.
    InterruptSource(u32),
    /// Address of the lock word this task is blocked on.
    LockAddress(u32),
    /// The queue this task is waiting on or doing work for.
    QueueIndex(u32),
}

/// Optional filters a handler task registers (via `crate::module`) before
/// parking in `QueueWait`, consulted by `crate::queue::enqueue_for_queue`
/// when it walks a queue's waiter list for an admissible handler. `None`
/// admits anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub match_swi: Option<u32>,
    pub match_core: Option<u32>,
}

/// One memory block owned by a slot, installed into the MMU lazily on
/// first fault (see `crate::mmu::check_global_table` / slot fault path).
#[derive(Clone, Copy, Debug)]
pub struct AppMemoryBlock {
    pub va_page: u32,
    pub pages: u32,
    pub page_base: u32,
    pub device: bool,
    pub read_only: bool,
}

/// An address-space slot: an ASID, the memory blocks that back it, and
/// the pipe mappings currently installed for it. Created once per
/// primordial task at boot; `Spawn` allocates a fresh one.
pub struct OSTaskSlot {
    pub asid: u8,
    pub memory_blocks: [Option<AppMemoryBlock>; MAX_MEMORY_BLOCKS],
    pub pipe_mappings: [Option<AppMemoryBlock>; MAX_PIPE_MAPPINGS],
    /// `AppMemoryTop`'s bump pointer: the current top of this slot's
    /// dynamically-extensible region (spec §4.10). Zero until the first
    /// `AppMemoryTop(new_top)` call sets it.
    pub app_memory_top: u32,
    in_use: bool,
}

impl From<abi::AppMemoryBlock> for AppMemoryBlock {
    fn from(b: abi::AppMemoryBlock) -> Self {
        let mapping = match b.mapping {
            x if x == abi::MappingType::Rwx as u8 => abi::MappingType::Rwx,
            x if x == abi::MappingType::Rw as u8 => abi::MappingType::Rw,
            x if x == abi::MappingType::Rx as u8 => abi::MappingType::Rx,
            x if x == abi::MappingType::R as u8 => abi::MappingType::R,
            _ => abi::MappingType::Device,
        };
        AppMemoryBlock {
            va_page: b.va_page,
            pages: b.pages,
            page_base: b.pa_page,
            device: mapping.is_device(),
            read_only: matches!(mapping, abi::MappingType::R | abi::MappingType::Rx),
        }
    }
}

impl OSTaskSlot {
    const fn empty() -> Self {
        OSTaskSlot {
            asid: 0,
            memory_blocks: [None; MAX_MEMORY_BLOCKS],
            pipe_mappings: [None; MAX_PIPE_MAPPINGS],
            app_memory_top: 0,
            in_use: false,
        }
    }
}

pub struct SlotPool {
    lock: KernelLock,
    slots: UnsafeCell<[OSTaskSlot; TASK_POOL_CAPACITY]>,
}

unsafe impl Sync for SlotPool {}

impl SlotPool {
    pub const fn new() -> Self {
        const EMPTY: OSTaskSlot = OSTaskSlot::empty();
        SlotPool {
            lock: KernelLock::new(),
            slots: UnsafeCell::new([EMPTY; TASK_POOL_CAPACITY]),
        }
    }

    pub fn alloc(&self, asid: u8, core: u32) -> Option<usize> {
        self.lock.with(core, || {
            let slots = unsafe { &mut *self.slots.get() };
            let index = slots.iter().position(|s| !s.in_use)?;
            slots[index] = OSTaskSlot {
                asid,
                in_use: true,
                ..OSTaskSlot::empty()
            };
            Some(index)
        })
    }

    pub fn free(&self, index: usize, core: u32) {
        self.lock.with(core, || {
            let slots = unsafe { &mut *self.slots.get() };
            slots[index] = OSTaskSlot::empty();
        })
    }

    /// # Safety
    /// Caller must not alias this with another mutable access to the
    /// same slot.
    pub unsafe fn get(&self, index: usize) -> *mut OSTaskSlot {
        unsafe { (&mut (*self.slots.get())[index]) as *mut OSTaskSlot }
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling state of an `OSTask`, kept separate from list membership.
/// A task's `resumes` counter being negative (spec: exactly `-1`) means
/// blocked; we track the richer reason in `extras` for diagnostics and
/// the release-side dispatch in `crate::locks`/`crate::queue`/`crate::irq`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// Head of some core's running list, i.e. currently executing.
    Running(u32),
    Runnable,
    Sleeping,
    Blocked,
    Moving(u32),
    /// Parked on a queue's waiter or work list; the queue does its own
    /// bookkeeping and treats the task as opaque while it's here.
    OnQueue,
    Free,
}

// NOTE: `svc_registers` must stay first -- the SWI entry/exit trampoline
// in `crate::arch` addresses it relative to the `OSTask*` it's handed,
// the same convention the architecture backend's assembly stub uses for
// `Task::save` on the teacher's Cortex-M port.
#[repr(C)]
pub struct OSTask {
    pub svc_registers: [u32; SVC_REGISTER_COUNT],
    /// Banked user SP/LR, valid whenever the task isn't the one executing
    /// right now (captured on every transition out of user/system mode).
    pub user_sp: u32,
    pub user_lr: u32,
    pub resumes: i32,
    pub slot: usize,
    pub extras: Extras,
    pub membership: Membership,
    /// While parked on a queue's work list: the SWI number and core the
    /// dispatcher enqueued this call from, so `QueueWait` can report them
    /// back to the handler that picks this task up (`crate::queue`).
    pub queue_swi: u32,
    pub queue_core: u32,
    /// Set by `QueueWait`/`enqueue_for_queue` when a handler task takes
    /// ownership of this task via `ChangeController`; cleared by
    /// `ReleaseTask` (`crate::queue`).
    pub controller: Option<NonNull<OSTask>>,
    /// Consulted only while this task sits on a queue's waiter list.
    pub queue_filter: QueueFilter,
    /// Mirrors the processor's V flag following this task's last SWI
    /// return (spec §7): `crate::arch`'s return-to-user path consults this
    /// to decide whether to set V before restoring `svc_registers`.
    pub error_flag: bool,
    in_use: bool,
    link: Link<OSTask>,
}

unsafe impl Node for OSTask {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

impl OSTask {
    const fn empty() -> Self {
        OSTask {
            svc_registers: [0; SVC_REGISTER_COUNT],
            user_sp: 0,
            user_lr: 0,
            resumes: -1,
            slot: 0,
            extras: Extras::None,
            membership: Membership::Free,
            queue_swi: 0,
            queue_core: 0,
            controller: None,
            queue_filter: QueueFilter {
                match_swi: None,
                match_core: None,
            },
            error_flag: false,
            in_use: false,
            link: Link::new(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::from_raw(self as *const OSTask as u32)
    }

    pub fn is_blocked(&self) -> bool {
        self.resumes < 0
    }
}

/// Validates a task handle, recovering the pointer it encodes. A handle
/// that doesn't decode to a live, in-use pool slot is
/// [`UsageError::BadTaskHandle`].
///
/// # Safety
/// The returned pointer is only valid as long as the pool entry it names
/// stays allocated; callers must not retain it past a point where the
/// task could be freed.
pub unsafe fn resolve_handle(
    pool: &TaskPool,
    handle: TaskHandle,
) -> Result<NonNull<OSTask>, UsageError> {
    let addr = handle.to_raw();
    let base = pool.tasks.get() as usize;
    let end = base + core::mem::size_of::<[OSTask; TASK_POOL_CAPACITY]>();
    if (addr as usize) < base
        || (addr as usize) >= end
        || (addr as usize - base) % core::mem::size_of::<OSTask>() != 0
    {
        return Err(UsageError::BadTaskHandle);
    }
    let ptr = addr as *mut OSTask;
    unsafe {
        if !(*ptr).in_use {
            return Err(UsageError::BadTaskHandle);
        }
        Ok(NonNull::new_unchecked(ptr))
    }
}

pub struct TaskPool {
    lock: KernelLock,
    tasks: UnsafeCell<[OSTask; TASK_POOL_CAPACITY]>,
}

unsafe impl Sync for TaskPool {}

impl TaskPool {
    pub const fn new() -> Self {
        const EMPTY: OSTask = OSTask::empty();
        TaskPool {
            lock: KernelLock::new(),
            tasks: UnsafeCell::new([EMPTY; TASK_POOL_CAPACITY]),
        }
    }

    /// Pulls a free `OSTask` from the pool, wires up its initial saved
    /// state so that returning from the creating SWI into user mode runs
    /// `entry` with `sp` as the user stack pointer, and marks it
    /// runnable. Does not attach it to any list; the caller (`Create`/
    /// `Spawn`) does that with knowledge of which core to favour.
    pub fn alloc(
        &self,
        entry: u32,
        sp: u32,
        args: &[u32],
        slot: usize,
        core: u32,
    ) -> Result<NonNull<OSTask>, UsageError> {
        self.lock.with(core, || {
            let tasks = unsafe { &mut *self.tasks.get() };
            let task = tasks
                .iter_mut()
                .find(|t| !t.in_use)
                .ok_or(UsageError::OutOfHeap)?;
            *task = OSTask::empty();
            task.in_use = true;
            task.slot = slot;
            task.user_sp = sp;
            task.user_lr = 0;
            // r0..r3 carry the entry point's first four arguments; the
            // saved link-register slot is the address the SWI-return path
            // resumes at, seeded here with `entry` so `Create`/`Spawn`'s
            // caller returns straight into the new task on first dispatch.
            for (i, a) in args.iter().take(4).enumerate() {
                task.svc_registers[i] = *a;
            }
            task.svc_registers[SVC_REGISTER_COUNT - 2] = entry;
            task.resumes = 0;
            task.membership = Membership::Free;
            Ok(unsafe { NonNull::new_unchecked(task as *mut OSTask) })
        })
    }

    pub fn free(&self, task: NonNull<OSTask>, core: u32) {
        self.lock.with(core, || unsafe {
            (*task.as_ptr()).in_use = false;
            (*task.as_ptr()).membership = Membership::Free;
        })
    }

    /// Counts live tasks whose `slot` is `slot`, for `EndTask`'s
    /// frees-the-slot decision (`crate::swi`).
    pub fn count_slot_users(&self, slot: usize, core: u32) -> usize {
        self.lock.with(core, || {
            let tasks = unsafe { &*self.tasks.get() };
            tasks.iter().filter(|t| t.in_use && t.slot == slot).count()
        })
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeping list entries are kept in delta order: each node's
/// `Extras::SleepDelta` is the number of ticks past its predecessor's
/// wake time. The list itself is a plain [`List`] behind a [`KernelLock`]
/// since walking it to find the insertion point can't be expressed as a
/// single head-only MP-safe op.
pub struct SleepList {
    lock: KernelLock,
    list: UnsafeCell<List<OSTask>>,
}

unsafe impl Sync for SleepList {}

impl SleepList {
    pub const fn new() -> Self {
        SleepList {
            lock: KernelLock::new(),
            list: UnsafeCell::new(List::new()),
        }
    }

    /// Inserts `task` so that its accumulated delta from the list head
    /// equals `ticks`, decrementing whichever successor it displaces.
    pub fn insert(&self, task: NonNull<OSTask>, ticks: u32, core: u32) {
        self.lock.with(core, || unsafe {
            let list = &mut *self.list.get();
            let mut remaining = ticks;
            let mut cursor = list.head();
            while let Some(node) = cursor {
                let delta = match node.as_ref().extras {
                    Extras::SleepDelta(d) => d,
                    _ => unreachable!("non-sleep node in sleep list"),
                };
                if remaining < delta {
                    (*node.as_ptr()).extras = Extras::SleepDelta(delta - remaining);
                    break;
                }
                remaining -= delta;
                let next = node.as_ref().link().next().unwrap();
                cursor = if next == list.head().unwrap() {
                    None
                } else {
                    Some(next)
                };
            }
            (*task.as_ptr()).extras = Extras::SleepDelta(remaining);
            (*task.as_ptr()).membership = Membership::Sleeping;
            match cursor {
                Some(before) => list.insert_before(before, task),
                None => list.push_back(task),
            }
        })
    }

    /// Ticks the list by one unit, detaching every task whose wake time
    /// has just been reached (head-delta hits zero, possibly more than
    /// one in a row) and returning them for the caller to move onto
    /// `runnable`.
    pub fn tick(&self, core: u32) -> List<OSTask> {
        self.lock.with(core, || unsafe {
            let list = &mut *self.list.get();
            let Some(head) = list.head() else {
                return List::new();
            };
            let delta = match head.as_ref().extras {
                Extras::SleepDelta(d) => d,
                _ => unreachable!(),
            };
            if delta > 1 {
                (*head.as_ptr()).extras = Extras::SleepDelta(delta - 1);
                return List::new();
            }
            // delta has reached (at most) 1: head wakes this tick, and so
            // does any run of subsequent zero-delta entries.
            let mut last = head;
            loop {
                let next = last.as_ref().link().next().unwrap();
                if next == head {
                    break;
                }
                let d = match next.as_ref().extras {
                    Extras::SleepDelta(d) => d,
                    _ => unreachable!(),
                };
                if d == 0 {
                    last = next;
                } else {
                    break;
                }
            }
            list.detach_until(last)
        })
    }
}

impl Default for SleepList {
    fn default() -> Self {
        Self::new()
    }
}

/// All the cross-core scheduling lists from spec §4.5, plus one running
/// list per core.
pub struct Scheduler {
    pub running: [UnsafeCell<List<OSTask>>; MAX_CORES],
    pub runnable: MpList<OSTask>,
    pub sleeping: SleepList,
    pub blocked: MpList<OSTask>,
    pub moving: MpList<OSTask>,
}

unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub const fn new() -> Self {
        const EMPTY: UnsafeCell<List<OSTask>> = UnsafeCell::new(List::new());
        Scheduler {
            running: [EMPTY; MAX_CORES],
            runnable: MpList::new(),
            sleeping: SleepList::new(),
            blocked: MpList::new(),
            moving: MpList::new(),
        }
    }

    pub(crate) fn running_list(&self, core: u32) -> &mut List<OSTask> {
        unsafe { &mut *self.running[core as usize].get() }
    }

    pub fn current(&self, core: u32) -> Option<NonNull<OSTask>> {
        self.running_list(core).head()
    }

    /// `Yield`: if the caller is the idle task (alone on its per-core
    /// list) and `runnable` has nothing for us, stay put. Otherwise
    /// rotate the running list (pushing the caller to its tail) or, if
    /// alone, pull one entry off `runnable`.
    pub fn yield_current(&self, core: u32) {
        let running = self.running_list(core);
        let Some(head) = running.head() else { return };
        unsafe {
            let alone = head.as_ref().link().next().unwrap() == head;
            if !alone {
                running.rotate();
            } else if let Some(woken) = self.runnable.detach_at_head() {
                running.detach(head);
                (*head.as_ptr()).membership = Membership::Runnable;
                self.runnable.insert_at_tail(head);
                (*woken.as_ptr()).membership = Membership::Running(core);
                running.push_back(woken);
            }
        }
        crate::arch::signal_event();
    }

    /// `Sleep(ms)`: detach the caller from its running list and park it
    /// on `shared.sleeping` at the position `ms` ticks out.
    pub fn sleep_current(&self, core: u32, ticks: u32) {
        let running = self.running_list(core);
        if let Some(task) = running.head() {
            unsafe { running.detach(task) };
            self.sleeping.insert(task, ticks, core);
        }
    }

    /// `Tick`: moves every task whose sleep has elapsed onto `runnable`.
    pub fn tick(&self, core: u32) {
        let woken = self.sleeping.tick(core);
        while let Some(task) = woken.pop_front() {
            unsafe { (*task.as_ptr()).membership = Membership::Runnable };
            self.runnable.insert_at_tail(task);
        }
    }

    /// `Create`: injects `task` immediately after the calling core's
    /// current head, so it shares the creator's core until it yields.
    pub fn inject_after_current(&self, core: u32, task: NonNull<OSTask>) {
        let running = self.running_list(core);
        unsafe {
            (*task.as_ptr()).membership = Membership::Running(core);
            if let Some(head) = running.head() {
                running.insert_after(head, task);
            } else {
                running.push_back(task);
            }
        }
    }

    /// `WaitForInterrupt`: detach the caller from running; the IRQ
    /// vector (see `crate::irq`) is responsible for reattaching it once
    /// the interrupt fires.
    pub fn block_for_interrupt(&self, core: u32) -> Option<NonNull<OSTask>> {
        let running = self.running_list(core);
        let task = running.head()?;
        unsafe {
            running.detach(task);
            (*task.as_ptr()).resumes = -1;
        }
        Some(task)
    }

    /// Moves a previously-detached task onto `runnable`, e.g. from the
    /// IRQ vector or a lock release.
    pub fn wake(&self, task: NonNull<OSTask>) {
        unsafe {
            (*task.as_ptr()).resumes = 0;
            (*task.as_ptr()).membership = Membership::Runnable;
        }
        self.runnable.insert_at_tail(task);
    }

    /// IRQ vector wake: inserts a task that was blocked in
    /// `WaitForInterrupt` at the *head* of `core`'s running list, making it
    /// the new current task per spec §4.9, displacing whatever was running
    /// without detaching it.
    pub fn irq_wake(&self, core: u32, task: NonNull<OSTask>) {
        let running = self.running_list(core);
        unsafe {
            (*task.as_ptr()).resumes = 0;
            (*task.as_ptr()).membership = Membership::Running(core);
            if running.is_empty() {
                running.push_back(task);
            } else {
                running.push_front(task);
            }
        }
    }

    /// `ChangeController`/`ReleaseTask` support: detaches `task` from
    /// wherever it is (running or blocked) so a queue handler can hold
    /// it; `ReleaseTask` re-injects it via `wake`.
    pub fn detach_anywhere(&self, core: u32, task: NonNull<OSTask>) {
        let running = self.running_list(core);
        unsafe {
            if (*task.as_ptr()).membership == Membership::Running(core) {
                running.detach(task);
            }
        }
        unsafe { (*task.as_ptr()).membership = Membership::OnQueue };
    }

    /// `SwitchToCore(target)`: detaches the caller from `core`'s running
    /// list and parks it on `shared.moving` addressed to `target`; some
    /// later `reschedule(target)` picks it up (spec §4.5).
    pub fn switch_to_core(&self, core: u32, target: u32, task: NonNull<OSTask>) {
        unsafe {
            self.running_list(core).detach(task);
            (*task.as_ptr()).membership = Membership::Moving(target);
        }
        self.moving.insert_at_tail(task);
    }

    /// Keeps `core`'s running list non-empty after an operation that may
    /// have emptied it (a block, a sleep, an `EndTask`): first claims any
    /// `shared.moving` entry addressed here, then falls back to
    /// `shared.runnable`. There is no resident idle `OSTask` (spec §5) --
    /// when neither list has anything for this core, the running list
    /// stays empty and `crate::arch`'s boot/idle loop is expected to
    /// `wait_for_event()` and retry.
    pub fn reschedule(&self, core: u32) -> bool {
        let running = self.running_list(core);
        if running.head().is_some() {
            return false;
        }
        let moved = self.moving.manipulate(|list| {
            list.find_map(|candidate| unsafe {
                match candidate.as_ref().membership {
                    Membership::Moving(c) if c == core => {
                        list.detach(candidate);
                        Some(candidate)
                    }
                    _ => None,
                }
            })
        });
        let next = moved.or_else(|| self.runnable.detach_at_head());
        match next {
            Some(task) => {
                unsafe {
                    (*task.as_ptr()).resumes = 0;
                    (*task.as_ptr()).membership = Membership::Running(core);
                }
                running.push_back(task);
                true
            }
            None => false,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

pub static TASKS: TaskPool = TaskPool::new();
pub static SLOTS: SlotPool = SlotPool::new();
pub static SCHED: Scheduler = Scheduler::new();

/// `Create`/`Spawn` entry point shared by the two SWIs; `new_slot` is
/// `Some(asid)` for `Spawn`, `None` for `Create` (inherit the caller's
/// slot).
pub fn create_task(
    entry: u32,
    sp: u32,
    args: &[u32],
    caller_slot: usize,
    new_slot: Option<u8>,
    core: u32,
) -> Result<TaskHandle, UsageError> {
    let slot = match new_slot {
        Some(asid) => SLOTS.alloc(asid, core).ok_or(UsageError::OutOfHeap)?,
        None => caller_slot,
    };
    let task = TASKS.alloc(entry, sp, args, slot, core)?;
    let handle = unsafe { task.as_ref().handle() };
    SCHED.inject_after_current(core, task);
    Ok(handle)
}

/// `EndTask`: releases the `OSTask` and, if it owned a private slot (not
/// shared with any other live task), the slot too. Slot-sharing
/// refcounting is left to the caller (`crate::swi`), which knows whether
/// the slot was freshly `Spawn`ed for this task alone.
pub fn end_task(task: NonNull<OSTask>, frees_slot: bool, core: u32) {
    let slot = unsafe { task.as_ref().slot };
    TASKS.free(task, core);
    if frees_slot {
        SLOTS.free(slot, core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_injects_after_current_core() {
        let caller = TASKS.alloc(0, 0, &[], 0, 0).unwrap();
        SCHED.inject_after_current(0, caller);

        let handle =
            create_task(0x1000, 0x2000, &[1, 2], 0, None, 0).unwrap();
        let created = unsafe { resolve_handle(&TASKS, handle).unwrap() };

        let running = SCHED.running_list(0);
        assert_eq!(running.head(), Some(caller));
        unsafe {
            assert_eq!(caller.as_ref().link().next(), Some(created));
        }

        end_task(created, false, 0);
        unsafe { SCHED.running_list(0).detach(caller) };
        TASKS.free(caller, 0);
    }

    #[test]
    fn yield_rotates_running_list() {
        let a = TASKS.alloc(0, 0, &[], 0, 1).unwrap();
        let b = TASKS.alloc(0, 0, &[], 0, 1).unwrap();
        let running = SCHED.running_list(1);
        unsafe {
            running.push_back(a);
            running.push_back(b);
        }
        assert_eq!(running.head(), Some(a));
        SCHED.yield_current(1);
        assert_eq!(running.head(), Some(b));

        unsafe {
            running.detach(a);
            running.detach(b);
        }
        TASKS.free(a, 1);
        TASKS.free(b, 1);
    }

    #[test]
    fn sleep_then_ticks_to_wake() {
        let t = TASKS.alloc(0, 0, &[], 0, 2).unwrap();
        unsafe { SCHED.running_list(2).push_back(t) };
        SCHED.sleep_current(2, 3);
        SCHED.tick(2);
        SCHED.tick(2);
        assert!(SCHED.runnable.is_empty());
        SCHED.tick(2);
        assert!(!SCHED.runnable.is_empty());
        let woken = SCHED.runnable.detach_at_head().unwrap();
        assert_eq!(woken, t);
        TASKS.free(t, 2);
    }

    #[test]
    fn reschedule_pulls_from_runnable() {
        let t = TASKS.alloc(0, 0, &[], 0, 5).unwrap();
        SCHED.wake(t);
        assert!(SCHED.running_list(5).is_empty());
        assert!(SCHED.reschedule(5));
        assert_eq!(SCHED.running_list(5).head(), Some(t));
        unsafe { SCHED.running_list(5).detach(t) };
        TASKS.free(t, 5);
    }

    #[test]
    fn switch_to_core_then_reschedule_moves_task() {
        let t = TASKS.alloc(0, 0, &[], 0, 6).unwrap();
        unsafe { SCHED.running_list(6).push_back(t) };
        SCHED.switch_to_core(6, 7, t);
        assert!(SCHED.running_list(6).is_empty());
        assert!(SCHED.running_list(7).is_empty());
        assert!(SCHED.reschedule(7));
        assert_eq!(SCHED.running_list(7).head(), Some(t));
        unsafe { SCHED.running_list(7).detach(t) };
        TASKS.free(t, 7);
    }

    #[test]
    fn count_slot_users_reflects_live_tasks() {
        let a = TASKS.alloc(0, 0, &[], 9, 0).unwrap();
        let b = TASKS.alloc(0, 0, &[], 9, 0).unwrap();
        assert_eq!(TASKS.count_slot_users(9, 0), 2);
        TASKS.free(a, 0);
        assert_eq!(TASKS.count_slot_users(9, 0), 1);
        TASKS.free(b, 0);
        assert_eq!(TASKS.count_slot_users(9, 0), 0);
    }
}
