// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L6: fixed-capacity single-producer/single-consumer byte-ring pipes.
//!
//! A pipe's ring lives in a run of physical pages claimed from
//! [`crate::rawpage::POOL`]; `write`/`read` are monotonic `u32` cursors, so
//! the bytes currently buffered are always `write - read` (wrapping
//! subtraction, spec §3). Double-mapped pipes (`max_data == 0` at creation)
//! get the same physical range mapped twice back-to-back so a caller can
//! always read or write a contiguous `cursor % max_block_size` span without
//! special-casing the wraparound -- see SPEC_FULL.md's discussion of this
//! tradeoff against the alternative of a scatter/gather copy loop.

use core::ptr::NonNull;

use abi::{MappingType, PipeHandle, UsageError};

use crate::mmu::{self, Mapping};
use crate::rawpage::{self, PAGE_SIZE};
use crate::spinlock::KernelLock;
use crate::task::{self, AppMemoryBlock, OSTask};

pub const PIPE_POOL_CAPACITY: usize = 32;

/// Base of the virtual-address region pipes are lazily mapped into. Chosen
/// well clear of the task image and heap regions statically reserved by
/// `crate::startup`.
const PIPE_VA_BASE: u32 = 0x6000_0000;
const PIPE_VA_STRIDE: u32 = 0x0020_0000; // 2 MiB: room for a max-size double map.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Endpoint {
    /// Not yet claimed by any task; the next blocking call on this side
    /// claims it (spec §4.7: "the sender field is null").
    Unclaimed,
    Owned(NonNull<OSTask>),
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Side {
    Sender,
    Receiver,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Sender => Side::Receiver,
            Side::Receiver => Side::Sender,
        }
    }
}

/// What a successful `WaitForSpace`/`WaitForData` returns immediately,
/// without blocking.
#[derive(Copy, Clone, Debug)]
pub struct PipeReady {
    pub available: u32,
    pub va: u32,
}

/// Outcome of a wait call: either it's satisfied immediately, or the caller
/// has been detached from its core's running list and the SWI dispatcher
/// must not resume it.
pub enum WaitOutcome {
    Ready(PipeReady),
    Blocked,
}

struct Pipe {
    in_use: bool,
    max_block_size: u32,
    base_page: u32,
    pages: u32,
    double_mapped: bool,
    /// Per-core debug pipe: mapped once at boot, exempt from `SetSender`'s
    /// unmap-and-lazily-remap dance (spec §4.7 edge case).
    debug: bool,
    write: u32,
    read: u32,
    sender: Endpoint,
    receiver: Endpoint,
    sender_waiting_for: u32,
    receiver_waiting_for: u32,
    sender_va: Option<u32>,
    receiver_va: Option<u32>,
}

impl Pipe {
    const fn empty() -> Self {
        Pipe {
            in_use: false,
            max_block_size: 0,
            base_page: 0,
            pages: 0,
            double_mapped: false,
            debug: false,
            write: 0,
            read: 0,
            sender: Endpoint::Closed,
            receiver: Endpoint::Closed,
            sender_waiting_for: 0,
            receiver_waiting_for: 0,
            sender_va: None,
            receiver_va: None,
        }
    }

    fn endpoint(&self, side: Side) -> Endpoint {
        match side {
            Side::Sender => self.sender,
            Side::Receiver => self.receiver,
        }
    }

    fn set_endpoint(&mut self, side: Side, ep: Endpoint) {
        match side {
            Side::Sender => self.sender = ep,
            Side::Receiver => self.receiver = ep,
        }
    }

    fn waiting_for(&self, side: Side) -> u32 {
        match side {
            Side::Sender => self.sender_waiting_for,
            Side::Receiver => self.receiver_waiting_for,
        }
    }

    fn set_waiting_for(&mut self, side: Side, n: u32) {
        match side {
            Side::Sender => self.sender_waiting_for = n,
            Side::Receiver => self.receiver_waiting_for = n,
        }
    }

    fn va(&self, side: Side) -> Option<u32> {
        match side {
            Side::Sender => self.sender_va,
            Side::Receiver => self.receiver_va,
        }
    }

    fn set_va(&mut self, side: Side, va: Option<u32>) {
        match side {
            Side::Sender => self.sender_va = va,
            Side::Receiver => self.receiver_va = va,
        }
    }

    /// Bytes the sender side could write right now without overrunning the
    /// receiver, i.e. free space in the ring.
    fn space_available(&self) -> u32 {
        self.max_block_size - self.write.wrapping_sub(self.read)
    }

    /// Bytes the receiver side could read right now.
    fn data_available(&self) -> u32 {
        self.write.wrapping_sub(self.read)
    }
}

struct PipePool {
    lock: KernelLock,
    pipes: core::cell::UnsafeCell<[Pipe; PIPE_POOL_CAPACITY]>,
}

unsafe impl Sync for PipePool {}

impl PipePool {
    const fn new() -> Self {
        const EMPTY: Pipe = Pipe::empty();
        PipePool {
            lock: KernelLock::new(),
            pipes: core::cell::UnsafeCell::new([EMPTY; PIPE_POOL_CAPACITY]),
        }
    }

    fn alloc(&self, core: u32) -> Option<NonNull<Pipe>> {
        self.lock.with(core, || {
            let pipes = unsafe { &mut *self.pipes.get() };
            let slot = pipes.iter_mut().find(|p| !p.in_use)?;
            slot.in_use = true;
            Some(unsafe { NonNull::new_unchecked(slot as *mut Pipe) })
        })
    }

    fn free(&self, pipe: NonNull<Pipe>, core: u32) {
        self.lock.with(core, || unsafe {
            *pipe.as_ptr() = Pipe::empty();
        })
    }

    fn resolve(&self, handle: PipeHandle) -> Result<NonNull<Pipe>, UsageError> {
        let addr = handle.to_raw();
        let base = self.pipes.get() as usize;
        let end = base + core::mem::size_of::<[Pipe; PIPE_POOL_CAPACITY]>();
        if (addr as usize) < base
            || (addr as usize) >= end
            || (addr as usize - base) % core::mem::size_of::<Pipe>() != 0
        {
            return Err(UsageError::BadHandle);
        }
        let ptr = addr as *mut Pipe;
        unsafe {
            if !(*ptr).in_use {
                return Err(UsageError::BadHandle);
            }
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    fn handle_of(&self, pipe: NonNull<Pipe>) -> PipeHandle {
        PipeHandle::from_raw(pipe.as_ptr() as u32)
    }
}

static PIPES: PipePool = PipePool::new();

fn set_return(task: NonNull<OSTask>, r0: u32, r1: u32) {
    unsafe {
        (*task.as_ptr()).svc_registers[0] = r0;
        (*task.as_ptr()).svc_registers[1] = r1;
    }
}

/// Finds a free gap in `caller`'s slot's pipe-VA array and maps `pipe`'s
/// ring into it for `side`, lazily, on the first blocking call from that
/// side (spec §4.7).
fn assign_va(
    pipe: &mut Pipe,
    side: Side,
    caller: NonNull<OSTask>,
    core: u32,
) -> Result<u32, UsageError> {
    if let Some(va) = pipe.va(side) {
        return Ok(va);
    }
    let slot_index = unsafe { caller.as_ref().slot };
    let slot = unsafe { &mut *task::SLOTS.get(slot_index) };
    let gap = slot
        .pipe_mappings
        .iter()
        .position(|m| m.is_none())
        .ok_or(UsageError::MemoryBlockOverflow)?;
    let va = PIPE_VA_BASE + gap as u32 * PIPE_VA_STRIDE;
    let span = if pipe.double_mapped {
        pipe.pages * 2
    } else {
        pipe.pages
    };
    mmu::MMU.map_memory(
        Mapping {
            base_page: pipe.base_page,
            pages: pipe.pages,
            va,
            mapping_type: MappingType::Rw,
            all_cores: false,
            usr32_access: true,
            not_shared: false,
        },
        core,
    )?;
    if pipe.double_mapped {
        mmu::MMU.map_memory(
            Mapping {
                base_page: pipe.base_page,
                pages: pipe.pages,
                va: va + pipe.pages * PAGE_SIZE,
                mapping_type: MappingType::Rw,
                all_cores: false,
                usr32_access: true,
                not_shared: false,
            },
            core,
        )?;
    }
    slot.pipe_mappings[gap] = Some(AppMemoryBlock {
        va_page: va / PAGE_SIZE,
        pages: span,
        page_base: pipe.base_page,
        device: false,
        read_only: false,
    });
    pipe.set_va(side, Some(va));
    Ok(va)
}

fn release_va(pipe: &mut Pipe, side: Side, owner: NonNull<OSTask>) {
    if pipe.debug {
        return;
    }
    if let Some(va) = pipe.va(side) {
        let slot_index = unsafe { owner.as_ref().slot };
        let slot = unsafe { &mut *task::SLOTS.get(slot_index) };
        for m in slot.pipe_mappings.iter_mut() {
            if matches!(m, Some(b) if b.va_page == va / PAGE_SIZE) {
                *m = None;
            }
        }
    }
    pipe.set_va(side, None);
}

/// `PipeCreate(max_block, max_data, user_memory)`. `max_data == 0` requests
/// a double-mapped ring (spec §4.7).
pub fn create(
    max_block: u32,
    max_data: u32,
    creator: NonNull<OSTask>,
    core: u32,
) -> Result<PipeHandle, UsageError> {
    if max_block == 0 || max_block % PAGE_SIZE != 0 {
        return Err(UsageError::BadArgument);
    }
    let pages = max_block / PAGE_SIZE;
    let base_page = rawpage::POOL.claim_contiguous(pages, core)?;
    let Some(pipe) = PIPES.alloc(core) else {
        rawpage::POOL.free_contiguous(base_page, pages, core);
        return Err(UsageError::OutOfHeap);
    };
    unsafe {
        *pipe.as_ptr() = Pipe {
            in_use: true,
            max_block_size: max_block,
            base_page,
            pages,
            double_mapped: max_data == 0,
            debug: false,
            write: 0,
            read: 0,
            sender: Endpoint::Owned(creator),
            receiver: Endpoint::Owned(creator),
            sender_waiting_for: 0,
            receiver_waiting_for: 0,
            sender_va: None,
            receiver_va: None,
        };
    }
    Ok(PIPES.handle_of(pipe))
}

fn claim_or_check(
    pipe: &mut Pipe,
    side: Side,
    caller: NonNull<OSTask>,
) -> Result<(), UsageError> {
    match pipe.endpoint(side) {
        Endpoint::Owned(owner) if owner == caller => Ok(()),
        Endpoint::Unclaimed => {
            pipe.set_endpoint(side, Endpoint::Owned(caller));
            Ok(())
        }
        Endpoint::Owned(_) | Endpoint::Closed => Err(UsageError::PipeNotOwned),
    }
}

fn wait(
    handle: PipeHandle,
    side: Side,
    n: u32,
    caller: NonNull<OSTask>,
    core: u32,
) -> Result<WaitOutcome, UsageError> {
    let ptr = PIPES.resolve(handle)?;
    let pipe = unsafe { &mut *ptr.as_ptr() };
    claim_or_check(pipe, side, caller)?;
    let va = assign_va(pipe, side, caller, core)?;

    let available = match side {
        Side::Sender => pipe.space_available(),
        Side::Receiver => pipe.data_available(),
    };
    let other_closed = pipe.endpoint(side.other()) == Endpoint::Closed;
    if available >= n || other_closed {
        pipe.set_waiting_for(side, 0);
        return Ok(WaitOutcome::Ready(PipeReady { available, va }));
    }
    pipe.set_waiting_for(side, n);
    task::SCHED
        .block_for_interrupt(core)
        .ok_or(UsageError::BadArgument)?;
    Ok(WaitOutcome::Blocked)
}

/// `PipeWaitForSpace(pipe, n)`.
pub fn wait_for_space(
    handle: PipeHandle,
    n: u32,
    caller: NonNull<OSTask>,
    core: u32,
) -> Result<WaitOutcome, UsageError> {
    wait(handle, Side::Sender, n, caller, core)
}

/// `PipeWaitForData(pipe, n)`.
pub fn wait_for_data(
    handle: PipeHandle,
    n: u32,
    caller: NonNull<OSTask>,
    core: u32,
) -> Result<WaitOutcome, UsageError> {
    wait(handle, Side::Receiver, n, caller, core)
}

fn signal(handle: PipeHandle, side: Side, n: u32) -> Result<(), UsageError> {
    let ptr = PIPES.resolve(handle)?;
    let pipe = unsafe { &mut *ptr.as_ptr() };
    let room = match side {
        Side::Sender => pipe.space_available(),
        Side::Receiver => pipe.data_available(),
    };
    if n > room {
        return Err(UsageError::PipeFull);
    }
    match side {
        Side::Sender => pipe.write = pipe.write.wrapping_add(n),
        Side::Receiver => pipe.read = pipe.read.wrapping_add(n),
    }

    let other = side.other();
    let waiting = pipe.waiting_for(other);
    if waiting == 0 {
        return Ok(());
    }
    let now_available = match other {
        Side::Sender => pipe.space_available(),
        Side::Receiver => pipe.data_available(),
    };
    if now_available < waiting {
        return Ok(());
    }
    if let Endpoint::Owned(task) = pipe.endpoint(other) {
        pipe.set_waiting_for(other, 0);
        let va = pipe.va(other).unwrap_or(0);
        set_return(task, now_available, va);
        task::SCHED.wake(task);
    }
    Ok(())
}

/// `PipeSpaceFilled(pipe, n)`.
pub fn space_filled(handle: PipeHandle, n: u32) -> Result<(), UsageError> {
    signal(handle, Side::Sender, n)
}

/// `PipeDataConsumed(pipe, n)`.
pub fn data_consumed(handle: PipeHandle, n: u32) -> Result<(), UsageError> {
    signal(handle, Side::Receiver, n)
}

fn set_owner(
    handle: PipeHandle,
    side: Side,
    new_owner: Option<NonNull<OSTask>>,
    core: u32,
) -> Result<(), UsageError> {
    let ptr = PIPES.resolve(handle)?;
    let pipe = unsafe { &mut *ptr.as_ptr() };
    if let Endpoint::Owned(prev) = pipe.endpoint(side) {
        release_va(pipe, side, prev);
    }
    let _ = core;
    pipe.set_endpoint(
        side,
        match new_owner {
            Some(t) => Endpoint::Owned(t),
            None => Endpoint::Unclaimed,
        },
    );
    Ok(())
}

/// `PipeSetSender(pipe, new_task)`.
pub fn set_sender(
    handle: PipeHandle,
    new_task: Option<NonNull<OSTask>>,
    core: u32,
) -> Result<(), UsageError> {
    set_owner(handle, Side::Sender, new_task, core)
}

/// `PipeSetReceiver(pipe, new_task)`.
pub fn set_receiver(
    handle: PipeHandle,
    new_task: Option<NonNull<OSTask>>,
    core: u32,
) -> Result<(), UsageError> {
    set_owner(handle, Side::Receiver, new_task, core)
}

fn close(handle: PipeHandle, side: Side, core: u32) -> Result<(), UsageError> {
    let ptr = PIPES.resolve(handle)?;
    let pipe = unsafe { &mut *ptr.as_ptr() };
    pipe.set_endpoint(side, Endpoint::Closed);
    let both_closed =
        pipe.sender == Endpoint::Closed && pipe.receiver == Endpoint::Closed;
    if both_closed {
        rawpage::POOL.free_contiguous(pipe.base_page, pipe.pages, core);
        PIPES.free(ptr, core);
    }
    Ok(())
}

/// `PipeNotListening(pipe)`: the receiver is going away.
pub fn not_listening(handle: PipeHandle, core: u32) -> Result<(), UsageError> {
    close(handle, Side::Receiver, core)
}

/// `PipeNoMoreData(pipe)`: the sender is going away.
pub fn no_more_data(handle: PipeHandle, core: u32) -> Result<(), UsageError> {
    close(handle, Side::Sender, core)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_heap_once() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let region: &'static mut [u8] =
                Box::leak(vec![0u8; 1 << 16].into_boxed_slice());
            unsafe { crate::heap::PRIVILEGED.init(region, 0) };
            rawpage::POOL.init(0, rawpage::PAGES_PER_SECTION * 4, 0);
        });
    }

    fn make_task(core: u32) -> NonNull<OSTask> {
        task::TASKS.alloc(0, 0, &[], 0, core).unwrap()
    }

    #[test]
    fn space_filled_wakes_blocked_receiver() {
        init_heap_once();
        let sender = make_task(0);
        let receiver = make_task(1);
        unsafe { task::SCHED.running_list(1).push_back(receiver) };

        let handle = create(PAGE_SIZE, 1, sender, 0).unwrap();
        set_receiver(handle, Some(receiver), 1).unwrap();

        match wait_for_data(handle, 10, receiver, 1).unwrap() {
            WaitOutcome::Blocked => {}
            WaitOutcome::Ready(_) => panic!("expected to block on empty pipe"),
        }
        assert!(task::SCHED.running_list(1).is_empty());

        match wait_for_space(handle, 10, sender, 0).unwrap() {
            WaitOutcome::Ready(ready) => assert_eq!(ready.available, PAGE_SIZE),
            WaitOutcome::Blocked => panic!("sender should not block on empty pipe"),
        }
        space_filled(handle, 10).unwrap();

        assert!(!task::SCHED.runnable.is_empty());
        let woken = task::SCHED.runnable.detach_at_head().unwrap();
        assert_eq!(woken, receiver);
        assert_eq!(unsafe { receiver.as_ref().svc_registers[0] }, 10);

        not_listening(handle, 1).unwrap();
        no_more_data(handle, 0).unwrap();
        task::TASKS.free(sender, 0);
        task::TASKS.free(receiver, 1);
    }

    #[test]
    fn space_filled_past_capacity_is_pipe_full() {
        init_heap_once();
        let t = make_task(0);
        let handle = create(PAGE_SIZE, 1, t, 0).unwrap();
        assert!(matches!(
            space_filled(handle, PAGE_SIZE + 1),
            Err(UsageError::PipeFull)
        ));
        not_listening(handle, 0).unwrap();
        no_more_data(handle, 0).unwrap();
        task::TASKS.free(t, 0);
    }

    #[test]
    fn bad_handle_is_rejected() {
        init_heap_once();
        let bogus = PipeHandle::from_raw(0xdead_beef);
        assert!(matches!(
            space_filled(bogus, 1),
            Err(UsageError::BadHandle)
        ));
    }
}
