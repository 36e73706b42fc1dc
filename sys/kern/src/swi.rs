// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L9 (dispatch half): decodes a trapped SWI number into an operation on
//! one of the portable kernel modules, per the external interface table
//! (spec §6) and the X-form/legacy error propagation split (spec §7).
//!
//! `crate::arch`'s SVC entry stub is the only caller of [`dispatch`]: by
//! the time it gets here, the trapping task's registers are already saved
//! into its `OSTask::svc_registers`, and the stub has pulled the SWI
//! immediate out of the trapping instruction itself (ARM encodes it in the
//! low 24 bits, not a register, so that decode stays arch-specific).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use abi::{
    MappingType, ModuleSwi, PipeHandle, QueueHandle, Swi, TaskHandle, UsageError,
};

use crate::err::{self, ErrorForm};
use crate::locks::{self, ClaimOutcome, LockWord};
use crate::module::{self, ModuleAction};
use crate::pipe::{self, WaitOutcome as PipeWait};
use crate::queue::{self, WaitOutcome as QueueWait};
use crate::task::{self, OSTask, QueueFilter, SVC_REGISTER_COUNT};
use crate::{irq, mmu};

/// Bit OR'd into the raw trapped SWI number for the `X` calling convention
/// (spec §7): the caller wants the `ErrorBlock` back in-band (V set, R0 =
/// pointer) rather than have the kernel redirect it through the legacy
/// `GenerateError` vector. Chosen well clear of the numbered ranges in
/// spec §6 (all of which fit in the low 17 bits).
pub const X_FORM_BIT: u32 = 1 << 17;

/// What `crate::arch`'s SVC return path should do once [`dispatch`]
/// returns.
pub enum Resume {
    /// Restore whichever task is now `task::SCHED.current(core)` and
    /// return to user mode. Not necessarily the original caller -- it may
    /// have blocked, yielded, migrated to another core, or been displaced
    /// by an injected handler.
    ContinueCurrent,
    /// The caller issued `EndTask`; there is nothing of it left to
    /// restore.
    Ended,
}

static NEXT_ASID: AtomicU8 = AtomicU8::new(1);

/// Hands out the next unused ASID. `crate::startup` calls this once per
/// primordial task before `Spawn` ever runs, so the two never collide.
pub(crate) fn alloc_asid() -> u8 {
    NEXT_ASID.fetch_add(1, Ordering::Relaxed)
}

/// Per-core scratch for the `ErrorBlock` a failed SWI points its caller's
/// R0 at (spec §7). Good until the next SWI on that core fails, which is
/// all a synchronous error-reporting convention needs.
static mut ERROR_SCRATCH: [abi::ErrorBlock; task::MAX_CORES] = [abi::ErrorBlock {
    code: 0,
    desc: [0u8; abi::ERROR_DESC_LEN],
}; task::MAX_CORES];

fn current(core: u32) -> NonNull<OSTask> {
    task::SCHED
        .current(core)
        .unwrap_or_else(|| crate::fail::die("SWI entry with no current task"))
}

fn regs(caller: NonNull<OSTask>) -> [u32; SVC_REGISTER_COUNT] {
    unsafe { caller.as_ref().svc_registers }
}

fn set_ok(caller: NonNull<OSTask>, r0: u32, r1: u32, r2: u32) {
    unsafe {
        (*caller.as_ptr()).svc_registers[0] = r0;
        (*caller.as_ptr()).svc_registers[1] = r1;
        (*caller.as_ptr()).svc_registers[2] = r2;
        (*caller.as_ptr()).error_flag = false;
    }
}

fn resolve_task(raw: u32) -> Result<NonNull<OSTask>, UsageError> {
    unsafe { task::resolve_handle(&task::TASKS, TaskHandle(raw)) }
}

fn resolve_opt_task(raw: u32) -> Result<Option<NonNull<OSTask>>, UsageError> {
    if raw == 0 {
        Ok(None)
    } else {
        resolve_task(raw).map(Some)
    }
}

/// Writes `err` into the caller's registers per spec §7's convention
/// (R0 = pointer to an `ErrorBlock`, V set) and clears its slot's pending
/// result. `x_form` only distinguishes the two propagation paths for a
/// caller outside this simulated register model -- the legacy
/// redirect-through-the-handler-vector behavior `Generated` implies is
/// itself legacy-SWI plumbing, out of scope (SPEC_FULL.md §C).
fn fail(core: u32, caller: NonNull<OSTask>, err: UsageError, x_form: bool) -> Resume {
    let form = if x_form {
        ErrorForm::XForm
    } else {
        ErrorForm::Generated
    };
    let block = err::render(err, form);
    let idx = core as usize;
    unsafe {
        ERROR_SCRATCH[idx] = block;
        let ptr = core::ptr::addr_of!(ERROR_SCRATCH[idx]) as u32;
        (*caller.as_ptr()).svc_registers[0] = ptr;
        (*caller.as_ptr()).error_flag = true;
    }
    Resume::ContinueCurrent
}

/// Entry point for `crate::arch`'s SVC trampoline.
pub fn dispatch(core: u32, raw_swi: u32) -> Resume {
    let x_form = raw_swi & X_FORM_BIT != 0;
    let number = raw_swi & !X_FORM_BIT;
    let caller = current(core);

    if Swi::is_module_call(number) {
        return dispatch_module(core, caller, number, x_form);
    }
    if Swi::is_task_call(number) {
        return match Swi::try_from(number) {
            Ok(swi) => dispatch_task_call(core, caller, swi, x_form),
            Err(e) => fail(core, caller, e, x_form),
        };
    }
    // 0x000-0x2ff (legacy/WriteC/kernel ranges) are out of scope
    // (SPEC_FULL.md §C); treated as an unknown SWI rather than routed
    // anywhere.
    fail(core, caller, UsageError::UnknownSwi, x_form)
}

fn dispatch_task_call(
    core: u32,
    caller: NonNull<OSTask>,
    swi: Swi,
    x_form: bool,
) -> Resume {
    let r = regs(caller);
    let result = run_task_call(core, caller, swi, &r);
    match result {
        Ok(resume) => resume,
        Err(e) => fail(core, caller, e, x_form),
    }
}

fn run_task_call(
    core: u32,
    caller: NonNull<OSTask>,
    swi: Swi,
    r: &[u32; SVC_REGISTER_COUNT],
) -> Result<Resume, UsageError> {
    match swi {
        Swi::Yield => {
            task::SCHED.yield_current(core);
            Ok(Resume::ContinueCurrent)
        }

        Swi::Sleep => {
            task::SCHED.sleep_current(core, r[0]);
            task::SCHED.reschedule(core);
            Ok(Resume::ContinueCurrent)
        }

        Swi::Create | Swi::Spawn => {
            let caller_slot = unsafe { caller.as_ref().slot };
            let new_slot = if swi == Swi::Spawn {
                Some(alloc_asid())
            } else {
                None
            };
            let handle = task::create_task(
                r[0],
                r[1],
                &r[2..6],
                caller_slot,
                new_slot,
                core,
            )?;
            set_ok(caller, handle.0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::EndTask => {
            let slot = unsafe { caller.as_ref().slot };
            unsafe { task::SCHED.running_list(core).detach(caller) };
            let frees_slot = task::TASKS.count_slot_users(slot, core) <= 1;
            task::end_task(caller, frees_slot, core);
            task::SCHED.reschedule(core);
            Ok(Resume::Ended)
        }

        Swi::Cores => {
            set_ok(caller, core, crate::startup::CORE_COUNT as u32, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::RegisterSwiHandlers => {
            // `handlers-ptr` in the external interface table becomes a
            // single (chunk, action, kind, value) registration here:
            // we have no safe way to walk an arbitrary caller-supplied
            // table of `ModuleAction`s (not an ABI-stable wire type), and
            // every call site in this tree only ever registers one action
            // per call anyway.
            let chunk = r[0];
            let action = r[1] as u8;
            let binding = match r[2] {
                1 => ModuleAction::Queue(QueueHandle::from_raw(r[3])),
                2 => ModuleAction::Unbound,
                _ => ModuleAction::Code(r[3]),
            };
            module::register_swi_handlers(chunk, &[(action, binding)], core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::MapDevicePages => {
            map_device_pages(caller, r[0], r[1], r[2], core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::AppMemoryTop => {
            let slot_index = unsafe { caller.as_ref().slot };
            let slot = unsafe { &mut *task::SLOTS.get(slot_index) };
            if r[0] != 0 {
                slot.app_memory_top = r[0];
            }
            set_ok(caller, slot.app_memory_top, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::RunThisForMe => {
            let client = resolve_task(r[0])?;
            // `regs-ptr` is a user-mode register-block pointer in the
            // external interface table; the handler's edits already
            // landed via a prior `SetRegisters`, so the only thing left
            // to graft here is the resume address itself.
            queue::run_this_for_me(client, caller, r[1], core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::GetRegisters => {
            let client = resolve_task(r[0])?;
            let client_regs = queue::get_registers(client, caller)?;
            copy_out_registers(r[1], &client_regs);
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::SetRegisters => {
            let client = resolve_task(r[0])?;
            let mut new_regs = [0u32; SVC_REGISTER_COUNT];
            copy_in_registers(r[1], &mut new_regs);
            queue::set_registers(client, caller, &new_regs)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::ReleaseTask => {
            let client = resolve_task(r[0])?;
            if r[1] != 0 {
                let mut final_regs = [0u32; SVC_REGISTER_COUNT];
                copy_in_registers(r[1], &mut final_regs);
                queue::set_registers(client, caller, &final_regs)?;
            }
            queue::release_task(client, caller)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::ChangeController => {
            let client = resolve_task(r[0])?;
            let new_controller = resolve_opt_task(r[1])?;
            queue::change_controller(client, new_controller, core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::LockClaim => {
            let lock = unsafe { &*(r[0] as *const LockWord) };
            let handle = TaskHandle(r[1]);
            match locks::claim(lock, handle, caller, core) {
                ClaimOutcome::Acquired => set_ok(caller, 0, 0, 0),
                ClaimOutcome::Reclaimed => set_ok(caller, 1, 0, 0),
                ClaimOutcome::Blocked => {
                    task::SCHED.reschedule(core);
                }
            }
            Ok(Resume::ContinueCurrent)
        }

        Swi::LockRelease => {
            let lock = unsafe { &*(r[0] as *const LockWord) };
            let handle = unsafe { caller.as_ref().handle() };
            locks::check_owner(lock, handle)?;
            locks::release(lock);
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::EnableInterrupts => {
            crate::arch::enable_interrupts_on_return(core);
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::WaitForInterrupt => {
            irq::IRQ_TABLE.wait_for_interrupt(core, r[0])?;
            task::SCHED.reschedule(core);
            Ok(Resume::ContinueCurrent)
        }

        Swi::SwitchToCore => {
            let target = r[0];
            task::SCHED.switch_to_core(core, target, caller);
            task::SCHED.reschedule(core);
            crate::arch::signal_event();
            Ok(Resume::ContinueCurrent)
        }

        Swi::Tick => {
            task::SCHED.tick(core);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeCreate => {
            if r[2] != 0 {
                // Caller-supplied backing memory isn't supported: every
                // pipe's ring comes from `crate::rawpage::POOL`.
                return Err(UsageError::BadArgument);
            }
            let handle = pipe::create(r[0], r[1], caller, core)?;
            set_ok(caller, handle.to_raw(), 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeWaitForSpace => pipe_wait(core, caller, r, PipeWaitKind::Space),
        Swi::PipeWaitForData => pipe_wait(core, caller, r, PipeWaitKind::Data),

        Swi::PipeSpaceFilled => {
            let handle = PipeHandle::from_raw(r[0]);
            pipe::space_filled(handle, r[1])?;
            let ready = expect_ready(pipe::wait_for_space(handle, 0, caller, core)?);
            set_ok(caller, ready.available, ready.va, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeDataConsumed => {
            let handle = PipeHandle::from_raw(r[0]);
            pipe::data_consumed(handle, r[1])?;
            let ready = expect_ready(pipe::wait_for_data(handle, 0, caller, core)?);
            set_ok(caller, ready.available, ready.va, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeSetSender => {
            let handle = PipeHandle::from_raw(r[0]);
            let new_task = resolve_opt_task(r[1])?;
            pipe::set_sender(handle, new_task, core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeSetReceiver => {
            let handle = PipeHandle::from_raw(r[0]);
            let new_task = resolve_opt_task(r[1])?;
            pipe::set_receiver(handle, new_task, core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeNoMoreData => {
            pipe::no_more_data(PipeHandle::from_raw(r[0]), core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::PipeNotListening => {
            pipe::not_listening(PipeHandle::from_raw(r[0]), core)?;
            set_ok(caller, 0, 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::QueueCreate => {
            let handle = queue::create(core)?;
            set_ok(caller, handle.to_raw(), 0, 0);
            Ok(Resume::ContinueCurrent)
        }

        Swi::QueueWait => {
            let handle = QueueHandle::from_raw(r[0]);
            // No per-handler filter SWI exists in the external interface
            // table; a handler that wants one registers it out of band
            // (e.g. before its first `QueueWait`). Defaulting to
            // `QueueFilter::default()` admits anything, which is the
            // right behavior for every handler in this tree.
            match queue::queue_wait(handle, caller, QueueFilter::default(), core)? {
                QueueWait::Matched(m) => {
                    let client_handle = unsafe { m.client.as_ref().handle() };
                    set_ok(caller, client_handle.0, m.swi, m.client_core);
                }
                QueueWait::Blocked => {
                    task::SCHED.reschedule(core);
                }
            }
            Ok(Resume::ContinueCurrent)
        }
    }
}

enum PipeWaitKind {
    Space,
    Data,
}

fn pipe_wait(
    core: u32,
    caller: NonNull<OSTask>,
    r: &[u32; SVC_REGISTER_COUNT],
    kind: PipeWaitKind,
) -> Result<Resume, UsageError> {
    let handle = PipeHandle::from_raw(r[0]);
    let n = r[1];
    let outcome = match kind {
        PipeWaitKind::Space => pipe::wait_for_space(handle, n, caller, core)?,
        PipeWaitKind::Data => pipe::wait_for_data(handle, n, caller, core)?,
    };
    match outcome {
        PipeWait::Ready(ready) => set_ok(caller, ready.available, ready.va, 0),
        PipeWait::Blocked => {
            task::SCHED.reschedule(core);
        }
    }
    Ok(Resume::ContinueCurrent)
}

fn expect_ready(outcome: PipeWait) -> pipe::PipeReady {
    match outcome {
        PipeWait::Ready(ready) => ready,
        // n == 0 is always already satisfied; a Blocked result here would
        // mean `space_available`/`data_available` went negative, which
        // can't happen (both are saturating-by-construction wrapping
        // subtractions bounded by `max_block_size`).
        PipeWait::Blocked => unreachable!("zero-length pipe wait cannot block"),
    }
}

fn map_device_pages(
    caller: NonNull<OSTask>,
    va: u32,
    base_page: u32,
    pages: u32,
    core: u32,
) -> Result<(), UsageError> {
    mmu::MMU.map_memory(
        mmu::Mapping {
            base_page,
            pages,
            va,
            mapping_type: MappingType::Device,
            all_cores: false,
            usr32_access: true,
            not_shared: true,
        },
        core,
    )?;
    let slot_index = unsafe { caller.as_ref().slot };
    let slot = unsafe { &mut *task::SLOTS.get(slot_index) };
    let gap = slot
        .memory_blocks
        .iter()
        .position(|m| m.is_none())
        .ok_or(UsageError::MemoryBlockOverflow)?;
    slot.memory_blocks[gap] = Some(task::AppMemoryBlock {
        va_page: va / crate::rawpage::PAGE_SIZE,
        pages,
        page_base: base_page,
        device: true,
        read_only: false,
    });
    Ok(())
}

/// Module-range SWI: decode (chunk, action), look up the binding, and act
/// per spec §4.10.
fn dispatch_module(
    core: u32,
    caller: NonNull<OSTask>,
    number: u32,
    x_form: bool,
) -> Resume {
    let Some(decoded) = ModuleSwi::decode(number) else {
        return fail(core, caller, UsageError::UnknownSwi, x_form);
    };
    let action = match module::lookup(decoded.chunk, decoded.action, core) {
        Ok(a) => a,
        Err(e) => return fail(core, caller, e, x_form),
    };
    match action {
        ModuleAction::Unbound => fail(core, caller, UsageError::UnknownSwi, x_form),
        ModuleAction::Code(entry) => {
            // Called inline with the caller's own registers: graft the
            // module's code address onto the saved resume slot, same
            // convention `crate::queue::run_this_for_me` uses, and let
            // the caller re-enter user mode running it.
            unsafe {
                (*caller.as_ptr()).svc_registers[SVC_REGISTER_COUNT - 2] = entry;
            }
            Resume::ContinueCurrent
        }
        ModuleAction::Queue(handle) => {
            match queue::enqueue_for_queue(handle, caller, number, core) {
                Ok(()) => {
                    task::SCHED.reschedule(core);
                    Resume::ContinueCurrent
                }
                Err(e) => fail(core, caller, e, x_form),
            }
        }
    }
}

fn copy_out_registers(dest_ptr: u32, src: &[u32; SVC_REGISTER_COUNT]) {
    if dest_ptr == 0 {
        return;
    }
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_ptr(),
            dest_ptr as *mut u32,
            SVC_REGISTER_COUNT,
        );
    }
}

fn copy_in_registers(src_ptr: u32, dest: &mut [u32; SVC_REGISTER_COUNT]) {
    if src_ptr == 0 {
        return;
    }
    unsafe {
        core::ptr::copy_nonoverlapping(
            src_ptr as *const u32,
            dest.as_mut_ptr(),
            SVC_REGISTER_COUNT,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_pools_once() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let region: &'static mut [u8] =
                Box::leak(vec![0u8; 1 << 20].into_boxed_slice());
            let (priv_region, shared_region) = region.split_at_mut(1 << 19);
            unsafe {
                crate::heap::PRIVILEGED.init(priv_region, 0);
                crate::heap::SHARED.init(shared_region, 0);
            }
            crate::rawpage::POOL.init(0, crate::rawpage::PAGES_PER_SECTION * 4, 0);
        });
    }

    fn make_current(core: u32) -> NonNull<OSTask> {
        let t = task::TASKS.alloc(0, 0, &[], 0, core).unwrap();
        unsafe { task::SCHED.running_list(core).push_back(t) };
        t
    }

    #[test]
    fn yield_dispatches_through_run_task_call() {
        let a = make_current(0);
        let b = task::TASKS.alloc(0, 0, &[], 0, 0).unwrap();
        unsafe { task::SCHED.running_list(0).push_back(b) };

        let resume = dispatch(0, Swi::Yield as u32);
        assert!(matches!(resume, Resume::ContinueCurrent));
        assert_eq!(task::SCHED.running_list(0).head(), Some(b));

        unsafe {
            task::SCHED.running_list(0).detach(a);
            task::SCHED.running_list(0).detach(b);
        }
        task::TASKS.free(a, 0);
        task::TASKS.free(b, 0);
    }

    #[test]
    fn unknown_swi_sets_error_flag() {
        let caller = make_current(1);
        let resume = dispatch(1, 0x3ff);
        assert!(matches!(resume, Resume::ContinueCurrent));
        assert!(unsafe { caller.as_ref().error_flag });
        let block_ptr = unsafe { caller.as_ref().svc_registers[0] };
        let block = unsafe { &*(block_ptr as *const abi::ErrorBlock) };
        assert_eq!(block.code, UsageError::UnknownSwi.code());

        unsafe { task::SCHED.running_list(1).detach(caller) };
        task::TASKS.free(caller, 1);
    }

    #[test]
    fn end_task_detaches_and_frees_alone_slot() {
        let caller = make_current(2);
        let resume = dispatch(2, Swi::EndTask as u32);
        assert!(matches!(resume, Resume::Ended));
        assert!(task::SCHED.running_list(2).is_empty());
    }

    #[test]
    fn cores_reports_core_and_total() {
        let caller = make_current(3);
        dispatch(3, Swi::Cores as u32);
        assert_eq!(unsafe { caller.as_ref().svc_registers[0] }, 3);
        assert_eq!(
            unsafe { caller.as_ref().svc_registers[1] },
            crate::startup::CORE_COUNT as u32
        );
        unsafe { task::SCHED.running_list(3).detach(caller) };
        task::TASKS.free(caller, 3);
    }

    #[test]
    fn lock_claim_round_trip_via_dispatch() {
        let lock = LockWord::new();
        let caller = make_current(4);
        unsafe {
            (*caller.as_ptr()).svc_registers[0] = &lock as *const LockWord as u32;
            (*caller.as_ptr()).svc_registers[1] = caller.as_ref().handle().0;
        }
        let resume = dispatch(4, Swi::LockClaim as u32);
        assert!(matches!(resume, Resume::ContinueCurrent));
        assert_eq!(unsafe { caller.as_ref().svc_registers[0] }, 0);

        unsafe {
            (*caller.as_ptr()).svc_registers[0] = &lock as *const LockWord as u32;
        }
        dispatch(4, Swi::LockRelease as u32);

        unsafe { task::SCHED.running_list(4).detach(caller) };
        task::TASKS.free(caller, 4);
    }

    #[test]
    fn pipe_create_wait_and_signal_round_trip() {
        init_pools_once();
        let sender = make_current(5);
        unsafe {
            (*sender.as_ptr()).svc_registers[0] = crate::rawpage::PAGE_SIZE;
            (*sender.as_ptr()).svc_registers[1] = 1;
            (*sender.as_ptr()).svc_registers[2] = 0;
        }
        dispatch(5, Swi::PipeCreate as u32);
        let handle_raw = unsafe { sender.as_ref().svc_registers[0] };

        unsafe {
            (*sender.as_ptr()).svc_registers[0] = handle_raw;
            (*sender.as_ptr()).svc_registers[1] = 10;
        }
        let resume = dispatch(5, Swi::PipeWaitForSpace as u32);
        assert!(matches!(resume, Resume::ContinueCurrent));
        assert_eq!(
            unsafe { sender.as_ref().svc_registers[0] },
            crate::rawpage::PAGE_SIZE
        );

        unsafe {
            (*sender.as_ptr()).svc_registers[0] = handle_raw;
            (*sender.as_ptr()).svc_registers[1] = 10;
        }
        dispatch(5, Swi::PipeSpaceFilled as u32);
        assert_eq!(
            unsafe { sender.as_ref().svc_registers[0] },
            crate::rawpage::PAGE_SIZE - 10
        );

        unsafe {
            (*sender.as_ptr()).svc_registers[0] = handle_raw;
        }
        dispatch(5, Swi::PipeNotListening as u32);
        unsafe {
            (*sender.as_ptr()).svc_registers[0] = handle_raw;
        }
        dispatch(5, Swi::PipeNoMoreData as u32);

        unsafe { task::SCHED.running_list(5).detach(sender) };
        task::TASKS.free(sender, 5);
    }

    #[test]
    fn module_queue_routing_end_to_end() {
        init_pools_once();
        let client = make_current(6);
        let handler = task::TASKS.alloc(0, 0, &[], 0, 6).unwrap();
        unsafe { task::SCHED.running_list(6).push_back(handler) };

        let image = {
            let header = abi::ModuleHeader {
                start_offset: 0,
                init_offset: 0,
                finalise_offset: 0,
                service_call_offset: 0,
                title_offset: 0,
                help_offset: 0,
                keyword_table_offset: 0,
                swi_chunk: 0,
                swi_handler_offset: 0,
                swi_decoding_table_offset: 0,
                swi_decoding_code_offset: 0,
                messages_file_offset: 0,
                flags: 0,
            };
            let mut bytes = vec![0u8; core::mem::size_of::<abi::ModuleHeader>()];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    &header as *const abi::ModuleHeader as *const u8,
                    bytes.as_mut_ptr(),
                    bytes.len(),
                )
            };
            bytes
        };
        let q = queue::create(6).unwrap();
        let chunk = module::rm_load(&image, 6, |_base, _hdr| {
            // `rm_load` hasn't returned yet, so the chunk it just assigned
            // isn't known here directly; find it via the in-init marker
            // it set before calling us.
            let c = (0..module::MODULE_POOL_CAPACITY as u32)
                .find(|&c| module::is_in_init(c))
                .expect("rm_load must mark a chunk in-init during run_init");
            module::register_swi_handlers(c, &[(0, ModuleAction::Queue(q))], 6).unwrap();
        })
        .unwrap();

        unsafe {
            (*handler.as_ptr()).svc_registers[0] = q.to_raw();
        }
        dispatch(6, Swi::QueueWait as u32);
        assert!(unsafe { handler.as_ref().membership } != task::Membership::Running(6)
            || task::SCHED.running_list(6).head() != Some(handler));

        let swi_num = ModuleSwi { chunk, action: 0 }.encode();
        let resume = dispatch(6, swi_num);
        assert!(matches!(resume, Resume::ContinueCurrent));
        assert_eq!(task::SCHED.running_list(6).head(), Some(client));
        assert_eq!(
            unsafe { handler.as_ref().svc_registers[0] },
            unsafe { client.as_ref().handle().0 }
        );

        unsafe { task::SCHED.running_list(6).detach(client) };
        unsafe {
            if task::SCHED.running_list(6).head() == Some(handler) {
                task::SCHED.running_list(6).detach(handler);
            }
        }
        task::TASKS.free(client, 6);
        task::TASKS.free(handler, 6);
    }
}
