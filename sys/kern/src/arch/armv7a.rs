// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-A architecture backend.
//!
//! Owns the exception vector table, the SVC/IRQ/abort trampolines that
//! translate a trap into a call on the portable dispatch code
//! (`crate::swi::dispatch`, `crate::irq::IRQ_TABLE.dispatch`,
//! `crate::mmu::MMU.dispatch_fault`), and the CP15 housekeeping
//! (TTBR0/DACR/SCTLR, ASID-tagged TLB maintenance) the portable MMU code
//! assumes has already happened.
//!
//! We only ever trap from User or System mode: the kernel masks IRQs for
//! the whole time it's running in a privileged mode, and a trap can't
//! re-enter this same handler before `restore_and_return` has already
//! left privileged mode again (spec §7's "no kernel-internal
//! reentrancy"). That lets every mode's exception entry use one *fixed*
//! per-core scratch slot instead of a real stack: nothing is ever pushed
//! without being consumed before the next trap on that core can land.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::swi::{self, Resume};
use crate::task::{self, OSTask, MAX_CORES};

/// Physical/virtual base of the high vector table (`SCTLR.V = 1`). The HAL
/// is expected to have already identity-mapped this 4 KiB page before
/// calling [`install_vectors`].
const VECTOR_BASE: u32 = 0xFFFF_0000;

mod cpsr {
    pub const SVC: u32 = 0x13;
    pub const ABT: u32 = 0x17;
    pub const UND: u32 = 0x1b;
    pub const IRQ: u32 = 0x12;
    pub const IRQ_DISABLE: u32 = 1 << 7;
    pub const FIQ_DISABLE: u32 = 1 << 6;
    pub const V_FLAG: u32 = 1 << 28;
}

/// Per-core scratch for one trapped register set: r0-r12, lr, spsr, then
/// the interrupted mode's banked user sp/lr. Every privileged mode's
/// `sp` is pointed at its core's row once, at boot (see
/// [`init_exception_stacks`]), and never moves again -- the trampolines
/// below address it with plain offsets instead of push/pop.
const FRAME_WORDS: usize = task::SVC_REGISTER_COUNT + 2;
static mut TRAP_SCRATCH: [[u32; FRAME_WORDS]; MAX_CORES] = [[0; FRAME_WORDS]; MAX_CORES];

static IRQS_ENABLED: [AtomicBool; MAX_CORES] = {
    const OFF: AtomicBool = AtomicBool::new(false);
    [OFF; MAX_CORES]
};

#[inline(always)]
fn dsb() {
    unsafe { core::arch::asm!("dsb") }
}

#[inline(always)]
fn isb() {
    unsafe { core::arch::asm!("isb") }
}

/// Points `sp_svc`/`sp_abt`/`sp_und`/`sp_irq` at this core's row of
/// [`TRAP_SCRATCH`]. Must run once per core, before that core's first
/// trap of any kind and before [`install_vectors`] unmasks anything.
///
/// # Safety
/// Must run in a privileged mode with interrupts masked, exactly once
/// per core.
pub unsafe fn init_exception_stacks(core: u32) {
    let scratch = unsafe { core::ptr::addr_of_mut!(TRAP_SCRATCH[core as usize]) as u32 };
    unsafe {
        for mode in [cpsr::SVC, cpsr::ABT, cpsr::UND, cpsr::IRQ] {
            core::arch::asm!(
                "mrs {saved}, cpsr",
                "orr {tmp}, {saved}, {dis}",
                "bic {tmp}, {tmp}, #0x1f",
                "orr {tmp}, {tmp}, {mode}",
                "msr cpsr_c, {tmp}",
                "mov sp, {scratch}",
                "msr cpsr_c, {saved}",
                saved = out(reg) _,
                tmp = out(reg) _,
                dis = in(reg) cpsr::IRQ_DISABLE | cpsr::FIQ_DISABLE,
                mode = in(reg) mode,
                scratch = in(reg) scratch,
            );
        }
    }
}

/// Installs the high-vector jump table. Each slot is a PC-relative
/// literal load into a table immediately following the eight vectors,
/// the traditional ARM idiom that reaches a full 32-bit handler address
/// regardless of link-time layout.
///
/// # Safety
/// `VECTOR_BASE` must already be mapped read/write/execute for this
/// call, and read-only-execute (or unmapped from user mode) afterward.
pub unsafe fn install_vectors() {
    unsafe {
        let base = VECTOR_BASE as *mut u32;
        let ldr_pc = 0xe59f_f018u32; // ldr pc, [pc, #0x18]
        for i in 0..8u32 {
            base.add(i as usize).write_volatile(ldr_pc);
        }
        let table = base.add(8);
        let handlers: [unsafe extern "C" fn() -> !; 8] = [
            _reset,
            _undef_entry,
            _swi_entry,
            _prefetch_abort_entry,
            _data_abort_entry,
            _reset,
            _irq_entry,
            _reset,
        ];
        for (i, h) in handlers.iter().enumerate() {
            table.add(i).write_volatile(*h as usize as u32);
        }
    }
    dsb();
    isb();
}

/// Points `TTBR0` at this core's local L1 table, sets a flat client
/// domain 0 in `DACR`, and turns on the MMU and both caches in `SCTLR`.
/// Called once per core, after `mmu::MMU.init` has zero-filled that
/// core's table with fault entries and the identity mapping covering
/// this code and the vector table is in place.
///
/// # Safety
/// `local_l1_pa` must be the 16 KiB-aligned physical address of the L1
/// table `mmu::MMU` was just initialized with for `core`.
pub unsafe fn enable_mmu(local_l1_pa: u32, core: u32) {
    unsafe {
        // TTBR0: outer/inner write-back, no long-descriptor bits.
        core::arch::asm!(
            "mcr p15, 0, {0}, c2, c0, 0",
            in(reg) local_l1_pa | 0b0_01_1_0_0_1,
        );
        // CONTEXTIDR ASID: 0 until the first Spawn/Create picks a real
        // one; section/page entries carry `nG` so stale ASID-0 entries
        // can't be mistaken for a later real ASID's mapping.
        core::arch::asm!("mcr p15, 0, {0}, c13, c0, 1", in(reg) core);
        // DACR: domain 0 is "client" -- the entry's own AP bits decide
        // access, rather than "manager" bypassing AP checking entirely.
        core::arch::asm!("mcr p15, 0, {0}, c3, c0, 0", in(reg) 0b01u32);
        isb();

        let mut sctlr: u32;
        core::arch::asm!("mrc p15, 0, {0}, c1, c0, 0", out(reg) sctlr);
        sctlr |= (1 << 0) // M: MMU enable
            | (1 << 2) // C: data cache
            | (1 << 11) // Z: branch prediction
            | (1 << 12) // I: instruction cache
            | (1 << 13); // V: high vectors
        core::arch::asm!("mcr p15, 0, {0}, c1, c0, 0", in(reg) sctlr);
        isb();
    }
}

pub fn mmu_barrier() {
    dsb();
    isb();
    unsafe {
        // TLBIALL, this core only; cross-core invalidation is handled by
        // the portable MMU code re-taking its lock, not by a broadcast op.
        core::arch::asm!("mcr p15, 0, {0}, c8, c7, 0", in(reg) 0u32);
    }
    dsb();
    isb();
}

/// Programs the core-local timer divisor. Actual generic-timer/QA7
/// register layout is board-specific (spec §1, out of scope); the HAL's
/// reset handler is expected to call this (or do the equivalent itself)
/// before unmasking interrupts, so it's a no-op on the portable side.
pub fn set_clock_freq(_tick_divisor: u32) {}

/// `SEV`: wakes every core parked in [`wait_for_event`].
pub fn signal_event() {
    unsafe { core::arch::asm!("sev") }
}

/// `WFE`: parks this core until the next event (a `sev`, or any
/// interrupt, per the architecture's event-register semantics).
pub fn wait_for_event() {
    unsafe { core::arch::asm!("wfe") }
}

pub fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

/// Clears the `I` bit in the SPSR this core's next trap return will
/// restore into CPSR, per spec §4.5's `EnablingInterrupts`. Tracked
/// per-core rather than baked into `OSTask::svc_registers`'s SPSR slot
/// so a task that migrates cores via `SwitchToCore` still comes back
/// with interrupts enabled on whichever core it lands on.
pub fn enable_interrupts_on_return(core: u32) {
    IRQS_ENABLED[core as usize].store(true, Ordering::Release);
}

fn spsr_for_return(core: u32, saved_spsr: u32, error_flag: bool) -> u32 {
    let spsr = if IRQS_ENABLED[core as usize].load(Ordering::Acquire) {
        saved_spsr & !cpsr::IRQ_DISABLE
    } else {
        saved_spsr | cpsr::IRQ_DISABLE
    };
    if error_flag {
        spsr | cpsr::V_FLAG
    } else {
        spsr & !cpsr::V_FLAG
    }
}

/// Drops this core into `task` for the first time: there is no saved
/// context to resume from a previous trap, so this is just
/// `return_to_task` run directly off the values `TaskPool::alloc` seeded
/// (entry point in the LR slot, the first four arguments in r0-r3).
pub fn start_first_task(core: u32, task: NonNull<OSTask>) -> ! {
    unsafe { return_to_task(core, task) }
}

/// Restores `task`'s registers and user sp/lr and falls into user mode
/// at the address in its LR slot, with V set per `task.error_flag` and
/// the interrupt-disable bit per [`enable_interrupts_on_return`]. This
/// is the only way back to user mode; every trampoline below reaches it
/// through [`return_tail`] rather than unwinding its own call stack.
unsafe fn return_to_task(core: u32, task: NonNull<OSTask>) -> ! {
    unsafe {
        let t = task.as_ref();
        let spsr = spsr_for_return(core, t.svc_registers[14], t.error_flag);
        let regs = &t.svc_registers as *const u32;
        let user_regs = [t.user_sp, t.user_lr];
        core::arch::asm!(
            "msr spsr_cxsf, {spsr}",
            "ldm {regs}, {{r0-r12}}",
            "ldr lr, [{regs}, #52]", // svc_registers[13]: return address
            "ldm {user_regs}, {{r13, r14}}^",
            "nop", // a banked-register transfer can't be immediately followed by a banked-mode branch
            "movs pc, lr",
            spsr = in(reg) spsr,
            regs = in(reg) regs,
            user_regs = in(reg) user_regs.as_ptr(),
            options(noreturn),
        );
    }
}

// --- exception trampolines -------------------------------------------------
//
// Every `_*_entry` below is `#[naked]` and runs in its mode's dedicated
// slot of `TRAP_SCRATCH` (via that mode's `sp`, set once by
// `init_exception_stacks`): it spills r0-r12/lr/spsr and the interrupted
// mode's banked user sp/lr there with plain offset stores, computes this
// core's id, and `bl`s into the matching safe handler, which never
// returns -- it always ends by finding the (possibly different)
// `task::SCHED.current(core)` and diverging into it via
// [`return_to_task`].

#[naked]
unsafe extern "C" fn _reset() -> ! {
    unsafe { core::arch::asm!("b {0}", sym reset_unexpected, options(noreturn)) }
}

extern "C" fn reset_unexpected() -> ! {
    crate::fail::die("reset/reserved/fiq vector taken post-boot")
}

#[naked]
unsafe extern "C" fn _swi_entry() -> ! {
    unsafe {
        core::arch::asm!(
            "stmia sp, {{r0-r12}}",
            "str lr, [sp, #52]",
            "mrs r0, spsr",
            "str r0, [sp, #56]",
            "add r0, sp, #60",
            "stm r0, {{r13, r14}}^",
            "mrc p15, 0, r0, c0, c0, 5",
            "and r0, r0, #0xff",
            "b {handle}",
            handle = sym handle_swi,
            options(noreturn),
        )
    }
}

#[naked]
unsafe extern "C" fn _irq_entry() -> ! {
    unsafe {
        core::arch::asm!(
            "sub lr, lr, #4",
            "stmia sp, {{r0-r12}}",
            "str lr, [sp, #52]",
            "mrs r0, spsr",
            "str r0, [sp, #56]",
            "add r0, sp, #60",
            "stm r0, {{r13, r14}}^",
            "mrc p15, 0, r0, c0, c0, 5",
            "and r0, r0, #0xff",
            "b {handle}",
            handle = sym handle_irq,
            options(noreturn),
        )
    }
}

#[naked]
unsafe extern "C" fn _prefetch_abort_entry() -> ! {
    unsafe {
        core::arch::asm!(
            "sub lr, lr, #4",
            "stmia sp, {{r0-r12}}",
            "str lr, [sp, #52]",
            "mrs r0, spsr",
            "str r0, [sp, #56]",
            "add r0, sp, #60",
            "stm r0, {{r13, r14}}^",
            "mrc p15, 0, r0, c0, c0, 5",
            "and r0, r0, #0xff",
            "b {handle}",
            handle = sym handle_prefetch_abort,
            options(noreturn),
        )
    }
}

#[naked]
unsafe extern "C" fn _data_abort_entry() -> ! {
    unsafe {
        core::arch::asm!(
            "sub lr, lr, #8",
            "stmia sp, {{r0-r12}}",
            "str lr, [sp, #52]",
            "mrs r0, spsr",
            "str r0, [sp, #56]",
            "add r0, sp, #60",
            "stm r0, {{r13, r14}}^",
            "mrc p15, 0, r0, c0, c0, 5",
            "and r0, r0, #0xff",
            "b {handle}",
            handle = sym handle_data_abort,
            options(noreturn),
        )
    }
}

#[naked]
unsafe extern "C" fn _undef_entry() -> ! {
    unsafe {
        core::arch::asm!(
            "stmia sp, {{r0-r12}}",
            "str lr, [sp, #52]",
            "mrs r0, spsr",
            "str r0, [sp, #56]",
            "add r0, sp, #60",
            "stm r0, {{r13, r14}}^",
            "mrc p15, 0, r0, c0, c0, 5",
            "and r0, r0, #0xff",
            "b {handle}",
            handle = sym handle_undef,
            options(noreturn),
        )
    }
}

/// Copies this core's `TRAP_SCRATCH` row into `current`'s `OSTask`.
/// Every handler below calls this first, before touching any portable
/// dispatch code that might change which task is current.
unsafe fn capture_current(core: u32) -> NonNull<OSTask> {
    unsafe {
        let current = task::SCHED
            .current(core)
            .unwrap_or_else(|| crate::fail::die("trap with no current task"));
        let frame = &TRAP_SCRATCH[core as usize];
        let t = &mut *current.as_ptr();
        t.svc_registers.copy_from_slice(&frame[..task::SVC_REGISTER_COUNT]);
        t.user_sp = frame[task::SVC_REGISTER_COUNT];
        t.user_lr = frame[task::SVC_REGISTER_COUNT + 1];
        current
    }
}

/// Decodes the trapping `svc` instruction's low 24 bits out of the word
/// just before the saved return address (`lr` holds the instruction
/// after the `svc` in ARM state). Masked with two shifts since
/// `0x00ff_ffff` isn't representable as a single rotated ARM immediate.
fn decode_swi_number(return_addr: u32) -> u32 {
    unsafe {
        let insn = ((return_addr - 4) as *const u32).read();
        (insn << 8) >> 8
    }
}

extern "C" fn handle_swi(core: u32) -> ! {
    unsafe {
        let current = capture_current(core);
        let raw_swi = decode_swi_number(current.as_ref().svc_registers[13]);
        match swi::dispatch(core, raw_swi) {
            Resume::ContinueCurrent | Resume::Ended => {}
        }
        return_tail(core)
    }
}

extern "C" {
    /// Reads and acknowledges the highest-priority pending interrupt on
    /// `core` from whatever controller the board has (GIC, QA7 basic IRQ
    /// block, ...), returning its portable source number, or a negative
    /// value for a spurious read. Out of scope here (spec §1): the HAL
    /// must provide this symbol before unmasking IRQs.
    fn hal_claim_irq(core: u32) -> i64;
}

extern "C" fn handle_irq(core: u32) -> ! {
    unsafe {
        capture_current(core);
        let source = hal_claim_irq(core);
        if source >= 0 {
            crate::irq::IRQ_TABLE.dispatch(core, source as u32);
        }
        return_tail(core)
    }
}

extern "C" fn handle_prefetch_abort(core: u32) -> ! {
    unsafe {
        capture_current(core);
        let (status, address) = read_ifsr_ifar();
        if !crate::mmu::MMU.dispatch_fault(address, fault_kind(status), core) {
            crate::fail::die("unrecoverable prefetch abort");
        }
        return_tail(core)
    }
}

extern "C" fn handle_data_abort(core: u32) -> ! {
    unsafe {
        capture_current(core);
        let (status, address) = read_dfsr_dfar();
        if !crate::mmu::MMU.dispatch_fault(address, fault_kind(status), core) {
            crate::fail::die("unrecoverable data abort");
        }
        return_tail(core)
    }
}

extern "C" fn handle_undef(_core: u32) -> ! {
    crate::fail::die("undefined instruction trapped to kernel")
}

fn fault_kind(fault_status: u32) -> crate::mmu::FaultKind {
    // FSR[3:0] (with bit 10 folded in for the few encodings that need
    // it) classifies the fault; 0b0101/0b0111 are first-/second-level
    // translation faults in the short-descriptor format.
    match fault_status & 0b1111 {
        0b0101 => crate::mmu::FaultKind::TranslationLevel1,
        0b0111 => crate::mmu::FaultKind::TranslationLevel2,
        _ => crate::mmu::FaultKind::Other,
    }
}

fn read_ifsr_ifar() -> (u32, u32) {
    let (mut status, mut addr): (u32, u32) = (0, 0);
    unsafe {
        core::arch::asm!("mrc p15, 0, {0}, c5, c0, 1", out(reg) status);
        core::arch::asm!("mrc p15, 0, {0}, c6, c0, 2", out(reg) addr);
    }
    (status, addr)
}

fn read_dfsr_dfar() -> (u32, u32) {
    let (mut status, mut addr): (u32, u32) = (0, 0);
    unsafe {
        core::arch::asm!("mrc p15, 0, {0}, c5, c0, 0", out(reg) status);
        core::arch::asm!("mrc p15, 0, {0}, c6, c0, 0", out(reg) addr);
    }
    (status, addr)
}

/// Falls through to whichever task is `task::SCHED.current(core)` now --
/// not necessarily the one that trapped, since the handler that just ran
/// may have blocked it, ended it, or migrated it to another core.
unsafe fn return_tail(core: u32) -> ! {
    unsafe {
        loop {
            if let Some(current) = task::SCHED.current(core) {
                return_to_task(core, current)
            }
            if !task::SCHED.reschedule(core) {
                wait_for_event();
            }
        }
    }
}
