// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the kernel and every task, including the SWI
//! (supervisor call) number space, handle obfuscation, and the on-disk
//! module header layout.
//!
//! This crate is `no_std` and contains no logic beyond `From`/`TryFrom`
//! plumbing and bit-twiddling; it exists so that kernel code and task code
//! agree on the wire representation of everything that crosses the SWI
//! boundary without either side depending on the other.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// XOR mask applied to every in-kernel handle before it is handed to a task,
/// and again when a task hands one back. Turns a raw slot address into
/// something that doesn't look like a pointer and can't be dereferenced by
/// accident.
///
/// Spells `TASK` in ASCII, read little-endian.
pub const HANDLE_OBFUSCATOR: u32 = 0x4b53_4154;

/// A task handle as seen by userspace: an obfuscated reference to an
/// `OSTaskSlot`.
///
/// The low bit of the *unobfuscated* value doubles as the "wanted" bit in
/// lock words (see `Swi::LockClaim` and `kern::locks`), so handles are
/// always even; [`TaskHandle::owner_bits`] and [`TaskHandle::from_owner_bits`]
/// convert to and from that packed form.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct TaskHandle(pub u32);

impl TaskHandle {
    pub fn from_raw(addr: u32) -> Self {
        TaskHandle(addr ^ HANDLE_OBFUSCATOR)
    }

    pub fn to_raw(self) -> u32 {
        self.0 ^ HANDLE_OBFUSCATOR
    }

    /// Packs this handle into the upper 31 bits of a lock word, leaving the
    /// low "wanted" bit clear.
    pub fn owner_bits(self) -> u32 {
        let raw = self.to_raw();
        debug_assert_eq!(raw & 1, 0, "task slot addresses must be even");
        raw & !1
    }

    /// Recovers a handle from the upper 31 bits of a lock word, discarding
    /// whatever was in the low bit.
    pub fn from_owner_bits(bits: u32) -> Self {
        TaskHandle::from_raw(bits & !1)
    }
}

/// A queue handle as seen by userspace: an obfuscated reference to a queue
/// control block. Distinct type from [`TaskHandle`] so the two can't be
/// passed to the wrong SWI by accident.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct QueueHandle(pub u32);

impl QueueHandle {
    pub fn from_raw(addr: u32) -> Self {
        QueueHandle(addr ^ HANDLE_OBFUSCATOR)
    }

    pub fn to_raw(self) -> u32 {
        self.0 ^ HANDLE_OBFUSCATOR
    }
}

/// A pipe handle as seen by userspace: an obfuscated reference to a pipe
/// control block.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct PipeHandle(pub u32);

impl PipeHandle {
    pub fn from_raw(addr: u32) -> Self {
        PipeHandle(addr ^ HANDLE_OBFUSCATOR)
    }

    pub fn to_raw(self) -> u32 {
        self.0 ^ HANDLE_OBFUSCATOR
    }
}

/// The SWI number space, per the external interface table. Numbers are
/// grouped into ranges; everything at or above [`Swi::MODULE_BASE`] is
/// chunk-relative and decoded with [`ModuleSwi::decode`] instead of this
/// enum.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum Swi {
    Yield = 0x300,
    Sleep = 0x301,
    Create = 0x302,
    Spawn = 0x303,
    EndTask = 0x304,
    Cores = 0x305,
    RegisterSwiHandlers = 0x306,
    MapDevicePages = 0x307,
    AppMemoryTop = 0x308,
    RunThisForMe = 0x309,
    GetRegisters = 0x30a,
    SetRegisters = 0x30b,
    ReleaseTask = 0x30d,
    ChangeController = 0x30e,
    LockClaim = 0x310,
    LockRelease = 0x311,
    EnableInterrupts = 0x312,
    WaitForInterrupt = 0x313,
    SwitchToCore = 0x317,
    Tick = 0x318,
    PipeCreate = 0x320,
    PipeWaitForSpace = 0x321,
    PipeSpaceFilled = 0x322,
    PipeSetSender = 0x323,
    PipeNoMoreData = 0x325,
    PipeWaitForData = 0x326,
    PipeDataConsumed = 0x327,
    PipeSetReceiver = 0x328,
    PipeNotListening = 0x329,
    QueueCreate = 0x330,
    QueueWait = 0x331,
}

impl Swi {
    /// Legacy single-instruction RISC OS SWIs. Not implemented; retained so
    /// the range check in `kern::swi` has a name to cite.
    pub const LEGACY_BASE: u32 = 0x000;
    pub const LEGACY_LIMIT: u32 = 0x0ff;

    /// `OS_WriteC`-compatible character output.
    pub const WRITEC_BASE: u32 = 0x100;
    pub const WRITEC_LIMIT: u32 = 0x1ff;

    /// Miscellaneous non-task kernel calls.
    pub const KERNEL_BASE: u32 = 0x200;
    pub const KERNEL_LIMIT: u32 = 0x2ff;

    /// `OSTask_*`, lock, pipe, and queue calls: one fixed opcode per call,
    /// decoded with `TryFrom<u32>` below.
    pub const TASK_BASE: u32 = 0x300;
    pub const TASK_LIMIT: u32 = 0x33f;

    /// Everything from here up is a module call, chunk-relative.
    pub const MODULE_BASE: u32 = 0x340;

    pub fn is_task_call(num: u32) -> bool {
        (Self::TASK_BASE..=Self::TASK_LIMIT).contains(&num)
    }

    pub fn is_module_call(num: u32) -> bool {
        num >= Self::MODULE_BASE
    }
}

impl TryFrom<u32> for Swi {
    type Error = UsageError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x300 => Self::Yield,
            0x301 => Self::Sleep,
            0x302 => Self::Create,
            0x303 => Self::Spawn,
            0x304 => Self::EndTask,
            0x305 => Self::Cores,
            0x306 => Self::RegisterSwiHandlers,
            0x307 => Self::MapDevicePages,
            0x308 => Self::AppMemoryTop,
            0x309 => Self::RunThisForMe,
            0x30a => Self::GetRegisters,
            0x30b => Self::SetRegisters,
            0x30d => Self::ReleaseTask,
            0x30e => Self::ChangeController,
            0x310 => Self::LockClaim,
            0x311 => Self::LockRelease,
            0x312 => Self::EnableInterrupts,
            0x313 => Self::WaitForInterrupt,
            0x317 => Self::SwitchToCore,
            0x318 => Self::Tick,
            0x320 => Self::PipeCreate,
            0x321 => Self::PipeWaitForSpace,
            0x322 => Self::PipeSpaceFilled,
            0x323 => Self::PipeSetSender,
            0x325 => Self::PipeNoMoreData,
            0x326 => Self::PipeWaitForData,
            0x327 => Self::PipeDataConsumed,
            0x328 => Self::PipeSetReceiver,
            0x329 => Self::PipeNotListening,
            0x330 => Self::QueueCreate,
            0x331 => Self::QueueWait,
            _ => return Err(UsageError::UnknownSwi),
        })
    }
}

/// A decoded module SWI: which of the 64 per-module action slots, and which
/// module chunk it was issued against.
///
/// Module SWIs are allocated in chunks of 64 starting at [`Swi::MODULE_BASE`];
/// a module registered in chunk `c` answers to SWI numbers
/// `MODULE_BASE + 64*c ..= MODULE_BASE + 64*c + 63`, dispatched through its
/// `action[0..64]` table.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ModuleSwi {
    pub chunk: u32,
    pub action: u8,
}

impl ModuleSwi {
    pub fn decode(num: u32) -> Option<Self> {
        if num < Swi::MODULE_BASE {
            return None;
        }
        let rel = num - Swi::MODULE_BASE;
        Some(ModuleSwi {
            chunk: rel / 64,
            action: (rel % 64) as u8,
        })
    }

    pub fn encode(self) -> u32 {
        Swi::MODULE_BASE + self.chunk * 64 + self.action as u32
    }
}

bitflags! {
    /// Access rights granted by a memory mapping. These are a closed set
    /// (unlike the teacher's open `RegionAttributes` bitflags) because the
    /// MMU only distinguishes these combinations for a user page.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MappingFlags: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

/// The mapping types a task's memory-block table can name. Distinct from
/// [`MappingFlags`] in that `Device` additionally suppresses the MMU's
/// cacheable/bufferable bits and write-combining, rather than just gating
/// access.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MappingType {
    /// Read, write, execute.
    Rwx,
    /// Read, write.
    Rw,
    /// Read, execute.
    Rx,
    /// Read only.
    R,
    /// Strongly-ordered device memory, read/write, never executable.
    Device,
}

impl MappingType {
    pub fn flags(self) -> MappingFlags {
        match self {
            Self::Rwx => MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE,
            Self::Rw => MappingFlags::READ | MappingFlags::WRITE,
            Self::Rx => MappingFlags::READ | MappingFlags::EXECUTE,
            Self::R => MappingFlags::READ,
            Self::Device => MappingFlags::READ | MappingFlags::WRITE,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::Device)
    }
}

/// One entry in a task's memory-block table: a virtual page run backed by a
/// physical page run, with a mapping type. `pages` is a page count, not a
/// byte count; an `AppMemoryBlock` never spans the boundary between a
/// globally-mapped section and a locally-mapped one.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AppMemoryBlock {
    pub va_page: u32,
    pub pa_page: u32,
    pub pages: u32,
    /// A [`MappingType`] discriminant, stored as `u8` for a stable ABI.
    pub mapping: u8,
    pub _pad: [u8; 3],
}

/// Maximum number of [`AppMemoryBlock`] entries in a single `OSTaskSlot`.
pub const MAX_MEMORY_BLOCKS: usize = 8;

/// The on-disk/in-ROM header every module begins with: a table of fixed
/// `u32` offsets (relative to the start of the module image) to the parts
/// the kernel and the legacy module loader both need to find without
/// parsing the module body.
///
/// Field order and count are part of the ABI and must not change; this
/// mirrors the thirteen-word module header from the external interface
/// table.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ModuleHeader {
    pub start_offset: u32,
    pub init_offset: u32,
    pub finalise_offset: u32,
    pub service_call_offset: u32,
    pub title_offset: u32,
    pub help_offset: u32,
    pub keyword_table_offset: u32,
    pub swi_chunk: u32,
    pub swi_handler_offset: u32,
    pub swi_decoding_table_offset: u32,
    pub swi_decoding_code_offset: u32,
    pub messages_file_offset: u32,
    pub flags: u32,
}

bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ModuleFlags: u32 {
        /// Module wants its 32-bit relocation directives applied before
        /// `start_offset` is called.
        const NEEDS_RELOCATION = 1 << 0;
        /// Module's SWI handler expects to run on the legacy 26-bit-style
        /// stack rather than the normal supervisor stack.
        const NEEDS_LEGACY_STACK = 1 << 1;
    }
}

/// A named trait for the one predicate the module loader keeps of the
/// legacy stack switch it otherwise does not implement: whether a given
/// module's SWI class needs it. Kept as a pure, testable function even
/// though the legacy stack itself is out of scope.
pub trait SwiClass {
    fn needs_legacy_stack(&self) -> bool;
}

impl SwiClass for ModuleHeader {
    fn needs_legacy_stack(&self) -> bool {
        ModuleFlags::from_bits_truncate(self.flags).contains(ModuleFlags::NEEDS_LEGACY_STACK)
    }
}

/// A recoverable usage error: the task did something the kernel can reject
/// without a fault, by returning an [`ErrorBlock`] with the V flag set.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UsageError {
    UnknownSwi,
    BadHandle,
    BadTaskHandle,
    BadArgument,
    MemoryBlockOverflow,
    PipeFull,
    PipeEmpty,
    PipeNotOwned,
    QueueFull,
    LockAlreadyHeld,
    NotLockOwner,
    OutOfPhysicalMemory,
    OutOfTranslationTables,
    OutOfHeap,
    CoreOutOfRange,
}

impl UsageError {
    /// The numeric code half of the wire-level [`ErrorBlock`]. Stable;
    /// referenced by user-mode error-string tables.
    pub fn code(self) -> u32 {
        match self {
            Self::UnknownSwi => 0x1e6,
            Self::BadHandle => 0x1e7,
            Self::BadTaskHandle => 0x1e8,
            Self::BadArgument => 0x1e9,
            Self::MemoryBlockOverflow => 0x1ea,
            Self::PipeFull => 0x1eb,
            Self::PipeEmpty => 0x1ec,
            Self::PipeNotOwned => 0x1ed,
            Self::QueueFull => 0x1ee,
            Self::LockAlreadyHeld => 0x1ef,
            Self::NotLockOwner => 0x1f0,
            Self::OutOfPhysicalMemory => 0x1f1,
            Self::OutOfTranslationTables => 0x1f2,
            Self::OutOfHeap => 0x1f3,
            Self::CoreOutOfRange => 0x1f4,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::UnknownSwi => "Unknown SWI",
            Self::BadHandle => "Bad handle",
            Self::BadTaskHandle => "Bad task handle",
            Self::BadArgument => "Bad argument",
            Self::MemoryBlockOverflow => "Too many memory blocks",
            Self::PipeFull => "Pipe full",
            Self::PipeEmpty => "Pipe empty",
            Self::PipeNotOwned => "Pipe not owned by caller",
            Self::QueueFull => "Queue full",
            Self::LockAlreadyHeld => "Lock already held",
            Self::NotLockOwner => "Not lock owner",
            Self::OutOfPhysicalMemory => "Out of physical memory",
            Self::OutOfTranslationTables => "Out of translation tables",
            Self::OutOfHeap => "Out of heap",
            Self::CoreOutOfRange => "Core number out of range",
        }
    }
}

/// Fixed maximum length of an [`ErrorBlock`]'s description text, including
/// the NUL terminator expected by RISC OS-style error handlers.
pub const ERROR_DESC_LEN: usize = 64;

/// The RISC OS-compatible error-block ABI: a code followed by a
/// NUL-terminated description, read by a caller after a SWI returns with
/// the V flag set.
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ErrorBlock {
    pub code: u32,
    pub desc: [u8; ERROR_DESC_LEN],
}

impl ErrorBlock {
    pub fn new(code: u32, desc: &str) -> Self {
        let mut buf = [0u8; ERROR_DESC_LEN];
        let bytes = desc.as_bytes();
        let n = bytes.len().min(ERROR_DESC_LEN - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        ErrorBlock { code, desc: buf }
    }
}

impl From<UsageError> for ErrorBlock {
    fn from(e: UsageError) -> Self {
        ErrorBlock::new(e.code(), e.description())
    }
}

/// A fault severe enough that the kernel kills the offending task rather
/// than returning an error to it. These never cross the SWI boundary as a
/// return value; they're reported via `kern::fail` / the task's stored
/// fault record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultInfo {
    /// Access to memory outside any region this task owns, or outside the
    /// requested mapping's permitted access.
    MemoryAccess { addr: u32, source: FaultSource },
    /// Data abort on a stack push, with the faulting stack pointer.
    StackOverflow { addr: u32 },
    /// Translation fault with no section or page entry present.
    Translation { addr: u32, source: FaultSource },
    /// Undefined instruction trap.
    IllegalInstruction,
    /// Recursive fault: a fault occurred while the kernel was already
    /// handling a fault or a SWI for this task.
    ReentrantFault,
    /// Explicit `OSTask_EndTask` with a nonzero abort code, or an
    /// unrecoverable condition reported up from a called module.
    Killed { code: u32 },
}

/// Where a fault was taken from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultSource {
    User,
    Kernel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrip() {
        let h = TaskHandle::from_raw(0x1000_2000);
        assert_eq!(h.to_raw(), 0x1000_2000);
        assert_ne!(h.0, 0x1000_2000);
    }

    #[test]
    fn handle_owner_bits_drop_low_bit() {
        let h = TaskHandle::from_raw(0x1000_2000);
        let packed = h.owner_bits() | 1;
        let back = TaskHandle::from_owner_bits(packed);
        assert_eq!(back.to_raw(), 0x1000_2000);
    }

    #[test]
    fn swi_ranges_are_disjoint() {
        assert!(!Swi::is_task_call(Swi::KERNEL_LIMIT));
        assert!(Swi::is_task_call(Swi::TASK_BASE));
        assert!(Swi::is_task_call(Swi::TASK_LIMIT));
        assert!(!Swi::is_task_call(Swi::MODULE_BASE));
        assert!(Swi::is_module_call(Swi::MODULE_BASE));
    }

    #[test]
    fn swi_try_from_known_values() {
        assert_eq!(Swi::try_from(0x300).unwrap(), Swi::Yield);
        assert_eq!(Swi::try_from(0x331).unwrap(), Swi::QueueWait);
        assert!(Swi::try_from(0x30c).is_err());
    }

    #[test]
    fn module_swi_encode_decode_roundtrip() {
        let m = ModuleSwi { chunk: 3, action: 17 };
        let encoded = m.encode();
        assert_eq!(ModuleSwi::decode(encoded), Some(m));
    }

    #[test]
    fn module_swi_decode_rejects_below_base() {
        assert_eq!(ModuleSwi::decode(Swi::MODULE_BASE - 1), None);
    }

    #[test]
    fn mapping_type_flags() {
        assert_eq!(
            MappingType::Rwx.flags(),
            MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE
        );
        assert!(MappingType::Device.is_device());
        assert!(!MappingType::Rw.is_device());
    }

    #[test]
    fn error_block_truncates_long_description() {
        let long = "x".repeat(200);
        let eb = ErrorBlock::new(1, &long);
        assert_eq!(eb.desc.len(), ERROR_DESC_LEN);
        assert_eq!(eb.desc[ERROR_DESC_LEN - 1], 0);
    }

    #[test]
    fn usage_error_into_error_block() {
        let eb: ErrorBlock = UsageError::UnknownSwi.into();
        assert_eq!(eb.code, 0x1e6);
    }
}
