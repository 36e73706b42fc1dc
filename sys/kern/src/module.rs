// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! L9 (module half): the loadable-module list and each module's
//! `action[0..64]` SWI routing table.
//!
//! Parsing a module's keyword table, relocation directives, or messages
//! file is out of scope (SPEC_FULL.md §C) -- we keep the header as a typed
//! ABI struct (spec §6) and the chunk/action-table bookkeeping that the
//! dispatcher in `crate::swi` actually needs, and treat `RMLoad` as "copy
//! the image in, read its header, hand back a chunk number" rather than a
//! real loader.

use abi::{ModuleHeader, QueueHandle, UsageError};

use crate::heap;

pub const MODULE_POOL_CAPACITY: usize = 16;
pub const ACTIONS_PER_MODULE: usize = 64;

/// What `action[i]` does with a module SWI, per spec §4.10.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModuleAction {
    Unbound,
    /// Called inline with the caller's registers, at this code address
    /// within the module's copied image.
    Code(u32),
    /// Routed through `crate::queue::enqueue_for_queue`.
    Queue(QueueHandle),
}

struct Module {
    in_use: bool,
    chunk: u32,
    header: ModuleHeader,
    image_base: u32,
    actions: [ModuleAction; ACTIONS_PER_MODULE],
}

impl Module {
    const fn empty() -> Self {
        Module {
            in_use: false,
            chunk: 0,
            header: ModuleHeader {
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
            },
            image_base: 0,
            actions: [ModuleAction::Unbound; ACTIONS_PER_MODULE],
        }
    }
}

/// Modules parked here while their `init_offset` routine runs with
/// `RegisterSwiHandlers` calls attributed to them (spec's "distinguished
/// in-init context", §4.10).
struct ModuleList {
    lock: crate::spinlock::KernelLock,
    modules: core::cell::UnsafeCell<[Module; MODULE_POOL_CAPACITY]>,
    next_chunk: core::cell::Cell<u32>,
    /// The module currently running its init routine, if any; only this
    /// chunk's `RegisterSwiHandlers` calls are honored (spec §4.10).
    in_init: core::cell::Cell<Option<u32>>,
}

unsafe impl Sync for ModuleList {}

impl ModuleList {
    const fn new() -> Self {
        const EMPTY: Module = Module::empty();
        ModuleList {
            lock: crate::spinlock::KernelLock::new(),
            modules: core::cell::UnsafeCell::new([EMPTY; MODULE_POOL_CAPACITY]),
            next_chunk: core::cell::Cell::new(0),
            in_init: core::cell::Cell::new(None),
        }
    }

    fn find_mut(&self, chunk: u32) -> Option<&mut Module> {
        let modules = unsafe { &mut *self.modules.get() };
        modules.iter_mut().find(|m| m.in_use && m.chunk == chunk)
    }
}

static MODULES: ModuleList = ModuleList::new();

/// `OS_Module RMLoad name`. `image` is the module's bytes, already located
/// by the caller (ROM or filesystem lookup is out of scope); this copies
/// them into the shared heap, reads the header at offset 0, assigns a
/// fresh chunk, and enters the "in-init" context for the duration of the
/// caller-supplied `run_init` closure, which is expected to call `start`
/// at `image_base + header.init_offset` and, from within that call,
/// `crate::swi`'s `RegisterSwiHandlers` path (which delegates to
/// [`register_swi_handlers`] below).
pub fn rm_load(
    image: &[u8],
    core: u32,
    run_init: impl FnOnce(u32, &ModuleHeader),
) -> Result<u32, UsageError> {
    if image.len() < core::mem::size_of::<ModuleHeader>() {
        return Err(UsageError::BadArgument);
    }
    let region = heap::SHARED
        .allocate(image.len(), core)
        .ok_or(UsageError::OutOfHeap)?;
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), region.as_ptr(), image.len());
    }
    let image_base = region.as_ptr() as u32;
    let header = unsafe { (region.as_ptr() as *const ModuleHeader).read_unaligned() };

    let chunk = MODULES.lock.with(core, || {
        let modules = unsafe { &mut *MODULES.modules.get() };
        let slot = modules.iter_mut().find(|m| !m.in_use)?;
        let chunk = MODULES.next_chunk.get();
        MODULES.next_chunk.set(chunk + 1);
        *slot = Module {
            in_use: true,
            chunk,
            header,
            image_base,
            actions: [ModuleAction::Unbound; ACTIONS_PER_MODULE],
        };
        Some(chunk)
    });
    let Some(chunk) = chunk else {
        unsafe { heap::SHARED.free(region, core) };
        return Err(UsageError::OutOfHeap);
    };

    MODULES.in_init.set(Some(chunk));
    run_init(image_base, &header);
    MODULES.in_init.set(None);

    Ok(chunk)
}

/// `RegisterSwiHandlers`, as called from within a module's init routine or
/// its SWI handler re-registering later. Only honored for the module
/// currently `in_init`-marked, or (after init) the module owning `chunk`
/// itself -- the dispatcher in `crate::swi` is what actually knows which
/// caller this is, and it only ever calls this with the chunk it resolved
/// for that caller.
pub fn register_swi_handlers(
    chunk: u32,
    bindings: &[(u8, ModuleAction)],
    core: u32,
) -> Result<(), UsageError> {
    MODULES.lock.with(core, || {
        let module = MODULES.find_mut(chunk).ok_or(UsageError::UnknownSwi)?;
        for &(action, binding) in bindings {
            let slot = module
                .actions
                .get_mut(action as usize)
                .ok_or(UsageError::BadArgument)?;
            *slot = binding;
        }
        Ok(())
    })
}

/// Looks up the action bound to `chunk`'s `action[index]`, for
/// `crate::swi` to route a decoded [`abi::ModuleSwi`].
pub fn lookup(chunk: u32, action: u8, core: u32) -> Result<ModuleAction, UsageError> {
    MODULES.lock.with(core, || {
        let module = MODULES.find_mut(chunk).ok_or(UsageError::UnknownSwi)?;
        module
            .actions
            .get(action as usize)
            .copied()
            .ok_or(UsageError::UnknownSwi)
    })
}

/// Whether `chunk` is presently running its init routine -- `crate::swi`
/// consults this to attribute a `RegisterSwiHandlers` call correctly.
pub fn is_in_init(chunk: u32) -> bool {
    MODULES.in_init.get() == Some(chunk)
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
            unsafe { heap::SHARED.init(region, 0) };
        });
    }

    fn sample_header() -> ModuleHeader {
        ModuleHeader {
            start_offset: 0x40,
            init_offset: 0x20,
            finalise_offset: 0,
            service_call_offset: 0x60,
            title_offset: 0,
            help_offset: 0,
            keyword_table_offset: 0,
            swi_chunk: 0,
            swi_handler_offset: 0x80,
            swi_decoding_table_offset: 0,
            swi_decoding_code_offset: 0,
            messages_file_offset: 0,
            flags: 0,
        }
    }

    fn header_bytes(header: &ModuleHeader) -> Vec<u8> {
        let mut bytes = vec![0u8; core::mem::size_of::<ModuleHeader>() + 64];
        unsafe {
            core::ptr::copy_nonoverlapping(
                header as *const ModuleHeader as *const u8,
                bytes.as_mut_ptr(),
                core::mem::size_of::<ModuleHeader>(),
            );
        }
        bytes
    }

    #[test]
    fn rm_load_registers_action_during_init() {
        init_heap_once();
        let image = header_bytes(&sample_header());
        let chunk = rm_load(&image, 0, |_base, _hdr| {
            let c = MODULES.in_init.get().unwrap();
            assert!(is_in_init(c));
            register_swi_handlers(
                c,
                &[(0, ModuleAction::Queue(QueueHandle::from_raw(0x1000)))],
                0,
            )
            .unwrap();
        })
        .unwrap();

        assert!(!is_in_init(chunk));
        assert_eq!(
            lookup(chunk, 0, 0).unwrap(),
            ModuleAction::Queue(QueueHandle::from_raw(0x1000))
        );
        assert_eq!(lookup(chunk, 1, 0).unwrap(), ModuleAction::Unbound);
    }

    #[test]
    fn unknown_chunk_is_unknown_swi() {
        assert!(matches!(lookup(999, 0, 0), Err(UsageError::UnknownSwi)));
    }

    #[test]
    fn undersized_image_is_bad_argument() {
        init_heap_once();
        assert!(matches!(
            rm_load(&[0u8; 4], 0, |_, _| {}),
            Err(UsageError::BadArgument)
        ));
    }
}
