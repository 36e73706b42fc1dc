// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-layout marker word embedded in the kernel image so that a debug
//! probe or image-signing tool can find this build's identity without
//! parsing ELF sections.

use core::mem::MaybeUninit;

/// Version/identity marker placed at a fixed offset in the image. Distinct
/// from [`abi::ModuleHeader`], which describes a loadable module's layout,
/// not the kernel's own.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: u32,
    pub version: u32,
    pub epoch: u32,
}

pub const IMAGE_HEADER_MAGIC: u32 = 0x4152_4d4b; // "ARMK"

// Updated by build scripts, which is why this is marked `no_mangle`.
#[used]
#[no_mangle]
#[link_section = ".image_header"]
pub static HEADER: MaybeUninit<ImageHeader> = MaybeUninit::uninit();
