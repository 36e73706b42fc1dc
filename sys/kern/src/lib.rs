// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-core ARMv7-A microkernel.
//!
//! This is the application-independent portion of the operating system, and
//! the main part that runs in privileged mode: the cooperative scheduler, the
//! VMSAv6 MMU driver, the first-fit heaps, locks, pipes, queues, interrupt
//! dispatch, and the SWI decode table that ties them to the external
//! interface.
//!
//! Everything outside of the `arch` module is written to be portable across
//! ARMv7-A cores (it only assumes 32-bit pointers and the `arch` surface
//! documented on that module); `arch::armv7a` is the one real hardware
//! backend, and `arch::sim` lets the same portable code run as a normal host
//! binary under `cargo test`.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Separate compilation. Allow the kernel, and each task of the application,
//!    to be compiled separately and then combined.
//! 2. Static configuration. As much as possible, the system should take a
//!    single shape specified at compile time.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms. (This also relates to the preference for safe code, since
//!    most clever algorithms used in kernels wind up requiring `unsafe`.)

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(naked_functions))]

#[macro_use]
pub mod klog;

#[macro_use]
pub mod arch;

pub mod app;
pub mod dll;
pub mod err;
pub mod fail;
pub mod header;
pub mod heap;
pub mod irq;
pub mod locks;
pub mod mmu;
pub mod module;
pub mod pipe;
pub mod profiling;
pub mod queue;
pub mod rawpage;
pub mod spinlock;
pub mod startup;
pub mod swi;
pub mod task;
pub mod time;
pub mod uninit;
pub mod util;
