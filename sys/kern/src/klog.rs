// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel logging.
//!
//! `klog!` formats a message and writes it to whichever sink is selected by
//! Cargo feature:
//!
//! - `klog-itm` — writes bytes to ITM stimulus port 0, for boards with a
//!   debug probe attached.
//! - `klog-semihosting` — routes through the ARM semihosting `SYS_WRITEC`
//!   call, for use under QEMU.
//! - neither feature (the default off-target build) — appends to an
//!   in-memory ring buffer that host-side tests can inspect with
//!   [`drain`].
//!
//! Exactly one of these backs `write_str` at a time; `klog!` itself doesn't
//! know or care which.

use core::fmt::Write;

struct KLog;

#[cfg(feature = "klog-itm")]
mod sink {
    //! Raw ITM stimulus-port writer. We poke the CoreSight ITM registers
    //! directly rather than pull in a crate, since the only thing we need is
    //! "write a byte to stimulus port 0."
    const ITM_BASE: usize = 0xE000_0000;
    const STIM0: usize = ITM_BASE;
    const TER: usize = ITM_BASE + 0xE00;
    const TCR: usize = ITM_BASE + 0xE80;

    fn stim0_ready() -> bool {
        unsafe { (STIM0 as *const u32).read_volatile() & 1 != 0 }
    }

    pub fn write_bytes(bytes: &[u8]) {
        unsafe {
            if (TCR as *const u32).read_volatile() & 1 == 0
                || (TER as *const u32).read_volatile() & 1 == 0
            {
                return;
            }
            for &b in bytes {
                while !stim0_ready() {}
                (STIM0 as *mut u32).write_volatile(b as u32);
            }
        }
    }
}

#[cfg(feature = "klog-semihosting")]
mod sink {
    //! ARM semihosting `SYS_WRITEC`: one character per SVC, slow but
    //! dependency-free and the standard way to get text out of QEMU.
    const SYS_WRITEC: u32 = 0x03;

    pub fn write_bytes(bytes: &[u8]) {
        for &b in bytes {
            let c = b;
            unsafe {
                core::arch::asm!(
                    "svc 0x123456",
                    in("r0") SYS_WRITEC,
                    in("r1") &c as *const u8,
                    options(nostack),
                );
            }
        }
    }
}

#[cfg(not(any(feature = "klog-itm", feature = "klog-semihosting")))]
pub mod sink {
    //! Host/test sink: an in-memory ring buffer. Not thread-safe by design
    //! -- the host test harness runs kernel logic single-threaded per test,
    //! mirroring the no-preemption-of-supervisor-code invariant the real
    //! kernel relies on.
    const RING_LEN: usize = 4096;
    static mut RING: [u8; RING_LEN] = [0; RING_LEN];
    static mut HEAD: usize = 0;

    pub fn write_bytes(bytes: &[u8]) {
        unsafe {
            for &b in bytes {
                RING[HEAD % RING_LEN] = b;
                HEAD += 1;
            }
        }
    }

    /// Returns the bytes written since boot, oldest surviving byte first.
    /// Exposed for `#[cfg(test)]` assertions against expected log output.
    pub fn drain() -> Drained {
        Drained
    }

    /// Opaque handle forcing callers through `copy_into`, since we have no
    /// allocator here to hand back an owned `Vec`.
    pub struct Drained;

    impl Drained {
        pub fn copy_into(self, out: &mut [u8]) -> usize {
            unsafe {
                let n = HEAD.min(RING_LEN).min(out.len());
                let start = HEAD.saturating_sub(n);
                for i in 0..n {
                    out[i] = RING[(start + i) % RING_LEN];
                }
                n
            }
        }
    }

    #[cfg(test)]
    pub fn reset() {
        unsafe {
            HEAD = 0;
            RING = [0; RING_LEN];
        }
    }
}

impl Write for KLog {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        sink::write_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _klog_fmt(args: core::fmt::Arguments<'_>) {
    let mut w = KLog;
    let _ = w.write_fmt(args);
    let _ = w.write_str("\n");
}

/// Formats and logs a message. Cheap to call even when no sink is attached;
/// the format machinery still runs (this is not a compiled-out no-op), so
/// avoid it in hot per-instruction paths.
#[macro_export]
macro_rules! klog {
    ($($args:tt)*) => {
        $crate::klog::_klog_fmt(format_args!($($args)*))
    };
}

/// Logs a raw byte slice with no formatting, for paths (like an IRQ
/// trampoline) that would rather not risk invoking the formatter.
#[macro_export]
macro_rules! klog_bytes {
    ($bytes:expr) => {
        $crate::klog::sink::write_bytes($bytes)
    };
}
