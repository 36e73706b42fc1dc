// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host simulation backend, per SPEC_FULL.md A.4: runs the portable
//! kernel on whatever machine `cargo test` is invoked on, standing in
//! for the real ARMv7-A backend so the scheduler, MMU, locks, pipes, and
//! queues get exercised without a cross toolchain or QEMU. Each
//! simulated core is a host OS thread; `signal_event`/`wait_for_event`
//! are built on a condvar rather than `sev`/`wfe`, and `start_first_task`
//! doesn't jump anywhere -- there's no user-mode ARM code to execute on
//! the host, so it just parks the calling thread, which is exactly what
//! the portable tests that reach this far want (they drive
//! `task::SCHED`/`crate::swi::dispatch` directly and only care that the
//! arch surface links and doesn't panic).

use core::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use crate::task::{OSTask, MAX_CORES};

struct EventLine {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl EventLine {
    const fn new() -> Self {
        EventLine {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

static EVENT: EventLine = EventLine::new();

static IRQS_ENABLED: [std::sync::atomic::AtomicBool; MAX_CORES] = {
    const OFF: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
    [OFF; MAX_CORES]
};

/// No simulated clock; sleep-list ticking in tests advances time by
/// calling the scheduler directly rather than waiting on a real timer.
pub fn set_clock_freq(_tick_divisor: u32) {}

/// No real exception modes on the host; present so `crate::startup`
/// doesn't need a `cfg` to call it.
///
/// # Safety
/// None beyond the usual "don't call this from two threads for the same
/// `core` concurrently" -- there's no hardware state to corrupt.
pub unsafe fn init_exception_stacks(_core: u32) {}

/// No MMU to program on the host; `crate::mmu`'s own software tables are
/// all the address translation the simulation backend has.
///
/// # Safety
/// None; no hardware state to corrupt.
pub unsafe fn enable_mmu(_local_l1_pa: u32, _core: u32) {}

/// Wakes every thread parked in [`wait_for_event`].
pub fn signal_event() {
    let mut flag = EVENT.mutex.lock().unwrap();
    *flag = true;
    EVENT.condvar.notify_all();
}

/// Parks this thread until the next [`signal_event`].
pub fn wait_for_event() {
    let mut flag = EVENT.mutex.lock().unwrap();
    while !*flag {
        flag = EVENT.condvar.wait(flag).unwrap();
    }
    *flag = false;
}

/// No cache/TLB to invalidate on the host; present so portable code
/// calling it compiles identically on both backends.
pub fn mmu_barrier() {}

pub fn halt() -> ! {
    loop {
        std::thread::park();
    }
}

pub fn enable_interrupts_on_return(core: u32) {
    IRQS_ENABLED[core as usize].store(true, std::sync::atomic::Ordering::Release);
}

/// Stands in for jumping into user mode: on the host there's no user
/// code to run, so this just parks. A test that wants to observe what
/// `task` would have done calls the portable scheduler/dispatch
/// functions directly instead of relying on this ever returning.
pub fn start_first_task(_core: u32, _task: NonNull<OSTask>) -> ! {
    loop {
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wakes_a_waiter() {
        let waiter = std::thread::spawn(wait_for_event);
        std::thread::sleep(std::time::Duration::from_millis(20));
        signal_event();
        waiter.join().unwrap();
    }

    #[test]
    fn enable_interrupts_is_per_core() {
        enable_interrupts_on_return(2);
        assert!(IRQS_ENABLED[2].load(std::sync::atomic::Ordering::Acquire));
        assert!(!IRQS_ENABLED[3].load(std::sync::atomic::Ordering::Acquire));
    }
}
