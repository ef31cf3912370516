// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulated machine.
//!
//! The kernel in `kern` runs *on* this crate the way a real kernel runs on
//! hardware: everything here is mechanism with no policy. The pieces are
//!
//! - [`cpu::Cpu`]: register file, main memory, and the address translation
//!   unit (software-managed TLB or a published linear page table);
//! - [`interrupt::Timeline`]: simulated time and the queue of pending device
//!   interrupts;
//! - [`console::Console`] and [`timer::Timer`]: the two interrupting devices;
//! - [`stats::Statistics`]: tick and traffic counters;
//! - [`filesys`]: the `FileSystem`/`OpenFile` interface the kernel consumes,
//!   plus the in-memory stub implementation.
//!
//! The instruction interpreter deliberately does not exist. User programs are
//! host-native bodies driven by the kernel; the machine still owns their
//! registers and memory, so loads and stores translate (and fault) exactly as
//! interpreted code would.

pub mod console;
pub mod cpu;
pub mod filesys;
pub mod interrupt;
pub mod stats;
pub mod timer;

/// Bytes per virtual/physical page.
pub const PAGE_SIZE: usize = 128;

/// Default number of physical memory frames.
pub const DEFAULT_PHYS_PAGES: usize = 32;

/// Default number of TLB entries, when a TLB is configured.
pub const DEFAULT_TLB_SIZE: usize = 4;

/// Simulated time consumed by one kernel-mode step.
pub const SYSTEM_TICK: u64 = 10;

/// Simulated time consumed by one user-mode step.
pub const USER_TICK: u64 = 1;

/// Delay between a console operation and its completion interrupt.
pub const CONSOLE_TICKS: u64 = 100;

/// Base interval between timer interrupts.
pub const TIMER_TICKS: u64 = 100;

/// Hardware shape, fixed at power-on.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Number of physical memory frames.
    pub phys_pages: usize,
    /// `Some(n)` for a software-managed TLB of `n` entries; `None` for the
    /// published linear page table.
    pub tlb: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            phys_pages: DEFAULT_PHYS_PAGES,
            tlb: None,
        }
    }
}
