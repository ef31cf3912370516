// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ABI definitions shared between the kernel, the simulated machine, and user
//! programs.
//!
//! Nothing in here does anything; these are the types and constants that the
//! other crates agree on: system call numbers and their register conventions,
//! thread and process identifiers, priorities, exception kinds, and the
//! executable image header.

pub mod noff;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// System call numbers, as user programs place them in register `r2` before
/// trapping.
///
/// The numeric values are load-bearing: they are baked into every user
/// binary's syscall stubs and cannot be reordered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Sysnum {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Join = 3,
    Create = 4,
    Open = 5,
    Read = 6,
    Write = 7,
    Close = 8,
}

impl core::convert::TryFrom<i32> for Sysnum {
    type Error = i32;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Halt),
            1 => Ok(Self::Exit),
            2 => Ok(Self::Exec),
            3 => Ok(Self::Join),
            4 => Ok(Self::Create),
            5 => Ok(Self::Open),
            6 => Ok(Self::Read),
            7 => Ok(Self::Write),
            8 => Ok(Self::Close),
            _ => Err(v),
        }
    }
}

/// Names a user process; an index into the kernel's process table.
pub type SpaceId = i32;

/// Names an open file; an index into the kernel's descriptor table.
pub type OpenFileId = i32;

/// Descriptor reserved for console input.
pub const CONSOLE_INPUT: OpenFileId = 0;
/// Descriptor reserved for console output.
pub const CONSOLE_OUTPUT: OpenFileId = 1;

/// Names a particular incarnation of a kernel thread.
///
/// A `Tid` combines a slot index into the thread table with a generation
/// number. The generation is bumped each time a slot is reused, so a stale
/// `Tid` held across its thread's destruction stops resolving instead of
/// silently naming an unrelated newcomer.
///
/// The index is in the lower `Tid::INDEX_BITS` bits, the generation in the
/// remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Tid(pub u16);

impl Tid {
    /// Number of bits used for the slot index.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `Tid` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        Tid((index as u16 & Self::INDEX_MASK) | (gen.0 as u16) << Self::INDEX_BITS)
    }

    /// Extracts the index part of this id.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this id.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track thread-slot generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Hash)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << Tid::INDEX_BITS >> Tid::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Highest thread priority. Valid priorities are `0..=MAX_PRIORITY`.
pub const MAX_PRIORITY: u8 = 5;

/// Indicates the priority of a thread.
///
/// Priorities are small numbers starting from zero, and numerically *higher*
/// priorities are scheduled first.
///
/// Note that this type deliberately does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means scheduled-first or
/// merely numerically greater.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Hash, FromBytes, IntoBytes, KnownLayout, Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(MAX_PRIORITY);

    /// Makes a priority from `p`, clamping it into `0..=MAX_PRIORITY`.
    pub fn clamped(p: i32) -> Self {
        if p < 0 {
            Self(0)
        } else if p > MAX_PRIORITY as i32 {
            Self(MAX_PRIORITY)
        } else {
            Self(p as u8)
        }
    }

    /// Checks if `self` is scheduled strictly ahead of `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// The numeric queue index for this priority.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl From<u8> for Priority {
    fn from(p: u8) -> Self {
        Self(p.min(MAX_PRIORITY))
    }
}

/// Kinds of trap the simulated processor can raise into the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExceptionKind {
    /// A user program executed a syscall instruction.
    Syscall,
    /// No valid translation for a virtual address (with a software-managed
    /// TLB this is the TLB-refill entry point).
    PageFault,
    /// Write attempted through a translation marked read-only.
    ReadOnly,
    /// Translation was valid but the physical page is off the end of main
    /// memory.
    BusError,
    /// Unaligned or out-of-range virtual address.
    AddressError,
    /// Integer overflow in user code.
    Overflow,
    /// Unimplemented or reserved instruction.
    IllegalInstruction,
}

/// Register-file layout of the simulated processor, and the syscall register
/// conventions.
///
/// The first 32 registers are the MIPS general-purpose set; the remainder are
/// pseudo-registers the simulation tracks alongside them.
pub mod regs {
    /// Number of general-purpose registers.
    pub const NUM_GP_REGS: usize = 32;
    /// Total size of the register file, pseudo-registers included.
    pub const NUM_TOTAL_REGS: usize = 40;

    /// Syscall number and result register.
    pub const V0: usize = 2;
    /// First syscall argument register; arguments occupy `r4..=r7`.
    pub const A0: usize = 4;
    pub const A1: usize = 5;
    pub const A2: usize = 6;
    pub const A3: usize = 7;
    /// User stack pointer.
    pub const SP: usize = 29;
    /// Return address, set by the `jal` convention.
    pub const RA: usize = 31;

    /// Current program counter.
    pub const PC: usize = 34;
    /// Next program counter, one instruction ahead (branch delay).
    pub const NEXT_PC: usize = 35;
    /// Previous program counter, for debugging.
    pub const PREV_PC: usize = 36;
    /// Virtual address of the most recent translation failure.
    pub const BAD_VADDR: usize = 39;

    /// Byte width of one instruction; the PC advances by this much.
    pub const INSN_BYTES: i32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn sysnum_round_trip() {
        for n in 0..=8 {
            let s = Sysnum::try_from(n).unwrap();
            assert_eq!(s as i32, n);
        }
        assert!(Sysnum::try_from(9).is_err());
        assert!(Sysnum::try_from(-1).is_err());
    }

    #[test]
    fn tid_packs_index_and_generation() {
        let t = Tid::for_index_and_gen(37, Generation::from(3));
        assert_eq!(t.index(), 37);
        assert_eq!(t.generation(), Generation::from(3));
    }

    #[test]
    fn generation_wraps_within_field() {
        let mut g = Generation::ZERO;
        for _ in 0..1000 {
            g = g.next();
            let t = Tid::for_index_and_gen(1023, g);
            assert_eq!(t.index(), 1023, "generation bled into index bits");
        }
    }

    #[test]
    fn priority_clamps() {
        assert_eq!(Priority::clamped(-4), Priority::MIN);
        assert_eq!(Priority::clamped(99), Priority::MAX);
        assert_eq!(Priority::clamped(3), Priority::from(3));
        assert!(Priority::from(5).is_more_important_than(Priority::from(0)));
        assert!(!Priority::from(2).is_more_important_than(Priority::from(2)));
    }
}
