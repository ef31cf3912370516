// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register file, main memory, and address translation.

use abi::regs;
use abi::ExceptionKind;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::{MachineConfig, PAGE_SIZE};

bitflags! {
    /// State bits of one translation entry.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct EntryFlags: u8 {
        /// The entry maps something; invalid entries are ignored.
        const VALID = 1 << 0;
        /// Writes through this entry raise `ReadOnly`.
        const READ_ONLY = 1 << 1;
        /// Set by the translation unit on any access.
        const USED = 1 << 2;
        /// Set by the translation unit on a write.
        const DIRTY = 1 << 3;
    }
}

/// One entry of the TLB or of a page table: a virtual-to-physical page
/// mapping plus its state bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TranslationEntry {
    pub virtual_page: usize,
    pub physical_page: usize,
    pub flags: EntryFlags,
}

/// A failed translation: what went wrong, and the virtual address that was
/// being translated (destined for the `BAD_VADDR` pseudo-register).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TranslateFault {
    pub kind: ExceptionKind,
    pub vaddr: i32,
}

/// The simulated processor state: registers, main memory, and either a TLB
/// or a published linear page table.
pub struct Cpu {
    registers: [i32; regs::NUM_TOTAL_REGS],
    memory: Vec<u8>,
    tlb: Option<Vec<TranslationEntry>>,
    page_table: Vec<TranslationEntry>,
}

impl Cpu {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            registers: [0; regs::NUM_TOTAL_REGS],
            memory: vec![0; config.phys_pages * PAGE_SIZE],
            tlb: config
                .tlb
                .map(|n| vec![TranslationEntry::default(); n]),
            page_table: Vec::new(),
        }
    }

    /// Number of physical frames in main memory.
    pub fn phys_pages(&self) -> usize {
        self.memory.len() / PAGE_SIZE
    }

    pub fn read_register(&self, num: usize) -> i32 {
        assert!(num < regs::NUM_TOTAL_REGS, "register {num} out of range");
        self.registers[num]
    }

    pub fn write_register(&mut self, num: usize, value: i32) {
        assert!(num < regs::NUM_TOTAL_REGS, "register {num} out of range");
        self.registers[num] = value;
    }

    /// Raw main memory, for the loader's segment copies and frame zeroing.
    pub fn main_memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn main_memory(&self) -> &[u8] {
        &self.memory
    }

    /// True if translation goes through a software-managed TLB (and page
    /// faults are the kernel's problem).
    pub fn has_tlb(&self) -> bool {
        self.tlb.is_some()
    }

    /// The TLB entries. Panics if the machine was configured without one.
    pub fn tlb(&self) -> &[TranslationEntry] {
        self.tlb.as_deref().expect("machine has no TLB")
    }

    pub fn tlb_mut(&mut self) -> &mut [TranslationEntry] {
        self.tlb.as_deref_mut().expect("machine has no TLB")
    }

    /// Publishes `table` as the current linear page table (no-TLB mode).
    pub fn set_page_table(&mut self, table: Vec<TranslationEntry>) {
        assert!(self.tlb.is_none(), "TLB machines refill, not publish");
        self.page_table = table;
    }

    /// Reads back the published page table, e.g. to persist dirty bits.
    pub fn page_table(&self) -> &[TranslationEntry] {
        &self.page_table
    }

    /// Translates `vaddr` for an access of `size` bytes (1, 2, or 4),
    /// returning a physical byte address.
    ///
    /// On success the matching entry's `USED` bit is set, plus `DIRTY` when
    /// `writing`. Failures name the exception the processor would raise.
    pub fn translate(
        &mut self,
        vaddr: usize,
        size: usize,
        writing: bool,
    ) -> Result<usize, TranslateFault> {
        let fault = |kind| TranslateFault {
            kind,
            vaddr: vaddr as i32,
        };

        // Alignment first, as the hardware checks it before the TLB.
        debug_assert!(size == 1 || size == 2 || size == 4);
        if vaddr % size != 0 {
            return Err(fault(ExceptionKind::AddressError));
        }

        let vpn = vaddr / PAGE_SIZE;
        let offset = vaddr % PAGE_SIZE;

        let entry = match &mut self.tlb {
            None => {
                if vpn >= self.page_table.len() {
                    return Err(fault(ExceptionKind::AddressError));
                }
                let e = &mut self.page_table[vpn];
                if !e.flags.contains(EntryFlags::VALID) {
                    return Err(fault(ExceptionKind::PageFault));
                }
                e
            }
            Some(tlb) => {
                match tlb.iter_mut().find(|e| {
                    e.flags.contains(EntryFlags::VALID) && e.virtual_page == vpn
                }) {
                    Some(e) => e,
                    None => return Err(fault(ExceptionKind::PageFault)),
                }
            }
        };

        if writing && entry.flags.contains(EntryFlags::READ_ONLY) {
            return Err(fault(ExceptionKind::ReadOnly));
        }
        entry.flags.insert(EntryFlags::USED);
        if writing {
            entry.flags.insert(EntryFlags::DIRTY);
        }

        let pfn = entry.physical_page;
        if pfn >= self.phys_pages() {
            return Err(fault(ExceptionKind::BusError));
        }

        Ok(pfn * PAGE_SIZE + offset)
    }

    /// Reads `size` bytes (1, 2, or 4) of user memory at virtual `addr`,
    /// little-endian. On a fault the caller is expected to raise the
    /// exception and decide whether to retry.
    pub fn read_mem(
        &mut self,
        addr: usize,
        size: usize,
    ) -> Result<i32, TranslateFault> {
        let pa = self.translate(addr, size, false)?;
        let m = &self.memory;
        Ok(match size {
            1 => m[pa] as i8 as i32,
            2 => LittleEndian::read_i16(&m[pa..]) as i32,
            4 => LittleEndian::read_i32(&m[pa..]),
            _ => unreachable!(),
        })
    }

    /// Writes the low `size` bytes (1, 2, or 4) of `value` to virtual
    /// `addr`, little-endian.
    pub fn write_mem(
        &mut self,
        addr: usize,
        size: usize,
        value: i32,
    ) -> Result<(), TranslateFault> {
        let pa = self.translate(addr, size, true)?;
        let m = &mut self.memory;
        match size {
            1 => m[pa] = value as u8,
            2 => LittleEndian::write_i16(&mut m[pa..], value as i16),
            4 => LittleEndian::write_i32(&mut m[pa..], value),
            _ => unreachable!(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_cpu(pages: usize) -> Cpu {
        let mut cpu = Cpu::new(&MachineConfig {
            phys_pages: pages,
            tlb: None,
        });
        // Identity-map every frame.
        let table = (0..pages)
            .map(|p| TranslationEntry {
                virtual_page: p,
                physical_page: p,
                flags: EntryFlags::VALID,
            })
            .collect();
        cpu.set_page_table(table);
        cpu
    }

    #[test]
    fn word_round_trip_is_little_endian() {
        let mut cpu = linear_cpu(2);
        cpu.write_mem(4, 4, 0x1234_5678).unwrap();
        assert_eq!(cpu.read_mem(4, 4).unwrap(), 0x1234_5678);
        assert_eq!(cpu.read_mem(4, 1).unwrap(), 0x78);
    }

    #[test]
    fn byte_reads_sign_extend() {
        let mut cpu = linear_cpu(1);
        cpu.write_mem(0, 1, -1).unwrap();
        assert_eq!(cpu.read_mem(0, 1).unwrap(), -1);
    }

    #[test]
    fn unaligned_word_access_faults() {
        let mut cpu = linear_cpu(1);
        let err = cpu.read_mem(2, 4).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::AddressError);
        assert_eq!(err.vaddr, 2);
    }

    #[test]
    fn access_past_page_table_faults() {
        let mut cpu = linear_cpu(2);
        let err = cpu.read_mem(2 * PAGE_SIZE, 1).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::AddressError);
    }

    #[test]
    fn invalid_entry_is_a_page_fault() {
        let mut cpu = linear_cpu(2);
        let mut table = cpu.page_table().to_vec();
        table[1].flags = EntryFlags::empty();
        cpu.set_page_table(table);
        let err = cpu.read_mem(PAGE_SIZE, 1).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::PageFault);
    }

    #[test]
    fn read_only_entry_rejects_writes_only() {
        let mut cpu = linear_cpu(1);
        let mut table = cpu.page_table().to_vec();
        table[0].flags = EntryFlags::VALID | EntryFlags::READ_ONLY;
        cpu.set_page_table(table);
        assert!(cpu.read_mem(0, 1).is_ok());
        let err = cpu.write_mem(0, 1, 7).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::ReadOnly);
    }

    #[test]
    fn tlb_miss_faults_and_refill_recovers() {
        let mut cpu = Cpu::new(&MachineConfig {
            phys_pages: 4,
            tlb: Some(2),
        });
        let err = cpu.read_mem(0, 1).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::PageFault);

        cpu.tlb_mut()[0] = TranslationEntry {
            virtual_page: 0,
            physical_page: 3,
            flags: EntryFlags::VALID,
        };
        cpu.write_mem(0, 1, 0x5A).unwrap();
        assert_eq!(cpu.main_memory()[3 * PAGE_SIZE], 0x5A);
        assert!(cpu.tlb()[0].flags.contains(EntryFlags::DIRTY));
    }

    #[test]
    fn translation_sets_used_and_dirty_bits() {
        let mut cpu = linear_cpu(1);
        cpu.read_mem(0, 1).unwrap();
        assert!(cpu.page_table()[0].flags.contains(EntryFlags::USED));
        assert!(!cpu.page_table()[0].flags.contains(EntryFlags::DIRTY));
        cpu.write_mem(0, 1, 1).unwrap();
        assert!(cpu.page_table()[0].flags.contains(EntryFlags::DIRTY));
    }
}
