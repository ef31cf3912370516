// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User address spaces: page table, image loading, and entry-point setup.
//!
//! Loading a program means sizing its image (code + initialized data +
//! uninitialized data + stack), claiming that many physical frames, zeroing
//! them, and copying the file segments in page-sized bounded pieces through
//! this space's own translation. Argument vectors, if any, are marshalled
//! onto the top of the user stack when the registers are first initialized.

use abi::noff::{NoffHeader, Segment};
use abi::regs;
use machine::cpu::{Cpu, EntryFlags, TranslationEntry};
use machine::filesys::OpenFile;
use machine::PAGE_SIZE;

use crate::err::ExecError;
use crate::umem;
use crate::KernelState;

/// Bytes of user stack reserved past the image.
pub(crate) const USER_STACK_SIZE: usize = 1024;

/// One process's view of memory.
pub(crate) struct AddrSpace {
    num_pages: usize,
    page_table: Vec<TranslationEntry>,
    args: Option<Vec<String>>,
    exec_path: String,
}

impl AddrSpace {
    /// Builds an address space from an executable image, claiming physical
    /// frames from the kernel's memory map.
    ///
    /// Frames are only claimed after the image checks out and the free
    /// count suffices, so a failure here leaves the memory map untouched.
    pub fn load(
        state: &mut KernelState,
        executable: &mut dyn OpenFile,
        path: &str,
    ) -> Result<Self, ExecError> {
        let mut raw = [0; NoffHeader::SIZE];
        let got = executable.read_at(&mut raw, 0);
        let header = NoffHeader::parse(&raw[..got])?;

        // The stack lives above everything the image defines.
        let size = header.code.size.max(0) as usize
            + header.init_data.size.max(0) as usize
            + header.uninit_data.size.max(0) as usize
            + USER_STACK_SIZE;
        let num_pages = size.div_ceil(PAGE_SIZE);

        if num_pages > state.memory_map.count_clear() {
            return Err(ExecError::OutOfMemory);
        }
        log::debug!(
            "initializing address space for \"{path}\": {num_pages} pages, {} bytes",
            num_pages * PAGE_SIZE
        );

        let mut page_table = Vec::with_capacity(num_pages);
        for vpn in 0..num_pages {
            let frame = state
                .memory_map
                .find()
                .expect("memory map changed under us");
            log::trace!("assigning physical page {frame} to virtual page {vpn}");
            page_table.push(TranslationEntry {
                virtual_page: vpn,
                physical_page: frame,
                flags: EntryFlags::VALID,
            });
            // Zero the frame; uninitialized data and the stack start blank.
            let base = frame * PAGE_SIZE;
            state.cpu.main_memory_mut()[base..base + PAGE_SIZE].fill(0);
        }

        let space = AddrSpace {
            num_pages,
            page_table,
            args: None,
            exec_path: path.to_string(),
        };
        space.copy_segment(state, &header.code, executable);
        space.copy_segment(state, &header.init_data, executable);
        Ok(space)
    }

    /// Copies one file segment into physical memory, page by page, through
    /// this space's translation.
    fn copy_segment(&self, state: &mut KernelState, seg: &Segment, executable: &mut dyn OpenFile) {
        if seg.size <= 0 {
            return;
        }
        log::debug!(
            "loading segment at VA {}, size {}",
            seg.virtual_addr,
            seg.size
        );

        let mut vaddr = seg.virtual_addr as usize;
        let mut in_file = seg.in_file_addr as usize;
        let mut remaining = seg.size as usize;
        while remaining > 0 {
            let offset = vaddr % PAGE_SIZE;
            let chunk = remaining.min(PAGE_SIZE - offset);
            let frame = self.page_table[vaddr / PAGE_SIZE].physical_page;
            let pa = frame * PAGE_SIZE + offset;
            executable.read_at(&mut state.cpu.main_memory_mut()[pa..pa + chunk], in_file);
            vaddr += chunk;
            in_file += chunk;
            remaining -= chunk;
        }
    }

    /// Records the argument vector to marshal at first dispatch.
    pub fn set_arguments(&mut self, args: Vec<String>) {
        for (i, arg) in args.iter().enumerate() {
            log::debug!("arg {i} of \"{}\": {arg}", self.exec_path);
        }
        self.args = Some(args);
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn exec_path(&self) -> &str {
        &self.exec_path
    }

    /// The page-table entry for `vpage`; the TLB handler copies these into
    /// hardware slots.
    pub fn page(&self, vpage: usize) -> TranslationEntry {
        self.page_table[vpage]
    }

    /// Saves per-space machine state on a context switch away from this
    /// space: with a software TLB, dirty entries are written back into the
    /// page table; otherwise the published table (with its fresh used/dirty
    /// bits) is read back.
    pub fn save_state(&mut self, cpu: &mut Cpu) {
        if cpu.has_tlb() {
            for i in 0..cpu.tlb().len() {
                let e = cpu.tlb()[i];
                if e.flags.contains(EntryFlags::VALID) && e.flags.contains(EntryFlags::DIRTY) {
                    self.page_table[e.virtual_page] = e;
                }
            }
        } else {
            self.page_table = cpu.page_table().to_vec();
        }
    }

    /// Restores per-space machine state on a context switch into this
    /// space: a software TLB is flushed (its entries belong to somebody
    /// else); otherwise the page table is published to the machine.
    pub fn restore_state(&mut self, cpu: &mut Cpu) {
        if cpu.has_tlb() {
            for e in cpu.tlb_mut() {
                e.flags.remove(EntryFlags::VALID);
            }
        } else {
            cpu.set_page_table(self.page_table.clone());
        }
    }
}

/// Returns this space's physical frames to the memory map. Called when the
/// owning thread is reaped.
pub(crate) fn release(state: &mut KernelState, space: AddrSpace) {
    for e in &space.page_table {
        state.memory_map.clear(e.physical_page);
    }
}

/// Sets up the current thread's registers to begin executing its program:
/// everything zeroed, PC at the entry point, stack pointer at the top of
/// the space. If the space carries arguments, they go onto the stack first
/// and `r4`/`r5` receive `argc`/`argv`.
pub(crate) fn init_registers(state: &mut KernelState) {
    for r in 0..regs::NUM_TOTAL_REGS {
        state.cpu.write_register(r, 0);
    }
    state.cpu.write_register(regs::PC, 0);
    // The simulated processor has a branch-delay slot; keep NextPC sane.
    state.cpu.write_register(regs::NEXT_PC, regs::INSN_BYTES);

    let (num_pages, args) = {
        let space = state
            .current_tcb()
            .space
            .as_ref()
            .expect("initializing registers without an address space");
        (space.num_pages, space.args.clone())
    };

    let mut sp = (num_pages * PAGE_SIZE) as i32;
    if let Some(args) = args {
        sp = push_args_on_stack(state, sp, &args);
        state.cpu.write_register(regs::A0, args.len() as i32);
        state.cpu.write_register(regs::A1, sp);
    }

    // Back off a little so the first few pushes cannot run off the end of
    // the space.
    state.cpu.write_register(regs::SP, sp - 16);
    log::debug!("initializing stack register to {}", sp - 16);
}

/// Marshals `args` onto the user stack: the strings themselves at the top,
/// then a 4-byte-aligned pointer array terminated by NULL. Returns the new
/// stack pointer, which is also the `argv` value.
fn push_args_on_stack(state: &mut KernelState, top: i32, args: &[String]) -> i32 {
    let mut sp = top;
    let mut arg_ptrs = Vec::with_capacity(args.len());

    for arg in args {
        let bytes = arg.as_bytes();
        sp -= bytes.len() as i32 + 1;
        for (k, b) in bytes.iter().enumerate() {
            umem::write_mem(state, (sp as usize) + k, 1, *b as i32);
        }
        umem::write_mem(state, sp as usize + bytes.len(), 1, 0);
        arg_ptrs.push(sp);
    }

    sp -= 4 * (args.len() as i32 + 1);
    sp -= sp % 4;

    for (i, p) in arg_ptrs.iter().enumerate() {
        umem::write_mem(state, (sp + 4 * i as i32) as usize, 4, *p);
    }
    umem::write_mem(state, (sp + 4 * args.len() as i32) as usize, 4, 0);

    sp
}
