// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software TLB refill.
//!
//! With a software-managed TLB, a page fault just means "the TLB doesn't
//! know this page". The handler copies the missing entry out of the running
//! space's page table into a TLB slot and lets the access retry. Victim
//! choice prefers an invalid slot; failing that, a random one.

use machine::cpu::EntryFlags;
use machine::PAGE_SIZE;
use rand::Rng;

use abi::regs;

use crate::KernelState;

/// Handles a TLB miss recorded in `BAD_VADDR`.
pub(crate) fn refill(state: &mut KernelState) {
    let miss_vaddr = state.cpu.read_register(regs::BAD_VADDR);
    let miss_vpage = miss_vaddr as usize / PAGE_SIZE;
    log::debug!("TLB miss at VA {miss_vaddr}, virtual page {miss_vpage}");
    update_tlb(state, miss_vpage);
}

/// Installs the page-table entry for `vpage` into a TLB slot.
pub(crate) fn update_tlb(state: &mut KernelState, vpage: usize) {
    let index = choose_entry_to_replace(state);
    log::trace!(
        "in page {vpage} from \"{}\", out TLB entry {index}",
        state.current_tcb().name
    );

    let mut entry = state
        .current_tcb()
        .space
        .as_ref()
        .expect("TLB miss without an address space")
        .page(vpage);
    entry.flags.insert(EntryFlags::VALID);
    state.cpu.tlb_mut()[index] = entry;
}

fn choose_entry_to_replace(state: &mut KernelState) -> usize {
    let KernelState { cpu, rng, .. } = state;
    let tlb = cpu.tlb();
    match tlb
        .iter()
        .position(|e| !e.flags.contains(EntryFlags::VALID))
    {
        Some(i) => i,
        None => rng.random_range(0..tlb.len()),
    }
}
