// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel access to user memory.
//!
//! Transfers go byte by byte through the machine's translation, so they
//! fault exactly like user-mode accesses do. A fault is raised into the
//! exception path (which, for a TLB miss, refills the TLB) and the access
//! is retried exactly once; a second failure means the kernel's own
//! bookkeeping is wrong, which is fatal.

use crate::syscalls;
use crate::KernelState;

/// Reads `size` bytes of user memory at `addr`, retrying once after a
/// raised fault.
pub(crate) fn read_mem(state: &mut KernelState, addr: usize, size: usize) -> i32 {
    match state.cpu.read_mem(addr, size) {
        Ok(v) => v,
        Err(fault) => {
            syscalls::raise_exception(state, fault);
            state.cpu.read_mem(addr, size).unwrap_or_else(|f| {
                panic!(
                    "user memory read at {addr:#x} still faulting after retry: {:?}",
                    f.kind
                )
            })
        }
    }
}

/// Writes the low `size` bytes of `value` at `addr`, retrying once after a
/// raised fault.
pub(crate) fn write_mem(state: &mut KernelState, addr: usize, size: usize, value: i32) {
    match state.cpu.write_mem(addr, size, value) {
        Ok(()) => (),
        Err(fault) => {
            syscalls::raise_exception(state, fault);
            state.cpu.write_mem(addr, size, value).unwrap_or_else(|f| {
                panic!(
                    "user memory write at {addr:#x} still faulting after retry: {:?}",
                    f.kind
                )
            });
        }
    }
}

/// Reads a NUL-terminated string out of user memory.
pub(crate) fn read_str_from_user(state: &mut KernelState, addr: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0.. {
        let b = read_mem(state, addr + i, 1) as u8;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Writes `s` plus its NUL terminator into user memory at `addr`.
pub(crate) fn write_str_to_user(state: &mut KernelState, s: &str, addr: usize) {
    for (i, b) in s.bytes().enumerate() {
        write_mem(state, addr + i, 1, b as i32);
    }
    write_mem(state, addr + s.len(), 1, 0);
}

/// Reads `count` raw bytes out of user memory.
pub(crate) fn read_buf_from_user(state: &mut KernelState, addr: usize, count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| read_mem(state, addr + i, 1) as u8)
        .collect()
}

/// Writes `bytes` into user memory at `addr`.
pub(crate) fn write_buf_to_user(state: &mut KernelState, bytes: &[u8], addr: usize) {
    for (i, b) in bytes.iter().enumerate() {
        write_mem(state, addr + i, 1, *b as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrspace::AddrSpace;
    use crate::{Kernel, KernelState, Options};
    use abi::noff::{NoffHeader, Segment};
    use machine::filesys::{FileSystem, StubFileSystem};
    use machine::PAGE_SIZE;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// Boots a kernel and gives its main thread a small address space, the
    /// way an exec'd thread would have one.
    fn kernel_with_space(tlb: Option<usize>) -> Arc<Kernel> {
        let mut fs = StubFileSystem::new();
        let header = NoffHeader {
            code: Segment {
                virtual_addr: 0,
                in_file_addr: NoffHeader::SIZE as i32,
                size: 2 * PAGE_SIZE as i32,
            },
            ..Default::default()
        };
        let mut image = header.to_bytes().to_vec();
        image.extend(std::iter::repeat(0).take(2 * PAGE_SIZE));
        fs.install("img", image);

        let kernel = Kernel::start(Options {
            tlb,
            file_system: Some(Box::new(fs)),
            ..Default::default()
        });
        {
            let mut g = kernel.state();
            let mut file = g.fs.open("img").unwrap();
            let space = AddrSpace::load(&mut g, file.as_mut(), "img").unwrap();
            drop(file);
            g.threads[0].as_mut().unwrap().space = Some(space);
            let cur = g.current;
            let KernelState { threads, cpu, .. } = &mut *g;
            threads[cur]
                .as_mut()
                .unwrap()
                .space
                .as_mut()
                .unwrap()
                .restore_state(cpu);
        }
        kernel
    }

    #[test]
    fn string_round_trip_with_linear_page_table() {
        let kernel = kernel_with_space(None);
        let mut g = kernel.state();
        write_str_to_user(&mut g, "hello world", 64);
        assert_eq!(read_str_from_user(&mut g, 64), "hello world");
    }

    #[test]
    fn string_round_trip_faults_and_refills_through_the_tlb() {
        let kernel = kernel_with_space(Some(2));
        let mut g = kernel.state();
        // Straddle a page boundary so the copy touches two pages.
        let addr = PAGE_SIZE - 4;
        write_str_to_user(&mut g, "boundary", addr);
        assert_eq!(read_str_from_user(&mut g, addr), "boundary");
        assert!(g.stats.page_faults > 0, "TLB path should have faulted");
    }

    #[test]
    fn buffer_round_trip() {
        let kernel = kernel_with_space(None);
        let mut g = kernel.state();
        let data = [0u8, 1, 2, 254, 255];
        write_buf_to_user(&mut g, &data, 32);
        assert_eq!(read_buf_from_user(&mut g, 32, data.len()), data);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn any_nul_free_string_survives(s in "[^\u{0}]{0,40}") {
            let kernel = kernel_with_space(Some(2));
            let mut g = kernel.state();
            write_str_to_user(&mut g, &s, 100);
            prop_assert_eq!(read_str_from_user(&mut g, 100), s);
        }
    }
}
