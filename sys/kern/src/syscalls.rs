// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System call and exception dispatch.
//!
//! Entry points into the kernel from user programs. The register
//! convention:
//!
//! ```text
//! call number -- r2      arg1..arg4 -- r4..r7
//! ```
//!
//! The result, if any, goes back in r2, and the program counter must be
//! advanced before returning to user mode, or the program loops making the
//! same call forever. Calls that never return to the caller (`Halt`,
//! `Exit`) skip the advance.
//!
//! Failures a user program can cause come back as -1; everything else is a
//! kernel bug and panics.

use std::convert::TryFrom;

use abi::{regs, ExceptionKind, SpaceId, Sysnum, Tid, CONSOLE_INPUT, CONSOLE_OUTPUT};
use machine::cpu::TranslateFault;
use machine::filesys::{FileSystem, OpenFile};

use crate::addrspace::{self, AddrSpace};
use crate::err::ExecError;
use crate::synch;
use crate::thread;
use crate::tlb;
use crate::umem;
use crate::userprog;
use crate::{Kernel, KernelState};

/// Size in bytes of files made by the `Create` call.
pub(crate) const NEW_FILE_SIZE: usize = 1024;

/// Most arguments an `Exec` command line may carry.
pub(crate) const MAX_ARGS: usize = 10;

/// Entry point for a user program's syscall trap: reads the call number out
/// of r2, dispatches, and advances the PC for calls that return.
pub(crate) fn syscall_entry(kernel: &Kernel) {
    let raw = kernel.state().cpu.read_register(regs::V0);
    let num = match Sysnum::try_from(raw) {
        Ok(num) => num,
        Err(bad) => panic!("unexpected user mode syscall {bad}"),
    };
    log::debug!("syscall {num:?} from \"{}\"", kernel.state().current_tcb().name);

    match num {
        Sysnum::Halt => kernel.halt(),
        Sysnum::Exit => sys_exit(kernel),
        Sysnum::Create => {
            sys_create(kernel);
            increase_pc(kernel);
        }
        Sysnum::Open => {
            sys_open(kernel);
            increase_pc(kernel);
        }
        Sysnum::Read => {
            sys_read(kernel);
            increase_pc(kernel);
        }
        Sysnum::Write => {
            sys_write(kernel);
            increase_pc(kernel);
        }
        Sysnum::Close => {
            sys_close(kernel);
            increase_pc(kernel);
        }
        Sysnum::Join => {
            sys_join(kernel);
            increase_pc(kernel);
        }
        Sysnum::Exec => {
            sys_exec(kernel);
            increase_pc(kernel);
        }
    }
}

/// Raises a machine exception from a failed translation. TLB misses refill
/// and return so the access can retry; everything else is fatal to the
/// kernel (user programs here have no recoverable faults besides misses).
pub(crate) fn raise_exception(state: &mut KernelState, fault: TranslateFault) {
    state.cpu.write_register(regs::BAD_VADDR, fault.vaddr);
    match fault.kind {
        ExceptionKind::PageFault => {
            state.stats.page_faults += 1;
            tlb::refill(state);
        }
        ExceptionKind::ReadOnly => {
            panic!("write through read-only translation at {:#x}", fault.vaddr)
        }
        kind => panic!("unexpected user mode exception {kind:?} at {:#x}", fault.vaddr),
    }
}

/// Advances PC, NextPC, and PrevPC by one instruction.
fn increase_pc(kernel: &Kernel) {
    let mut g = kernel.state();
    let pc = g.cpu.read_register(regs::PC);
    g.cpu.write_register(regs::PREV_PC, pc);
    let next = g.cpu.read_register(regs::NEXT_PC);
    g.cpu.write_register(regs::PC, next);
    g.cpu.write_register(regs::NEXT_PC, next + regs::INSN_BYTES);
}

fn return_value(kernel: &Kernel, value: i32) {
    kernel.state().cpu.write_register(regs::V0, value);
}

fn sys_create(kernel: &Kernel) {
    let mut g = kernel.state();
    let name_addr = g.cpu.read_register(regs::A0) as usize;
    let name = umem::read_str_from_user(&mut g, name_addr);

    if g.fs.create(&name, NEW_FILE_SIZE) {
        log::debug!("file \"{name}\" created");
        g.cpu.write_register(regs::V0, 0);
    } else {
        log::debug!("failed to create file \"{name}\"");
        g.cpu.write_register(regs::V0, -1);
    }
}

fn sys_open(kernel: &Kernel) {
    let mut g = kernel.state();
    let name_addr = g.cpu.read_register(regs::A0) as usize;
    let name = umem::read_str_from_user(&mut g, name_addr);

    match g.fs.open(&name) {
        None => {
            log::debug!("open of \"{name}\": no such file");
            g.cpu.write_register(regs::V0, -1);
        }
        Some(file) => {
            let owner = g.current_tid();
            match g.fd_table.attach(file, owner) {
                Some(id) => {
                    log::debug!("\"{name}\" opened at descriptor {id}");
                    g.cpu.write_register(regs::V0, id);
                }
                None => {
                    log::debug!("open of \"{name}\": descriptor table full");
                    g.cpu.write_register(regs::V0, -1);
                }
            }
        }
    }
}

fn sys_close(kernel: &Kernel) {
    let mut g = kernel.state();
    let id = g.cpu.read_register(regs::A0);
    let caller = g.current_tid();
    match g.fd_table.detach(id, caller) {
        Some(file) => {
            drop(file);
            log::debug!("descriptor {id} closed");
            g.cpu.write_register(regs::V0, 0);
        }
        None => {
            log::debug!("close of bad descriptor {id}");
            g.cpu.write_register(regs::V0, -1);
        }
    }
}

fn sys_read(kernel: &Kernel) {
    let (buf_addr, count, fd) = {
        let g = kernel.state();
        (
            g.cpu.read_register(regs::A0) as usize,
            g.cpu.read_register(regs::A1).max(0) as usize,
            g.cpu.read_register(regs::A2),
        )
    };

    if fd == CONSOLE_OUTPUT {
        log::debug!("refusing read from console output");
        return_value(kernel, -1);
    } else if fd == CONSOLE_INPUT {
        // Blocks per character; must not hold the state guard.
        let buf = kernel.console_get_buffer(count);
        let mut g = kernel.state();
        umem::write_buf_to_user(&mut g, &buf, buf_addr);
        g.cpu.write_register(regs::V0, count as i32);
    } else {
        let mut g = kernel.state();
        let caller = g.current_tid();
        let buf = g.fd_table.get(fd, caller).map(|file| {
            let mut buf = vec![0; count];
            let got = file.read(&mut buf);
            buf.truncate(got);
            buf
        });
        match buf {
            None => {
                log::debug!("read from bad descriptor {fd}");
                g.cpu.write_register(regs::V0, -1);
            }
            Some(buf) => {
                umem::write_buf_to_user(&mut g, &buf, buf_addr);
                g.cpu.write_register(regs::V0, buf.len() as i32);
            }
        }
    }
}

fn sys_write(kernel: &Kernel) {
    let (buf_addr, count, fd) = {
        let g = kernel.state();
        (
            g.cpu.read_register(regs::A0) as usize,
            g.cpu.read_register(regs::A1).max(0) as usize,
            g.cpu.read_register(regs::A2),
        )
    };

    if fd == CONSOLE_INPUT {
        log::debug!("refusing write to console input");
        return_value(kernel, -1);
    } else if fd == CONSOLE_OUTPUT {
        let buf = {
            let mut g = kernel.state();
            umem::read_buf_from_user(&mut g, buf_addr, count)
        };
        // Blocks per character; must not hold the state guard.
        kernel.console_put_buffer(&buf);
        return_value(kernel, 0);
    } else {
        let mut g = kernel.state();
        let buf = umem::read_buf_from_user(&mut g, buf_addr, count);
        let caller = g.current_tid();
        let written = g.fd_table.get(fd, caller).map(|file| file.write(&buf));
        match written {
            None => {
                log::debug!("write to bad descriptor {fd}");
                g.cpu.write_register(regs::V0, -1);
            }
            Some(written) => {
                if written < count {
                    log::debug!("short write: only {written} of {count} bytes");
                }
                // Legacy convention: a successful file write returns 0, not
                // the byte count. User binaries depend on it.
                g.cpu.write_register(regs::V0, 0);
            }
        }
    }
}

/// Records the exit value and ends the calling thread.
pub(crate) fn do_exit(kernel: &Kernel, value: i32) -> ! {
    {
        let mut g = kernel.state();
        let cur = g.current_tid();
        if let Some(id) = g.proc_table.space_id_of(cur) {
            g.proc_table.detach(id, value);
        }
    }
    thread::finish(kernel)
}

fn sys_exit(kernel: &Kernel) -> ! {
    let value = kernel.state().cpu.read_register(regs::A0);
    log::debug!("exit({value})");
    do_exit(kernel, value)
}

fn sys_join(kernel: &Kernel) {
    let id = kernel.state().cpu.read_register(regs::A0) as SpaceId;
    let value = kernel.join_process(id).unwrap_or(-1);
    return_value(kernel, value);
}

fn sys_exec(kernel: &Kernel) {
    let cmd = {
        let mut g = kernel.state();
        let addr = g.cpu.read_register(regs::A0) as usize;
        umem::read_str_from_user(&mut g, addr)
    };
    match exec_command(kernel, &cmd) {
        Ok(id) => return_value(kernel, id),
        Err(e) => {
            log::debug!("exec of \"{cmd}\" failed: {e:?}");
            return_value(kernel, -1);
        }
    }
}

/// The guts of `Exec`: parse `command` into a path plus arguments, load the
/// executable, and fork a joinable thread into it. Returns the new
/// process's SpaceId.
///
/// Any failure past the first allocation unwinds everything allocated so
/// far; a failed exec leaves no trace.
pub(crate) fn exec_command(kernel: &Kernel, command: &str) -> Result<SpaceId, ExecError> {
    let mut tokens = command.split_whitespace();
    let path = tokens.next().ok_or(ExecError::EmptyCommand)?.to_string();
    let args: Vec<String> = tokens.map(str::to_string).collect();
    if args.len() > MAX_ARGS {
        return Err(ExecError::TooManyArgs);
    }

    let mut g = kernel.state();
    let mut file = g.fs.open(&path).ok_or(ExecError::NoSuchFile)?;
    let mut space = AddrSpace::load(&mut g, file.as_mut(), &path)?;
    drop(file);
    log::debug!("executable \"{path}\" loaded");

    space.set_arguments(args);

    let slot = thread::create_locked(&mut g, &path, true, abi::Priority::MIN);
    g.threads[slot].as_mut().unwrap().space = Some(space);
    let tid = Tid::for_index_and_gen(slot, g.generations[slot]);

    let Some(id) = g.proc_table.attach(tid) else {
        // Unwind: reap the thread (and with it the address space's frames)
        // plus the join primitives its joiner would have freed.
        let join = g.threads[slot].as_ref().unwrap().join.unwrap();
        thread::destroy(&mut g, slot);
        synch::cond_destroy_locked(&mut g, join.cond);
        synch::sem_destroy_locked(&mut g, join.sem);
        synch::lock_destroy_locked(&mut g, join.lock);
        return Err(ExecError::ProcessTableFull);
    };

    let g = thread::fork_locked(kernel, g, slot, Box::new(run_process));
    drop(g);
    Ok(id)
}

/// Body of every exec'd thread: publish the address space's translation,
/// set up the entry registers (marshalling argv), and drop into user mode.
fn run_process(kernel: &Kernel) {
    {
        let mut g = kernel.state();
        let cur = g.current;
        let KernelState { threads, cpu, .. } = &mut *g;
        threads[cur]
            .as_mut()
            .unwrap()
            .space
            .as_mut()
            .expect("process thread without an address space")
            .restore_state(cpu);
        addrspace::init_registers(&mut g);
    }
    userprog::enter(kernel)
}

impl Kernel {
    /// Starts a user process from `command` ("path arg1 arg2 ...") without
    /// going through a trap, the way the bootstrap launches the first
    /// program. Returns the new SpaceId.
    pub fn exec(&self, command: &str) -> Result<SpaceId, ExecError> {
        exec_command(self, command)
    }

    /// Waits for process `id` to exit and collects its exit value, freeing
    /// its process-table slot. `None` if no such process.
    pub fn join_process(&self, id: SpaceId) -> Option<i32> {
        let target = self.state().proc_table.thread_for(id)?;
        self.join(target);
        self.state().proc_table.exit_value(id)
    }
}
