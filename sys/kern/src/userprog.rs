// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-mode execution.
//!
//! There is no instruction interpreter; a "user program" is a host-native
//! body registered against an executable path. What stays faithful is the
//! machine state: a running program owns the simulated registers, its
//! loads and stores go through the current translation (faulting and
//! refilling like interpreted code would), and its only doorway into the
//! kernel is the syscall trap.

use std::collections::HashMap;
use std::sync::Arc;

use abi::{regs, Sysnum};
use machine::USER_TICK;

use crate::interrupt::{self, TickMode};
use crate::syscalls;
use crate::Kernel;

/// A user program body. Registered against the executable path it stands
/// in for; `run`'s return value becomes the process's exit value if the
/// body never calls `Exit` itself (the crt stub's behavior).
pub trait UserProgram: Send + Sync {
    fn run(&self, cx: &mut UserCx<'_>) -> i32;
}

impl<F> UserProgram for F
where
    F: Fn(&mut UserCx<'_>) -> i32 + Send + Sync,
{
    fn run(&self, cx: &mut UserCx<'_>) -> i32 {
        self(cx)
    }
}

/// Registered program bodies, keyed by executable path.
pub(crate) struct ProgramTable {
    programs: HashMap<String, Arc<dyn UserProgram>>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }

    pub fn register(&mut self, path: &str, program: Arc<dyn UserProgram>) {
        self.programs.insert(path.to_string(), program);
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn UserProgram>> {
        self.programs.get(path).cloned()
    }
}

/// A running user program's window onto the machine: registers, its own
/// (virtual) memory, and the syscall trap. Every access costs a user tick
/// of simulated time, so device interrupts and time slicing progress while
/// user code runs.
pub struct UserCx<'a> {
    kernel: &'a Kernel,
}

impl UserCx<'_> {
    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }

    pub fn read_reg(&self, reg: usize) -> i32 {
        self.kernel.state().cpu.read_register(reg)
    }

    pub fn write_reg(&mut self, reg: usize, value: i32) {
        self.kernel.state().cpu.write_register(reg, value);
    }

    /// Loads `size` bytes (1, 2, or 4) at virtual `addr`. A TLB miss
    /// refills and retries, invisibly, exactly like an interpreted load.
    pub fn read_mem(&mut self, addr: usize, size: usize) -> i32 {
        let mut g = interrupt::one_tick(self.kernel.state(), USER_TICK, TickMode::User);
        loop {
            match g.cpu.read_mem(addr, size) {
                Ok(v) => return v,
                Err(fault) => syscalls::raise_exception(&mut g, fault),
            }
        }
    }

    /// Stores the low `size` bytes of `value` at virtual `addr`.
    pub fn write_mem(&mut self, addr: usize, size: usize, value: i32) {
        let mut g = interrupt::one_tick(self.kernel.state(), USER_TICK, TickMode::User);
        loop {
            match g.cpu.write_mem(addr, size, value) {
                Ok(()) => return,
                Err(fault) => syscalls::raise_exception(&mut g, fault),
            }
        }
    }

    pub fn read_bytes(&mut self, addr: usize, count: usize) -> Vec<u8> {
        (0..count).map(|i| self.read_mem(addr + i, 1) as u8).collect()
    }

    pub fn write_bytes(&mut self, addr: usize, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.write_mem(addr + i, 1, *b as i32);
        }
    }

    /// Reads a NUL-terminated string at `addr`.
    pub fn read_str(&mut self, addr: usize) -> String {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_mem(addr + bytes.len(), 1) as u8;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Writes `s` plus its NUL terminator at `addr`.
    pub fn write_str(&mut self, addr: usize, s: &str) {
        self.write_bytes(addr, s.as_bytes());
        self.write_mem(addr + s.len(), 1, 0);
    }

    /// Traps into the kernel with the standard register convention and
    /// returns the result from r2. `Exit` and `Halt` do not come back.
    pub fn syscall(&mut self, num: Sysnum, args: [i32; 4]) -> i32 {
        {
            let mut g = self.kernel.state();
            g.cpu.write_register(regs::V0, num as i32);
            for (i, a) in args.iter().enumerate() {
                g.cpu.write_register(regs::A0 + i, *a);
            }
        }
        syscalls::syscall_entry(self.kernel);
        self.read_reg(regs::V0)
    }

    /// `argc`, as the entry convention left it in r4.
    pub fn argc(&self) -> i32 {
        self.read_reg(regs::A0)
    }

    /// Walks the argv array (r5) and returns the argument strings.
    pub fn argv(&mut self) -> Vec<String> {
        let argv_base = self.read_reg(regs::A1) as usize;
        let mut args = Vec::new();
        loop {
            let ptr = self.read_mem(argv_base + 4 * args.len(), 4);
            if ptr == 0 {
                break;
            }
            args.push(self.read_str(ptr as usize));
        }
        args
    }

    /// The current stack pointer; programs staging scratch data (say, a
    /// path to pass to `Open`) carve space below it.
    pub fn sp(&self) -> i32 {
        self.read_reg(regs::SP)
    }
}

/// Enters user mode on the current thread: runs the program registered for
/// the thread's executable, then exits with its return value. An
/// executable with no registered body just exits 0.
pub(crate) fn enter(kernel: &Kernel) -> ! {
    let (path, program) = {
        let g = kernel.state();
        let path = g
            .current_tcb()
            .space
            .as_ref()
            .expect("entering user mode without an address space")
            .exec_path()
            .to_string();
        let program = g.programs.get(&path);
        (path, program)
    };
    log::debug!("entering user mode for \"{path}\"");

    let mut cx = UserCx { kernel };
    let ret = match program {
        Some(p) => p.run(&mut cx),
        None => 0,
    };
    // Falling off main: the startup stub turns the return value into Exit.
    syscalls::do_exit(kernel, ret)
}

impl Kernel {
    /// Registers a host-native body to stand in for the executable at
    /// `path`. `Exec` of that path will run it in the new process's
    /// context.
    pub fn register_program(&self, path: &str, program: impl UserProgram + 'static) {
        self.state().programs.register(path, Arc::new(program));
    }
}
