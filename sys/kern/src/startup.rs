// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel bootstrap and the kernel state singleton.
//!
//! `Kernel::start` plays the role a bootloader-plus-`main` pair would on
//! real hardware: it powers on the simulated machine, builds every kernel
//! table, adopts the calling OS thread as the `main` kernel thread, and
//! enables interrupts. After that, everything happens through the returned
//! handle.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use abi::{Generation, Tid};
use machine::console::Console;
use machine::cpu::Cpu;
use machine::filesys::{FileSystem, StubFileSystem};
use machine::interrupt::{IntLevel, Timeline};
use machine::stats::Statistics;
use machine::timer::Timer;
use machine::MachineConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::console::SynchConsole;
use crate::fdtable::FdTable;
use crate::port::PortState;
use crate::proctable::ProcTable;
use crate::sched::Scheduler;
use crate::synch::{CondState, LockState, SemState};
use crate::thread::Tcb;
use crate::userprog::ProgramTable;
use crate::util::Bitmap;

/// Bootstrap knobs, the moral equivalent of the simulator command line.
pub struct Options {
    /// Number of physical memory frames.
    pub phys_pages: usize,
    /// `Some(n)` selects a software-managed TLB of `n` entries; `None`
    /// publishes each process's page table to the machine directly.
    pub tlb: Option<usize>,
    /// Arms the interval timer with randomized periods, shaking thread
    /// interleavings loose (the classic `-rs` flag).
    pub random_slice: bool,
    /// Seed for every randomized decision (timer jitter, TLB victims), so
    /// runs replay.
    pub rng_seed: u64,
    /// The file system to mount; defaults to the in-memory stub. Tests
    /// pre-populate a stub with executables and input files.
    pub file_system: Option<Box<dyn FileSystem>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            phys_pages: machine::DEFAULT_PHYS_PAGES,
            tlb: None,
            random_slice: false,
            rng_seed: 0,
            file_system: None,
        }
    }
}

/// Everything mutable in the kernel and the machine it drives.
///
/// There is exactly one of these per [`Kernel`], behind a mutex. On this
/// uniprocessor, holding the guard is what "interrupts disabled" protects:
/// no context switch can take the processor away from guard-holding code,
/// because switching itself requires the guard.
pub(crate) struct KernelState {
    // Machine side.
    pub cpu: Cpu,
    pub timeline: Timeline,
    pub console_dev: Console,
    pub timer: Option<Timer>,
    pub stats: Statistics,
    pub fs: Box<dyn FileSystem>,

    // Threads and scheduling.
    pub threads: Vec<Option<Tcb>>,
    pub generations: Vec<Generation>,
    pub current: usize,
    pub to_destroy: Option<usize>,
    pub sched: Scheduler,

    // Synchronization object slabs.
    pub sems: Vec<Option<SemState>>,
    pub locks: Vec<Option<LockState>>,
    pub conds: Vec<Option<CondState>>,
    pub ports: Vec<Option<PortState>>,

    // User-process machinery.
    pub memory_map: Bitmap,
    pub fd_table: FdTable,
    pub proc_table: ProcTable,
    pub programs: ProgramTable,
    pub synch_console: SynchConsole,

    pub rng: StdRng,
}

impl KernelState {
    /// The `Tid` naming the running thread.
    pub fn current_tid(&self) -> Tid {
        Tid::for_index_and_gen(self.current, self.generations[self.current])
    }

    /// The running thread's control block.
    pub fn current_tcb(&self) -> &Tcb {
        self.threads[self.current]
            .as_ref()
            .expect("current thread has no TCB")
    }

    pub fn current_tcb_mut(&mut self) -> &mut Tcb {
        self.threads[self.current]
            .as_mut()
            .expect("current thread has no TCB")
    }
}

pub(crate) type Guard<'a> = MutexGuard<'a, KernelState>;

/// Handle to a running kernel. Every API in this crate hangs off one of
/// these; it is `Send + Sync` and forked thread bodies receive a reference.
pub struct Kernel {
    state: Mutex<KernelState>,
    me: OnceLock<Weak<Kernel>>,
}

impl Kernel {
    /// Powers on the machine and boots the kernel, adopting the calling OS
    /// thread as the `main` kernel thread (running, priority 0).
    pub fn start(options: Options) -> Arc<Kernel> {
        // Finished threads tear down their OS stacks by unwinding a
        // `ThreadExit`; that unwind is routine and must not be reported as
        // a panic.
        static PANIC_HOOK: std::sync::Once = std::sync::Once::new();
        PANIC_HOOK.call_once(|| {
            let default = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                if info
                    .payload()
                    .downcast_ref::<crate::thread::ThreadExit>()
                    .is_none()
                {
                    default(info);
                }
            }));
        });

        let config = MachineConfig {
            phys_pages: options.phys_pages,
            tlb: options.tlb,
        };
        let cpu = Cpu::new(&config);
        let mut timeline = Timeline::new();
        let mut timer = options
            .random_slice
            .then(|| Timer::new(true, options.rng_seed));
        if let Some(t) = &mut timer {
            t.arm(&mut timeline);
        }

        let mut sems = Vec::new();
        let mut locks = Vec::new();
        let synch_console = SynchConsole::bootstrap(&mut sems, &mut locks);

        let mut state = KernelState {
            cpu,
            timeline,
            console_dev: Console::new(),
            timer,
            stats: Statistics::default(),
            fs: options
                .file_system
                .unwrap_or_else(|| Box::new(StubFileSystem::new())),
            threads: Vec::new(),
            generations: Vec::new(),
            current: 0,
            to_destroy: None,
            sched: Scheduler::new(),
            sems,
            locks,
            conds: Vec::new(),
            ports: Vec::new(),
            memory_map: Bitmap::new(options.phys_pages),
            fd_table: FdTable::new(),
            proc_table: ProcTable::new(),
            programs: ProgramTable::new(),
            synch_console,
            rng: StdRng::seed_from_u64(options.rng_seed),
        };

        // We didn't explicitly create the thread we are running in, but if
        // it ever gives up the processor we need a TCB to park it on.
        let main = Tcb::new("main", false, abi::Priority::MIN);
        state.threads.push(Some(main));
        state.generations.push(Generation::ZERO);
        state.current = 0;
        state.threads[0].as_mut().unwrap().set_running();

        state.timeline.set_level(IntLevel::On);

        let kernel = Arc::new(Kernel {
            state: Mutex::new(state),
            me: OnceLock::new(),
        });
        kernel.me.set(Arc::downgrade(&kernel)).ok().unwrap();
        log::debug!("kernel booted");
        kernel
    }

    pub(crate) fn state(&self) -> Guard<'_> {
        self.state.lock().expect("kernel state poisoned")
    }

    /// A strong handle to ourselves, for spawning thread bodies.
    pub(crate) fn arc(&self) -> Arc<Kernel> {
        self.me
            .get()
            .and_then(Weak::upgrade)
            .expect("kernel used before start completed")
    }

    /// Current performance counters.
    pub fn statistics(&self) -> Statistics {
        let g = self.state();
        let mut stats = g.stats;
        stats.total_ticks = g.timeline.now();
        stats
    }

    /// Supplies bytes to the console input device.
    pub fn console_feed(&self, bytes: &[u8]) {
        let mut g = self.state();
        let KernelState {
            console_dev,
            timeline,
            ..
        } = &mut *g;
        console_dev.feed(timeline, bytes);
    }

    /// Drains and returns everything written to the console so far.
    pub fn console_take_output(&self) -> Vec<u8> {
        self.state().console_dev.take_output()
    }

    /// Number of unallocated physical frames.
    pub fn free_frames(&self) -> usize {
        self.state().memory_map.count_clear()
    }

    /// Runs `f` against the mounted file system. Embedders use this to stage
    /// fixtures and inspect results; the kernel itself goes through the
    /// syscall layer.
    pub fn with_file_system<R>(&self, f: impl FnOnce(&mut dyn FileSystem) -> R) -> R {
        f(self.state().fs.as_mut())
    }

    /// Shuts the machine down: prints statistics and exits the process.
    /// Invoked by the `Halt` syscall.
    pub fn halt(&self) -> ! {
        let stats = self.statistics();
        println!("Machine halting!\n\n{stats}");
        std::process::exit(0);
    }
}
