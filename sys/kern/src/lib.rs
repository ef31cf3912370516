// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Skiff kernel.
//!
//! This is the portion of the system that multiplexes the simulated
//! processor in the `machine` crate among cooperating kernel threads and
//! user processes: scheduler, synchronization primitives, thread lifecycle,
//! address spaces, and the system call layer.
//!
//! # Design principles
//!
//! 1. The machine is a uniprocessor, and masking interrupts yields
//!    atomicity. Every kernel data structure is guarded by that premise; the
//!    implementation backs it with a single state mutex, so holding the
//!    state guard *is* running with the processor to yourself.
//! 2. Cross-references are table indices, never owning pointers. Threads
//!    live in a slab and everything else (lock owners, wait queues, the
//!    process table) names them by index, so nothing owns anything it
//!    merely refers to.
//! 3. A strong preference for making misuse a panic and making user-program
//!    failure a `-1`. The first tier is a kernel bug; the second is Tuesday.
//!
//! Each kernel thread is backed by a parked OS thread; a context switch
//! hands a baton from one to the next under the state mutex, so exactly one
//! ever runs. Cooperative scheduling does the rest.

pub mod addrspace;
pub mod console;
pub mod err;
pub mod fdtable;
pub mod interrupt;
pub mod port;
pub mod proctable;
pub mod sched;
pub mod startup;
pub mod synch;
pub mod syscalls;
pub mod thread;
pub mod tlb;
pub mod umem;
pub mod userprog;
pub mod util;

pub use err::ExecError;
pub use port::PortId;
pub use startup::{Kernel, Options};
pub use synch::{CondId, LockId, SemId};
pub use userprog::{UserCx, UserProgram};

pub(crate) use startup::{Guard, KernelState};
