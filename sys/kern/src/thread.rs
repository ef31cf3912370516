// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks and the thread lifecycle.
//!
//! Four operations do the real work: `fork` arranges for a new thread to run
//! a body concurrently with its creator, `yield_now` hands the processor to
//! another ready thread, `sleep` blocks until somebody wakes us, and
//! `finish` ends the calling thread.
//!
//! Every kernel thread is backed by an OS thread parked on its TCB's baton
//! condvar. Exactly one holds the baton at a time (`KernelState::current`),
//! which preserves the uniprocessor premise: the "context switch" is a
//! notify of the successor followed by a wait for our own turn. A finished
//! thread cannot reap its own TCB while the kernel still considers it
//! current, so it parks a note in `to_destroy` and the next dispatched
//! thread reaps it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar};

use abi::{regs, Generation, Priority, Tid};
use machine::interrupt::IntLevel;

use crate::addrspace::{self, AddrSpace};
use crate::interrupt;
use crate::sched;
use crate::synch::{self, CondId, LockId, SemId};
use crate::{Guard, Kernel, KernelState};

/// Sentinel guarding every TCB against stray writes; checked at each
/// dispatch.
pub(crate) const STACK_FENCEPOST: u32 = 0xDEAD_BEEF;

/// Unwind payload that tears down a finished thread's OS stack. Filtered
/// out of panic reporting by the bootstrap hook.
pub(crate) struct ThreadExit;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ThreadStatus {
    JustCreated,
    Running,
    Ready,
    Blocked,
}

/// The synchronization trio backing `join`: the semaphore is the
/// finisher/joiner rendezvous, the condition carries the completion notice.
#[derive(Copy, Clone, Debug)]
pub(crate) struct JoinSync {
    pub lock: LockId,
    pub cond: CondId,
    pub sem: SemId,
}

/// A thread control block.
pub(crate) struct Tcb {
    pub name: String,
    pub status: ThreadStatus,
    pub priority: Priority,
    pub initial_priority: Priority,
    pub joinable: bool,
    pub join: Option<JoinSync>,
    pub space: Option<AddrSpace>,
    pub user_regs: [i32; regs::NUM_TOTAL_REGS],
    pub baton: Arc<Condvar>,
    fencepost: u32,
}

impl Tcb {
    pub fn new(name: &str, joinable: bool, priority: Priority) -> Self {
        Self {
            name: name.to_string(),
            status: ThreadStatus::JustCreated,
            priority,
            initial_priority: priority,
            joinable,
            join: None,
            space: None,
            user_regs: [0; regs::NUM_TOTAL_REGS],
            baton: Arc::new(Condvar::new()),
            fencepost: STACK_FENCEPOST,
        }
    }

    pub fn set_running(&mut self) {
        self.status = ThreadStatus::Running;
    }

    pub fn check_fencepost(&self) {
        assert_eq!(
            self.fencepost, STACK_FENCEPOST,
            "TCB of thread \"{}\" is corrupted",
            self.name
        );
    }
}

/// Resolves a `Tid` to its table slot, refusing stale generations.
pub(crate) fn resolve(state: &KernelState, tid: Tid) -> Option<usize> {
    let i = tid.index();
    if i < state.threads.len()
        && state.threads[i].is_some()
        && state.generations[i] == tid.generation()
    {
        Some(i)
    } else {
        None
    }
}

/// Allocates a TCB slot. Joinable threads get their join primitives here,
/// before anyone can possibly race to use them.
pub(crate) fn create_locked(
    state: &mut KernelState,
    name: &str,
    joinable: bool,
    priority: Priority,
) -> usize {
    let mut tcb = Tcb::new(name, joinable, priority);
    if joinable {
        let lock = synch::lock_create_locked(state, format!("{name}.Lock"));
        let cond = synch::cond_create_locked(state, format!("{name}.Cond"), lock);
        let sem = synch::sem_create_locked(state, format!("{name}.Sem"), 0);
        tcb.join = Some(JoinSync { lock, cond, sem });
    }
    match state.threads.iter().position(Option::is_none) {
        Some(i) => {
            state.threads[i] = Some(tcb);
            i
        }
        None => {
            state.threads.push(Some(tcb));
            state.generations.push(Generation::ZERO);
            state.threads.len() - 1
        }
    }
}

/// Backs the TCB in `slot` with an OS thread running `body` and puts it on
/// the ready list. The first dispatch runs the trampoline: enable
/// interrupts, run `body`, finish.
pub(crate) fn fork_locked<'k>(
    kernel: &'k Kernel,
    g: Guard<'k>,
    slot: usize,
    body: Box<dyn FnOnce(&Kernel) + Send>,
) -> Guard<'k> {
    let tcb = g.threads[slot].as_ref().expect("forking a dead thread");
    assert_eq!(
        tcb.status,
        ThreadStatus::JustCreated,
        "thread \"{}\" forked twice",
        tcb.name
    );
    log::debug!("forking thread \"{}\"", tcb.name);

    let arc = kernel.arc();
    std::thread::Builder::new()
        .name(tcb.name.clone())
        .spawn(move || entry(arc, slot, body))
        .expect("could not back a kernel thread with an OS thread");

    // ready_to_run assumes that interrupts are disabled.
    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    sched::ready_to_run(&mut g, slot);
    interrupt::set_level(g, old).0
}

fn entry(kernel: Arc<Kernel>, me: usize, body: Box<dyn FnOnce(&Kernel) + Send>) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // Park until the scheduler hands us the baton for the first time.
        let mut g = kernel.state();
        let baton = g.threads[me].as_ref().unwrap().baton.clone();
        while g.current != me {
            g = baton.wait(g).expect("kernel state poisoned");
        }
        sched::post_switch(&mut g);

        let g = interrupt::set_level(g, IntLevel::On).0;
        drop(g);
        body(&kernel);
        finish(&kernel)
    }));
    match result {
        Err(payload) if payload.is::<ThreadExit>() => (),
        Err(_) => {
            // A kernel thread died of a real panic (already reported by the
            // hook). The machine state is beyond recovery; going down loudly
            // beats letting joiners hang forever.
            std::process::abort();
        }
        Ok(()) => unreachable!("finish returned"),
    }
}

/// Relinquishes the processor to the next ready thread, if any, requeueing
/// the caller behind its priority peers. Returns immediately when nothing
/// else is runnable.
pub(crate) fn yield_locked(g: Guard<'_>) -> Guard<'_> {
    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    log::debug!("yielding thread \"{}\"", g.current_tcb().name);
    if let Some(next) = sched::find_next_to_run(&mut g) {
        let cur = g.current;
        sched::ready_to_run(&mut g, cur);
        g = sched::run(g, next);
    }
    interrupt::set_level(g, old).0
}

/// Blocks the calling thread until something puts it back on the ready
/// list. If nothing is runnable, idles the machine until an interrupt makes
/// something ready.
///
/// Interrupts must already be off: the synchronization routines call this
/// mid-critical-section, and there must be no window between queueing
/// ourselves on a wait list and switching away.
pub(crate) fn sleep(mut g: Guard<'_>) -> Guard<'_> {
    assert_eq!(
        g.timeline.level(),
        IntLevel::Off,
        "sleep with interrupts enabled"
    );
    log::debug!("sleeping thread \"{}\"", g.current_tcb().name);
    g.current_tcb_mut().status = ThreadStatus::Blocked;
    loop {
        if let Some(next) = sched::find_next_to_run(&mut g) {
            return sched::run(g, next);
        }
        g = interrupt::idle(g);
    }
}

/// Ends the calling thread. If it is joinable, blocks until a joiner has
/// arrived, then broadcasts completion. Never returns; the TCB is reaped by
/// the next thread to run.
pub(crate) fn finish(kernel: &Kernel) -> ! {
    let g = kernel.state();
    let (mut g, _) = interrupt::set_level(g, IntLevel::Off);
    log::debug!("finishing thread \"{}\"", g.current_tcb().name);

    let join = g.current_tcb().join;
    if let Some(j) = join {
        // The semaphore is the rendezvous: until some thread joins us, we
        // are not allowed to disappear.
        g = synch::sem_p(g, j.sem);
        g = synch::lock_acquire(g, j.lock);
        g = synch::cond_broadcast(g, j.cond);
        g = synch::lock_release(g, j.lock);
    }
    log::debug!("thread \"{}\" finished", g.current_tcb().name);

    let cur = g.current;
    g.to_destroy = Some(cur);
    g.current_tcb_mut().status = ThreadStatus::Blocked;
    loop {
        if let Some(next) = sched::find_next_to_run(&mut g) {
            sched::run_and_exit(g, next);
        }
        g = interrupt::idle(g);
    }
}

/// Blocks until the thread named by `tid` finishes. The protocol tolerates
/// join-before-finish and join-after-finish equally: the semaphore carries
/// "a joiner exists", the condition carries "the target is done".
pub(crate) fn join(mut g: Guard<'_>, tid: Tid) -> Guard<'_> {
    let slot = resolve(&g, tid).expect("join target does not exist");
    let tcb = g.threads[slot].as_ref().unwrap();
    assert!(tcb.joinable, "thread \"{}\" is not joinable", tcb.name);
    let j = tcb.join.expect("joinable thread without join primitives");
    log::debug!("waiting for end of thread \"{}\"", tcb.name);

    g = synch::lock_acquire(g, j.lock);
    g = synch::sem_v(g, j.sem);
    g = synch::cond_wait(g, j.cond);
    g = synch::lock_release(g, j.lock);

    // The joiner frees the join primitives; the target must not, since it
    // is destroyed before the joiner necessarily gets another look.
    synch::cond_destroy_locked(&mut g, j.cond);
    synch::sem_destroy_locked(&mut g, j.sem);
    synch::lock_destroy_locked(&mut g, j.lock);
    g
}

/// Reaps a TCB whose thread has finished.
pub(crate) fn destroy(state: &mut KernelState, slot: usize) {
    assert_ne!(slot, state.current, "a thread cannot destroy itself");
    let tcb = state.threads[slot]
        .take()
        .expect("destroying an empty thread slot");
    log::debug!("deleting thread \"{}\"", tcb.name);
    if let Some(space) = tcb.space {
        addrspace::release(state, space);
    }
    state.generations[slot] = state.generations[slot].next();
}

impl Kernel {
    /// Allocates a thread, ready to be [`Kernel::fork`]ed. Joinable threads
    /// support exactly one [`Kernel::join`].
    pub fn create_thread(&self, name: &str, joinable: bool, priority: i32) -> Tid {
        let mut g = self.state();
        let slot = create_locked(&mut g, name, joinable, Priority::clamped(priority));
        Tid::for_index_and_gen(slot, g.generations[slot])
    }

    /// Starts `tid` running `body` concurrently with the caller.
    pub fn fork(&self, tid: Tid, body: impl FnOnce(&Kernel) + Send + 'static) {
        let g = self.state();
        let slot = resolve(&g, tid).expect("forking a thread that does not exist");
        drop(fork_locked(self, g, slot, Box::new(body)));
    }

    /// `create_thread` + `fork` in one step, for the common non-joinable
    /// case.
    pub fn spawn(
        &self,
        name: &str,
        priority: i32,
        body: impl FnOnce(&Kernel) + Send + 'static,
    ) -> Tid {
        let tid = self.create_thread(name, false, priority);
        self.fork(tid, body);
        tid
    }

    /// Relinquishes the processor if another thread is ready.
    pub fn yield_now(&self) {
        drop(yield_locked(self.state()));
    }

    /// Blocks until `tid` finishes. The target must have been created
    /// joinable.
    pub fn join(&self, tid: Tid) {
        drop(join(self.state(), tid));
    }

    /// Ends the calling thread early. Forked bodies that simply return get
    /// this called for them.
    pub fn finish(&self) -> ! {
        finish(self)
    }

    pub fn current_thread(&self) -> Tid {
        self.state().current_tid()
    }

    pub fn thread_name(&self, tid: Tid) -> Option<String> {
        let g = self.state();
        resolve(&g, tid).map(|i| g.threads[i].as_ref().unwrap().name.clone())
    }

    pub fn thread_priority(&self, tid: Tid) -> Option<Priority> {
        let g = self.state();
        resolve(&g, tid).map(|i| g.threads[i].as_ref().unwrap().priority)
    }

    /// Sets `tid`'s priority, clamped into range; returns the value
    /// actually stored. The thread's *initial* priority is unaffected.
    pub fn set_thread_priority(&self, tid: Tid, priority: i32) -> Option<Priority> {
        let mut g = self.state();
        let slot = resolve(&g, tid)?;
        let pri = Priority::clamped(priority);
        g.threads[slot].as_mut().unwrap().priority = pri;
        Some(pri)
    }
}
