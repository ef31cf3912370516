// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ready queues and thread dispatch.
//!
//! These routines assume the caller already holds the state guard; on this
//! uniprocessor that is the mutual exclusion. They must not block through a
//! Lock: waiting for a contended lock would call back into
//! `find_next_to_run` and chase its own tail.

use abi::Priority;
use std::collections::VecDeque;

use crate::thread::{self, ThreadStatus};
use crate::{Guard, KernelState};

/// The ready set: one FIFO of thread-table indices per priority level.
pub(crate) struct Scheduler {
    queues: Vec<VecDeque<usize>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queues: (0..=abi::MAX_PRIORITY).map(|_| VecDeque::new()).collect(),
        }
    }

    pub fn queue_len(&self, pri: Priority) -> usize {
        self.queues[pri.index()].len()
    }

    /// Appends without touching thread state; donation uses this to keep
    /// already-Ready threads in place.
    pub fn append(&mut self, pri: Priority, t: usize) {
        self.queues[pri.index()].push_back(t);
    }
}

/// Marks thread `t` ready and appends it to the queue for its priority.
pub(crate) fn ready_to_run(state: &mut KernelState, t: usize) {
    let tcb = state.threads[t].as_mut().expect("readying a dead thread");
    let pri = tcb.priority;
    log::debug!("putting thread \"{}\" on ready list {}", tcb.name, pri.index());
    tcb.status = ThreadStatus::Ready;
    state.sched.append(pri, t);
}

/// Removes and returns the next thread to dispatch: the head of the highest
/// non-empty priority queue, or `None` if nothing is runnable.
pub(crate) fn find_next_to_run(state: &mut KernelState) -> Option<usize> {
    state
        .sched
        .queues
        .iter_mut()
        .rev()
        .find_map(|q| q.pop_front())
}

/// Pops the head of the queue for `pri`. Priority donation cycles a queue
/// through this to relocate a lock holder.
pub(crate) fn remove_from_list(state: &mut KernelState, pri: Priority) -> Option<usize> {
    state.sched.queues[pri.index()].pop_front()
}

/// Dispatches the processor to `next`: saves the outgoing thread's user
/// state, verifies its fencepost, hands over the baton, and parks the caller
/// until it is scheduled again. On resumption, performs the post-switch
/// duties (reaping a finished predecessor, restoring user state) and returns
/// the reacquired guard.
pub(crate) fn run(mut g: Guard<'_>, next: usize) -> Guard<'_> {
    let old = g.current;
    save_user_state(&mut g, old);
    g.threads[old].as_ref().unwrap().check_fencepost();

    g.current = next;
    let next_tcb = g.threads[next].as_mut().expect("dispatching a dead thread");
    next_tcb.set_running();
    let next_baton = next_tcb.baton.clone();
    let my_baton = g.threads[old].as_ref().unwrap().baton.clone();
    log::debug!(
        "switching from thread \"{}\" to thread \"{}\"",
        g.threads[old].as_ref().unwrap().name,
        g.threads[next].as_ref().unwrap().name
    );

    next_baton.notify_one();
    while g.current != old {
        g = my_baton.wait(g).expect("kernel state poisoned");
    }
    log::debug!("now in thread \"{}\"", g.threads[old].as_ref().unwrap().name);

    post_switch(&mut g);
    g
}

/// Dispatch variant for a finishing thread: hands over the baton and
/// unwinds the calling OS thread instead of parking it. The TCB itself is
/// reaped later by whoever runs next (we are still using it right now).
pub(crate) fn run_and_exit(mut g: Guard<'_>, next: usize) -> ! {
    let old = g.current;
    g.threads[old].as_ref().unwrap().check_fencepost();

    g.current = next;
    let next_tcb = g.threads[next].as_mut().expect("dispatching a dead thread");
    next_tcb.set_running();
    let next_baton = next_tcb.baton.clone();
    log::debug!(
        "switching from finished thread \"{}\" to thread \"{}\"",
        g.threads[old].as_ref().unwrap().name,
        g.threads[next].as_ref().unwrap().name
    );
    next_baton.notify_one();

    drop(g);
    std::panic::panic_any(thread::ThreadExit);
}

/// Work every thread performs right after being handed the processor.
pub(crate) fn post_switch(state: &mut KernelState) {
    // If the thread that gave up the processor was finishing, reap it now;
    // it could not free its own TCB while still running on it.
    if let Some(doomed) = state.to_destroy.take() {
        thread::destroy(state, doomed);
    }
    let cur = state.current;
    restore_user_state(state, cur);
}

fn save_user_state(state: &mut KernelState, t: usize) {
    let KernelState { threads, cpu, .. } = &mut *state;
    if let Some(tcb) = threads[t].as_mut() {
        if tcb.space.is_some() {
            for (i, r) in tcb.user_regs.iter_mut().enumerate() {
                *r = cpu.read_register(i);
            }
            tcb.space.as_mut().unwrap().save_state(cpu);
        }
    }
}

fn restore_user_state(state: &mut KernelState, t: usize) {
    let KernelState { threads, cpu, .. } = &mut *state;
    if let Some(tcb) = threads[t].as_mut() {
        if tcb.space.is_some() {
            for (i, r) in tcb.user_regs.iter().enumerate() {
                cpu.write_register(i, *r);
            }
            tcb.space.as_mut().unwrap().restore_state(cpu);
        }
    }
}
