// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives: semaphores, locks, condition variables.
//!
//! All three bottom out in interrupt masking. Because these routines are
//! frequently entered with interrupts already disabled (`V` from an
//! interrupt handler, for one), they always restore the interrupt level
//! they found rather than unconditionally enabling.
//!
//! Objects live in slabs inside the kernel state and are named by index
//! handles. A lock refers to its owner thread by table index, never by an
//! owning reference; that is what lets the donation path reach into the
//! scheduler without anybody owning anybody.

use std::collections::VecDeque;

use machine::interrupt::IntLevel;

use crate::interrupt;
use crate::sched;
use crate::thread;
use crate::util::insert_slot;
use crate::{Guard, Kernel, KernelState};

/// Names a semaphore in the kernel's slab.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SemId(pub(crate) usize);

/// Names a lock in the kernel's slab.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockId(pub(crate) usize);

/// Names a condition variable in the kernel's slab.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CondId(pub(crate) usize);

/// A counting semaphore: a non-negative value plus a FIFO of blocked
/// threads. The value is zero whenever the queue is non-empty.
pub(crate) struct SemState {
    pub name: String,
    pub value: usize,
    pub queue: VecDeque<usize>,
}

/// A mutual-exclusion lock: an owner (by thread index) over a binary
/// semaphore. The semaphore's value is 0 iff somebody owns the lock.
pub(crate) struct LockState {
    pub name: String,
    pub owner: Option<usize>,
    pub sem: SemId,
}

/// A Mesa-style condition variable bound to one lock. Each waiter parks on
/// a fresh binary semaphore so signals wake exactly one thread, in FIFO
/// order.
pub(crate) struct CondState {
    pub name: String,
    pub lock: LockId,
    pub waiters: VecDeque<SemId>,
}

// --- Semaphores ---

pub(crate) fn sem_create_locked(state: &mut KernelState, name: String, value: usize) -> SemId {
    log::trace!("semaphore \"{name}\" created");
    SemId(insert_slot(
        &mut state.sems,
        SemState {
            name,
            value,
            queue: VecDeque::new(),
        },
    ))
}

pub(crate) fn sem_destroy_locked(state: &mut KernelState, id: SemId) {
    let sem = state.sems[id.0].take().expect("destroying a dead semaphore");
    assert!(
        sem.queue.is_empty(),
        "semaphore \"{}\" destroyed with waiters",
        sem.name
    );
    log::trace!("semaphore \"{}\" destroyed", sem.name);
}

/// Waits until the semaphore's value is positive, then consumes one unit.
/// Checking and decrementing must be indivisible, so the whole operation
/// runs with interrupts off; `sleep` requires that anyway.
pub(crate) fn sem_p(g: Guard<'_>, id: SemId) -> Guard<'_> {
    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    loop {
        let cur = g.current;
        let sem = g.sems[id.0].as_mut().expect("P on a dead semaphore");
        if sem.value > 0 {
            break;
        }
        log::trace!(
            "thread \"{}\" blocked on semaphore \"{}\"",
            g.current_tcb().name,
            g.sems[id.0].as_ref().unwrap().name
        );
        g.sems[id.0].as_mut().unwrap().queue.push_back(cur);
        g = thread::sleep(g);
    }
    let sem = g.sems[id.0].as_mut().unwrap();
    sem.value -= 1;
    log::trace!(
        "thread \"{}\" consumed semaphore \"{}\"",
        g.current_tcb().name,
        g.sems[id.0].as_ref().unwrap().name
    );
    interrupt::set_level(g, old).0
}

/// Adds one unit and readies the longest-waiting thread, if any. The woken
/// thread re-evaluates the value itself once dispatched.
pub(crate) fn sem_v(g: Guard<'_>, id: SemId) -> Guard<'_> {
    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    let sem = g.sems[id.0].as_mut().expect("V on a dead semaphore");
    let woken = sem.queue.pop_front();
    if let Some(t) = woken {
        sched::ready_to_run(&mut g, t);
        log::trace!(
            "thread \"{}\" awakened from semaphore \"{}\"",
            g.threads[t].as_ref().unwrap().name,
            g.sems[id.0].as_ref().unwrap().name
        );
    }
    g.sems[id.0].as_mut().unwrap().value += 1;
    interrupt::set_level(g, old).0
}

// --- Locks ---

pub(crate) fn lock_create_locked(state: &mut KernelState, name: String) -> LockId {
    let sem = sem_create_locked(state, format!("{name}.sem"), 1);
    log::trace!("lock \"{name}\" created");
    LockId(insert_slot(
        &mut state.locks,
        LockState {
            name,
            owner: None,
            sem,
        },
    ))
}

pub(crate) fn lock_destroy_locked(state: &mut KernelState, id: LockId) {
    let lock = state.locks[id.0].take().expect("destroying a dead lock");
    assert!(
        lock.owner.is_none(),
        "lock \"{}\" destroyed while held",
        lock.name
    );
    sem_destroy_locked(state, lock.sem);
    log::trace!("lock \"{}\" destroyed", lock.name);
}

pub(crate) fn lock_held_by_current(state: &KernelState, id: LockId) -> bool {
    let lock = state.locks[id.0].as_ref().expect("query on a dead lock");
    lock.owner == Some(state.current)
}

/// Acquires the lock, blocking while somebody else holds it.
///
/// Before blocking, resolves priority inversion by donation: if the holder
/// is less important than the caller, it inherits the caller's priority,
/// and if it was sitting on a ready queue it is re-queued at the donated
/// priority. The other threads of its old queue keep their relative order.
pub(crate) fn lock_acquire(g: Guard<'_>, id: LockId) -> Guard<'_> {
    let mut g = g;
    assert!(
        !lock_held_by_current(&g, id),
        "acquire of lock \"{}\" already held by caller",
        g.locks[id.0].as_ref().unwrap().name
    );

    let cur = g.current;
    let lock = g.locks[id.0].as_ref().unwrap();
    let sem = lock.sem;
    if let Some(owner) = lock.owner {
        let owner_pri = g.threads[owner].as_ref().unwrap().priority;
        let my_pri = g.threads[cur].as_ref().unwrap().priority;
        if my_pri.is_more_important_than(owner_pri) {
            log::debug!(
                "donating priority {} to thread \"{}\" holding lock \"{}\"",
                my_pri.index(),
                g.threads[owner].as_ref().unwrap().name,
                g.locks[id.0].as_ref().unwrap().name
            );
            g.threads[owner].as_mut().unwrap().priority = my_pri;
            if g.threads[owner].as_ref().unwrap().status == thread::ThreadStatus::Ready {
                // Cycle the old queue once, re-appending everyone else in
                // order; the owner alone lands on its new queue.
                let n = g.sched.queue_len(owner_pri);
                for _ in 0..n {
                    let t = sched::remove_from_list(&mut g, owner_pri)
                        .expect("ready thread vanished from its queue");
                    sched::ready_to_run(&mut g, t);
                }
            }
        }
    }

    let (mut g2, old) = interrupt::set_level(g, IntLevel::Off);
    log::trace!(
        "thread \"{}\" checking lock \"{}\"",
        g2.current_tcb().name,
        g2.locks[id.0].as_ref().unwrap().name
    );
    g2 = sem_p(g2, sem);
    let cur = g2.current;
    g2.locks[id.0].as_mut().unwrap().owner = Some(cur);
    log::trace!(
        "thread \"{}\" acquired lock \"{}\"",
        g2.current_tcb().name,
        g2.locks[id.0].as_ref().unwrap().name
    );
    interrupt::set_level(g2, old).0
}

/// Releases the lock and wakes one waiter. Also the end of any donation the
/// *releasing* thread enjoys: its priority drops back to its initial one.
pub(crate) fn lock_release(g: Guard<'_>, id: LockId) -> Guard<'_> {
    assert!(
        lock_held_by_current(&g, id),
        "release of lock \"{}\" not held by caller",
        g.locks[id.0].as_ref().unwrap().name
    );

    let mut g = g;
    g.locks[id.0].as_mut().unwrap().owner = None;
    let sem = g.locks[id.0].as_ref().unwrap().sem;

    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    log::trace!(
        "thread \"{}\" released lock \"{}\"",
        g.current_tcb().name,
        g.locks[id.0].as_ref().unwrap().name
    );
    g = sem_v(g, sem);
    let (mut g, _) = interrupt::set_level(g, old);

    let cur = g.current;
    let tcb = g.threads[cur].as_mut().unwrap();
    tcb.priority = tcb.initial_priority;
    g
}

// --- Condition variables ---

pub(crate) fn cond_create_locked(state: &mut KernelState, name: String, lock: LockId) -> CondId {
    log::trace!("condition \"{name}\" created");
    CondId(insert_slot(
        &mut state.conds,
        CondState {
            name,
            lock,
            waiters: VecDeque::new(),
        },
    ))
}

pub(crate) fn cond_destroy_locked(state: &mut KernelState, id: CondId) {
    let cond = state.conds[id.0].take().expect("destroying a dead condition");
    assert!(
        cond.waiters.is_empty(),
        "condition \"{}\" destroyed with waiters",
        cond.name
    );
    log::trace!("condition \"{}\" destroyed", cond.name);
}

/// Atomically releases the bound lock and waits for a signal; re-acquires
/// the lock before returning. The caller must hold the lock. Mesa rules: a
/// signaled waiter re-contends for the lock, so the awaited predicate must
/// be re-checked by the caller.
pub(crate) fn cond_wait(g: Guard<'_>, id: CondId) -> Guard<'_> {
    let mut g = g;
    let cond = g.conds[id.0].as_ref().expect("wait on a dead condition");
    let lock = cond.lock;
    assert!(
        lock_held_by_current(&g, lock),
        "wait on condition \"{}\" without holding its lock",
        g.conds[id.0].as_ref().unwrap().name
    );

    let sem_name = format!(
        "{}.sem.{}",
        g.conds[id.0].as_ref().unwrap().name,
        g.current_tcb().name
    );
    let sem = sem_create_locked(&mut g, sem_name, 0);
    g.conds[id.0].as_mut().unwrap().waiters.push_back(sem);

    // Release and sleep inside one masked region, or a signal could slip
    // between them and be lost.
    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    log::trace!(
        "thread \"{}\" waiting on condition \"{}\"",
        g.current_tcb().name,
        g.conds[id.0].as_ref().unwrap().name
    );
    g = lock_release(g, lock);
    g = sem_p(g, sem);
    let (mut g, _) = interrupt::set_level(g, old);

    g = lock_acquire(g, lock);
    sem_destroy_locked(&mut g, sem);
    g
}

/// Wakes the longest-waiting thread, if any. The caller must hold the bound
/// lock; the caller keeps running (the woken thread merely becomes ready).
pub(crate) fn cond_signal(g: Guard<'_>, id: CondId) -> Guard<'_> {
    let mut g = g;
    let cond = g.conds[id.0].as_ref().expect("signal on a dead condition");
    assert!(
        lock_held_by_current(&g, cond.lock),
        "signal on condition \"{}\" without holding its lock",
        cond.name
    );

    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    log::trace!(
        "thread \"{}\" signaled condition \"{}\"",
        g.current_tcb().name,
        g.conds[id.0].as_ref().unwrap().name
    );
    if let Some(sem) = g.conds[id.0].as_mut().unwrap().waiters.pop_front() {
        g = sem_v(g, sem);
    }
    interrupt::set_level(g, old).0
}

/// `cond_signal` applied until nobody is waiting.
pub(crate) fn cond_broadcast(g: Guard<'_>, id: CondId) -> Guard<'_> {
    let mut g = g;
    let cond = g.conds[id.0].as_ref().expect("broadcast on a dead condition");
    assert!(
        lock_held_by_current(&g, cond.lock),
        "broadcast on condition \"{}\" without holding its lock",
        cond.name
    );

    let (mut g, old) = interrupt::set_level(g, IntLevel::Off);
    log::trace!(
        "thread \"{}\" broadcast condition \"{}\"",
        g.current_tcb().name,
        g.conds[id.0].as_ref().unwrap().name
    );
    while let Some(sem) = g.conds[id.0].as_mut().unwrap().waiters.pop_front() {
        g = sem_v(g, sem);
    }
    interrupt::set_level(g, old).0
}

impl Kernel {
    /// Creates a counting semaphore with the given initial value.
    pub fn new_semaphore(&self, name: &str, value: usize) -> SemId {
        sem_create_locked(&mut self.state(), name.to_string(), value)
    }

    /// Destroys a semaphore nobody is waiting on.
    pub fn destroy_semaphore(&self, id: SemId) {
        sem_destroy_locked(&mut self.state(), id);
    }

    /// Waits for a unit of the semaphore.
    pub fn p(&self, id: SemId) {
        drop(sem_p(self.state(), id));
    }

    /// Releases a unit of the semaphore, waking a waiter if there is one.
    pub fn v(&self, id: SemId) {
        drop(sem_v(self.state(), id));
    }

    /// The semaphore's current value, for assertions and diagnostics.
    pub fn semaphore_value(&self, id: SemId) -> usize {
        self.state().sems[id.0]
            .as_ref()
            .expect("query on a dead semaphore")
            .value
    }

    /// Creates a lock.
    pub fn new_lock(&self, name: &str) -> LockId {
        lock_create_locked(&mut self.state(), name.to_string())
    }

    /// Destroys an unheld lock.
    pub fn destroy_lock(&self, id: LockId) {
        lock_destroy_locked(&mut self.state(), id);
    }

    pub fn acquire(&self, id: LockId) {
        drop(lock_acquire(self.state(), id));
    }

    pub fn release(&self, id: LockId) {
        drop(lock_release(self.state(), id));
    }

    pub fn held_by_current_thread(&self, id: LockId) -> bool {
        lock_held_by_current(&self.state(), id)
    }

    /// Creates a condition variable bound to `lock`.
    pub fn new_condition(&self, name: &str, lock: LockId) -> CondId {
        cond_create_locked(&mut self.state(), name.to_string(), lock)
    }

    /// Destroys a condition variable nobody is waiting on.
    pub fn destroy_condition(&self, id: CondId) {
        cond_destroy_locked(&mut self.state(), id);
    }

    pub fn wait(&self, id: CondId) {
        drop(cond_wait(self.state(), id));
    }

    pub fn signal(&self, id: CondId) {
        drop(cond_signal(self.state(), id));
    }

    pub fn broadcast(&self, id: CondId) {
        drop(cond_broadcast(self.state(), id));
    }
}

#[cfg(test)]
mod tests {
    use crate::{Kernel, Options};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_owner_iff_semaphore_drained() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");

        {
            let g = kernel.state();
            let l = g.locks[lock.0].as_ref().unwrap();
            assert!(l.owner.is_none());
            assert_eq!(g.sems[l.sem.0].as_ref().unwrap().value, 1);
        }
        kernel.acquire(lock);
        assert!(kernel.held_by_current_thread(lock));
        {
            let g = kernel.state();
            let l = g.locks[lock.0].as_ref().unwrap();
            assert_eq!(l.owner, Some(g.current));
            assert_eq!(g.sems[l.sem.0].as_ref().unwrap().value, 0);
        }
        kernel.release(lock);
        assert!(!kernel.held_by_current_thread(lock));
        {
            let g = kernel.state();
            let l = g.locks[lock.0].as_ref().unwrap();
            assert!(l.owner.is_none());
            assert_eq!(g.sems[l.sem.0].as_ref().unwrap().value, 1);
        }
    }

    #[test]
    fn semaphore_value_is_zero_while_queue_is_nonempty() {
        let kernel = Kernel::start(Options::default());
        let sem = kernel.new_semaphore("s", 0);
        let passed = Arc::new(AtomicUsize::new(0));

        let passed2 = passed.clone();
        kernel.spawn("waiter", 0, move |k| {
            k.p(sem);
            passed2.fetch_add(1, Ordering::SeqCst);
        });
        kernel.yield_now();

        {
            let g = kernel.state();
            let s = g.sems[sem.0].as_ref().unwrap();
            assert_eq!(s.value, 0);
            assert_eq!(s.queue.len(), 1);
        }
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        kernel.v(sem);
        {
            // The V pulled the waiter off the queue before bumping the
            // value; the waiter consumes it when dispatched.
            let g = kernel.state();
            let s = g.sems[sem.0].as_ref().unwrap();
            assert_eq!(s.value, 1);
            assert!(s.queue.is_empty());
        }
        kernel.yield_now();
        assert_eq!(passed.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.semaphore_value(sem), 0);
    }

    #[test]
    fn v_accumulates_without_waiters() {
        let kernel = Kernel::start(Options::default());
        let sem = kernel.new_semaphore("s", 0);
        kernel.v(sem);
        kernel.v(sem);
        assert_eq!(kernel.semaphore_value(sem), 2);
        kernel.p(sem);
        kernel.p(sem);
        assert_eq!(kernel.semaphore_value(sem), 0);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn reacquire_by_owner_is_fatal() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");
        kernel.acquire(lock);
        kernel.acquire(lock);
    }

    #[test]
    #[should_panic(expected = "not held by caller")]
    fn release_without_holding_is_fatal() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");
        kernel.release(lock);
    }

    #[test]
    #[should_panic(expected = "without holding its lock")]
    fn wait_without_lock_is_fatal() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");
        let cond = kernel.new_condition("c", lock);
        kernel.wait(cond);
    }

    #[test]
    #[should_panic(expected = "without holding its lock")]
    fn signal_without_lock_is_fatal() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");
        let cond = kernel.new_condition("c", lock);
        kernel.signal(cond);
    }

    #[test]
    fn signal_with_nobody_waiting_is_lost() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");
        let cond = kernel.new_condition("c", lock);
        kernel.acquire(lock);
        kernel.signal(cond);
        kernel.release(lock);
        let g = kernel.state();
        assert!(g.conds[cond.0].as_ref().unwrap().waiters.is_empty());
    }

    #[test]
    fn donation_restores_initial_priority_at_release() {
        let kernel = Kernel::start(Options::default());
        let lock = kernel.new_lock("l");

        let holder = kernel.create_thread("holder", true, 1);
        let holder_tid = holder;
        kernel.fork(holder, move |k| {
            k.acquire(lock);
            k.yield_now(); // let the high-priority contender donate
            assert_eq!(
                k.thread_priority(holder_tid),
                Some(abi::Priority::from(4))
            );
            k.release(lock);
            assert_eq!(
                k.thread_priority(holder_tid),
                Some(abi::Priority::from(1))
            );
        });
        kernel.yield_now(); // holder acquires, then yields back

        let contender = kernel.create_thread("contender", true, 4);
        kernel.fork(contender, move |k| {
            k.acquire(lock);
            k.release(lock);
        });
        kernel.yield_now();

        kernel.join(holder);
        kernel.join(contender);
    }
}
