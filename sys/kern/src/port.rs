// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ports: synchronous message rendezvous.
//!
//! A send completes only after a receive has matched it, and vice versa;
//! messages pair with calls in FIFO order. Built from one lock and a
//! condition variable per direction, plus counters of active senders and
//! receivers.

use std::collections::VecDeque;

use crate::synch::{self, CondId, LockId};
use crate::util::insert_slot;
use crate::{Guard, Kernel, KernelState};

/// Names a port in the kernel's slab.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortId(pub(crate) usize);

pub(crate) struct PortState {
    pub name: String,
    pub lock: LockId,
    pub send_cond: CondId,
    pub recv_cond: CondId,
    pub buffer: VecDeque<i32>,
    pub senders: usize,
    pub receivers: usize,
}

pub(crate) fn port_create_locked(state: &mut KernelState, name: String) -> PortId {
    let lock = synch::lock_create_locked(state, format!("{name}.lock"));
    let send_cond = synch::cond_create_locked(state, format!("{name}.sndCond"), lock);
    let recv_cond = synch::cond_create_locked(state, format!("{name}.rcvCond"), lock);
    log::trace!("port \"{name}\" created");
    PortId(insert_slot(
        &mut state.ports,
        PortState {
            name,
            lock,
            send_cond,
            recv_cond,
            buffer: VecDeque::new(),
            senders: 0,
            receivers: 0,
        },
    ))
}

pub(crate) fn port_destroy_locked(state: &mut KernelState, id: PortId) {
    let port = state.ports[id.0].take().expect("destroying a dead port");
    assert!(
        port.senders == 0 && port.receivers == 0,
        "port \"{}\" destroyed mid-rendezvous",
        port.name
    );
    synch::cond_destroy_locked(state, port.send_cond);
    synch::cond_destroy_locked(state, port.recv_cond);
    synch::lock_destroy_locked(state, port.lock);
    log::trace!("port \"{}\" destroyed", port.name);
}

/// Queues `msg` and blocks until a receiver takes it.
pub(crate) fn port_send(g: Guard<'_>, id: PortId, msg: i32) -> Guard<'_> {
    let mut g = g;
    let lock = g.ports[id.0].as_ref().expect("send on a dead port").lock;
    g = synch::lock_acquire(g, lock);

    {
        let port = g.ports[id.0].as_mut().unwrap();
        port.senders += 1;
        port.buffer.push_back(msg);
    }

    while g.ports[id.0].as_ref().unwrap().receivers == 0 {
        let cond = g.ports[id.0].as_ref().unwrap().send_cond;
        g = synch::cond_wait(g, cond);
    }
    log::trace!(
        "thread \"{}\" sent {} on port \"{}\"",
        g.current_tcb().name,
        msg,
        g.ports[id.0].as_ref().unwrap().name
    );

    g.ports[id.0].as_mut().unwrap().receivers -= 1;
    let cond = g.ports[id.0].as_ref().unwrap().recv_cond;
    g = synch::cond_signal(g, cond);
    synch::lock_release(g, lock)
}

/// Blocks until a sender's message is available, then takes it.
pub(crate) fn port_receive(g: Guard<'_>, id: PortId) -> (Guard<'_>, i32) {
    let mut g = g;
    let lock = g.ports[id.0].as_ref().expect("receive on a dead port").lock;
    g = synch::lock_acquire(g, lock);

    g.ports[id.0].as_mut().unwrap().receivers += 1;

    while g.ports[id.0].as_ref().unwrap().senders == 0 {
        let cond = g.ports[id.0].as_ref().unwrap().recv_cond;
        g = synch::cond_wait(g, cond);
    }

    let msg = {
        let port = g.ports[id.0].as_mut().unwrap();
        let msg = port.buffer.pop_front().expect("sender left no message");
        port.senders -= 1;
        msg
    };
    log::trace!(
        "thread \"{}\" received {} on port \"{}\"",
        g.current_tcb().name,
        msg,
        g.ports[id.0].as_ref().unwrap().name
    );

    let cond = g.ports[id.0].as_ref().unwrap().send_cond;
    g = synch::cond_signal(g, cond);
    (synch::lock_release(g, lock), msg)
}

impl Kernel {
    /// Creates a rendezvous port.
    pub fn new_port(&self, name: &str) -> PortId {
        port_create_locked(&mut self.state(), name.to_string())
    }

    /// Destroys an idle port.
    pub fn destroy_port(&self, id: PortId) {
        port_destroy_locked(&mut self.state(), id);
    }

    /// Sends `msg`, returning only after a matching receive.
    pub fn send(&self, id: PortId, msg: i32) {
        drop(port_send(self.state(), id, msg));
    }

    /// Receives the oldest unmatched message, blocking until one exists.
    pub fn receive(&self, id: PortId) -> i32 {
        let (g, msg) = port_receive(self.state(), id);
        drop(g);
        msg
    }
}
