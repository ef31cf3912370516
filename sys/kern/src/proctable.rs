// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process table: SpaceId to thread, plus exit status.
//!
//! A slot is attached when `Exec` succeeds, flips Alive to Dead when the
//! process exits, and is freed when a joiner collects the exit value.

use abi::{SpaceId, Tid};

/// Number of process slots.
pub(crate) const MAX_PROCESSES: usize = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ProcStatus {
    Alive,
    Dead,
}

struct Process {
    thread: Tid,
    status: ProcStatus,
    exit_value: i32,
}

pub(crate) struct ProcTable {
    slots: Vec<Option<Process>>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PROCESSES).map(|_| None).collect(),
        }
    }

    /// Records a new process in the first free slot; its index is the
    /// SpaceId. `None` when the table is full.
    pub fn attach(&mut self, thread: Tid) -> Option<SpaceId> {
        let id = self.slots.iter().position(Option::is_none)?;
        log::debug!("process attached at slot {id}");
        self.slots[id] = Some(Process {
            thread,
            status: ProcStatus::Alive,
            exit_value: 0,
        });
        Some(id as SpaceId)
    }

    /// Marks a process Dead with its exit value. Rejects unknown slots and
    /// repeat deaths.
    pub fn detach(&mut self, id: SpaceId, exit_value: i32) -> bool {
        let Some(p) = self.slot_mut(id) else {
            log::debug!("detach of invalid or free process slot {id}");
            return false;
        };
        if p.status == ProcStatus::Dead {
            log::debug!("detach of already-dead process {id}");
            return false;
        }
        p.status = ProcStatus::Dead;
        p.exit_value = exit_value;
        log::debug!("process {id} detached, exit value {exit_value}");
        true
    }

    /// Collects a Dead process's exit value and frees its slot. `None`
    /// while the process is still alive, or if the slot is unknown.
    pub fn exit_value(&mut self, id: SpaceId) -> Option<i32> {
        let p = self.slot_mut(id)?;
        if p.status == ProcStatus::Alive {
            log::debug!("exit value requested for live process {id}");
            return None;
        }
        let value = p.exit_value;
        self.slots[id as usize] = None;
        log::debug!("process slot {id} is free again");
        Some(value)
    }

    /// The thread running (or having run) process `id`.
    pub fn thread_for(&self, id: SpaceId) -> Option<Tid> {
        if !(0..MAX_PROCESSES as SpaceId).contains(&id) {
            return None;
        }
        self.slots[id as usize].as_ref().map(|p| p.thread)
    }

    /// Reverse lookup: the SpaceId attached to `thread`, if any.
    pub fn space_id_of(&self, thread: Tid) -> Option<SpaceId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.thread == thread))
            .map(|i| i as SpaceId)
    }

    fn slot_mut(&mut self, id: SpaceId) -> Option<&mut Process> {
        if !(0..MAX_PROCESSES as SpaceId).contains(&id) {
            return None;
        }
        self.slots[id as usize].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Generation;

    fn tid(i: usize) -> Tid {
        Tid::for_index_and_gen(i, Generation::ZERO)
    }

    #[test]
    fn lifecycle_alive_dead_collected() {
        let mut t = ProcTable::new();
        let id = t.attach(tid(4)).unwrap();
        assert_eq!(t.thread_for(id), Some(tid(4)));
        assert_eq!(t.space_id_of(tid(4)), Some(id));

        assert_eq!(t.exit_value(id), None, "no exit value while alive");
        assert!(t.detach(id, 42));
        assert!(!t.detach(id, 99), "second death must be rejected");
        assert_eq!(t.exit_value(id), Some(42));

        assert_eq!(t.thread_for(id), None, "slot freed after collection");
        assert_eq!(t.exit_value(id), None);
    }

    #[test]
    fn bad_ids_are_rejected() {
        let mut t = ProcTable::new();
        assert!(!t.detach(-1, 0));
        assert!(!t.detach(MAX_PROCESSES as SpaceId, 0));
        assert_eq!(t.thread_for(-1), None);
        assert_eq!(t.exit_value(5), None);
    }

    #[test]
    fn slots_are_reused_in_order() {
        let mut t = ProcTable::new();
        let a = t.attach(tid(1)).unwrap();
        let b = t.attach(tid(2)).unwrap();
        assert_ne!(a, b);
        t.detach(a, 0);
        t.exit_value(a);
        assert_eq!(t.attach(tid(3)), Some(a));
    }
}
