// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The file-descriptor table.
//!
//! One table for the whole kernel, with per-slot thread ownership: only the
//! thread that attached a file may use or release its descriptor.
//! Descriptors 0 and 1 are reserved for console input and output and never
//! occupy slots.

use abi::{OpenFileId, Tid};
use machine::filesys::OpenFile;

/// Number of descriptor slots, reserved ones included.
pub(crate) const FD_TABLE_SIZE: usize = 128;

struct FdEntry {
    file: Box<dyn OpenFile>,
    owner: Tid,
}

pub(crate) struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: (0..FD_TABLE_SIZE).map(|_| None).collect(),
        }
    }

    /// Attaches `file` at the first free descriptor, owned by `owner`.
    /// Returns `None` when the table is full.
    pub fn attach(&mut self, file: Box<dyn OpenFile>, owner: Tid) -> Option<OpenFileId> {
        let id = (2..FD_TABLE_SIZE).find(|&i| self.slots[i].is_none())?;
        log::debug!("file attached at descriptor {id}");
        self.slots[id] = Some(FdEntry { file, owner });
        Some(id as OpenFileId)
    }

    /// The file behind `id`, if `id` is a plausible descriptor, the slot is
    /// occupied, and `caller` is its owner.
    pub fn get(&mut self, id: OpenFileId, caller: Tid) -> Option<&mut dyn OpenFile> {
        let entry = self.checked_entry(id, caller)?;
        Some(self.slots[entry].as_mut().unwrap().file.as_mut())
    }

    /// Releases `id`, returning the file so the caller can dispose of it.
    /// Same ownership rules as `get`.
    pub fn detach(&mut self, id: OpenFileId, caller: Tid) -> Option<Box<dyn OpenFile>> {
        let entry = self.checked_entry(id, caller)?;
        log::debug!("file detached from descriptor {id}");
        Some(self.slots[entry].take().unwrap().file)
    }

    fn checked_entry(&self, id: OpenFileId, caller: Tid) -> Option<usize> {
        if !(2..FD_TABLE_SIZE as OpenFileId).contains(&id) {
            log::debug!("descriptor {id} out of range");
            return None;
        }
        let slot = id as usize;
        match &self.slots[slot] {
            None => {
                log::debug!("descriptor {id} is free");
                None
            }
            Some(e) if e.owner != caller => {
                log::debug!("descriptor {id} belongs to another thread");
                None
            }
            Some(_) => Some(slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Generation;
    use machine::filesys::{FileSystem, StubFileSystem};

    fn tid(i: usize) -> Tid {
        Tid::for_index_and_gen(i, Generation::ZERO)
    }

    fn file() -> Box<dyn OpenFile> {
        let mut fs = StubFileSystem::new();
        fs.create("f", 8);
        fs.open("f").unwrap()
    }

    #[test]
    fn descriptors_start_at_two() {
        let mut t = FdTable::new();
        assert_eq!(t.attach(file(), tid(1)), Some(2));
        assert_eq!(t.attach(file(), tid(1)), Some(3));
    }

    #[test]
    fn reserved_and_out_of_range_ids_fail() {
        let mut t = FdTable::new();
        t.attach(file(), tid(1));
        for bad in [0, 1, -1, FD_TABLE_SIZE as OpenFileId] {
            assert!(t.get(bad, tid(1)).is_none());
            assert!(t.detach(bad, tid(1)).is_none());
        }
    }

    #[test]
    fn only_the_owner_may_touch_a_slot() {
        let mut t = FdTable::new();
        let id = t.attach(file(), tid(1)).unwrap();
        assert!(t.get(id, tid(2)).is_none());
        assert!(t.detach(id, tid(2)).is_none());
        assert!(t.get(id, tid(1)).is_some());
        assert!(t.detach(id, tid(1)).is_some());
        assert!(t.get(id, tid(1)).is_none(), "slot must be free after detach");
    }

    #[test]
    fn table_fills_up() {
        let mut t = FdTable::new();
        for _ in 2..FD_TABLE_SIZE {
            assert!(t.attach(file(), tid(1)).is_some());
        }
        assert_eq!(t.attach(file(), tid(1)), None);
    }
}
