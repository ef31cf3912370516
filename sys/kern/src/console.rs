// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous access to the console device.
//!
//! The device itself is interrupt-driven; this wrapper gives each direction
//! a lock (one reader, one writer at a time) and a semaphore that the
//! interrupt handlers V to announce completion, so callers simply block.

use crate::synch::{self, LockId, LockState, SemId, SemState};
use crate::util::insert_slot;
use crate::{Kernel, KernelState};

/// The synchronization around the console device, created at bootstrap.
pub(crate) struct SynchConsole {
    pub read_sem: SemId,
    pub write_sem: SemId,
    pub read_lock: LockId,
    pub write_lock: LockId,
}

impl SynchConsole {
    /// Builds the console's semaphores and locks directly into the slabs;
    /// this runs before the kernel state exists as a whole.
    pub fn bootstrap(
        sems: &mut Vec<Option<SemState>>,
        locks: &mut Vec<Option<LockState>>,
    ) -> Self {
        let mut sem = |name: &str, value| {
            SemId(insert_slot(
                sems,
                SemState {
                    name: name.to_string(),
                    value,
                    queue: Default::default(),
                },
            ))
        };
        let read_sem = sem("consoleReadSem", 0);
        let write_sem = sem("consoleWriteSem", 0);
        let read_lock_sem = sem("consoleReadLock.sem", 1);
        let write_lock_sem = sem("consoleWriteLock.sem", 1);
        let mut lock = |name: &str, sem| {
            LockId(insert_slot(
                locks,
                LockState {
                    name: name.to_string(),
                    owner: None,
                    sem,
                },
            ))
        };
        Self {
            read_sem,
            write_sem,
            read_lock: lock("consoleReadLock", read_lock_sem),
            write_lock: lock("consoleWriteLock", write_lock_sem),
        }
    }
}

impl Kernel {
    /// Reads one character from the console, blocking until one arrives.
    pub fn console_get_char(&self) -> u8 {
        let mut g = self.state();
        let (read_lock, read_sem) = (g.synch_console.read_lock, g.synch_console.read_sem);
        g = synch::lock_acquire(g, read_lock);
        g = synch::sem_p(g, read_sem);
        let ch = {
            let KernelState {
                console_dev,
                timeline,
                stats,
                ..
            } = &mut *g;
            stats.console_chars_read += 1;
            console_dev.read_char(timeline)
        };
        drop(synch::lock_release(g, read_lock));
        ch
    }

    /// Writes one character to the console, blocking until the device has
    /// emitted it.
    pub fn console_put_char(&self, ch: u8) {
        let mut g = self.state();
        let (write_lock, write_sem) = (g.synch_console.write_lock, g.synch_console.write_sem);
        g = synch::lock_acquire(g, write_lock);
        {
            let KernelState {
                console_dev,
                timeline,
                ..
            } = &mut *g;
            console_dev.put_char(timeline, ch);
        }
        g = synch::sem_p(g, write_sem);
        drop(synch::lock_release(g, write_lock));
    }

    /// Reads exactly `n` characters, holding the read lock across the whole
    /// transfer so concurrent readers cannot interleave.
    pub fn console_get_buffer(&self, n: usize) -> Vec<u8> {
        let mut g = self.state();
        let (read_lock, read_sem) = (g.synch_console.read_lock, g.synch_console.read_sem);
        g = synch::lock_acquire(g, read_lock);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            g = synch::sem_p(g, read_sem);
            let KernelState {
                console_dev,
                timeline,
                stats,
                ..
            } = &mut *g;
            stats.console_chars_read += 1;
            out.push(console_dev.read_char(timeline));
        }
        drop(synch::lock_release(g, read_lock));
        out
    }

    /// Writes all of `bytes`, one completion interrupt at a time, holding
    /// the write lock across the whole transfer.
    pub fn console_put_buffer(&self, bytes: &[u8]) {
        let mut g = self.state();
        let (write_lock, write_sem) = (g.synch_console.write_lock, g.synch_console.write_sem);
        g = synch::lock_acquire(g, write_lock);
        for &ch in bytes {
            {
                let KernelState {
                    console_dev,
                    timeline,
                    ..
                } = &mut *g;
                console_dev.put_char(timeline, ch);
            }
            g = synch::sem_p(g, write_sem);
        }
        drop(synch::lock_release(g, write_lock));
    }
}
