// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The file system interface the kernel consumes, and the in-memory stub.
//!
//! The real disk-backed file system is somebody else's problem; the kernel
//! only ever sees these two traits. The stub keeps whole files in memory
//! with the fixed-capacity discipline of the real thing: a file's size is
//! set at creation and writes clamp against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An open handle: positioned reads/writes plus the random-access pair the
/// loader uses.
pub trait OpenFile: Send {
    /// Reads at the handle's seek position, advancing it. Returns the count
    /// actually read.
    fn read(&mut self, into: &mut [u8]) -> usize;

    /// Writes at the handle's seek position, advancing it. Returns the count
    /// actually written.
    fn write(&mut self, from: &[u8]) -> usize;

    /// Reads at an absolute offset without touching the seek position.
    fn read_at(&mut self, into: &mut [u8], offset: usize) -> usize;

    /// Writes at an absolute offset without touching the seek position.
    fn write_at(&mut self, from: &[u8], offset: usize) -> usize;

    /// The file's capacity in bytes.
    fn length(&self) -> usize;
}

pub trait FileSystem: Send {
    /// Creates `name` with a fixed capacity of `size` zero bytes. Fails if
    /// the name exists.
    fn create(&mut self, name: &str, size: usize) -> bool;

    /// Opens an existing file; independent handles share the same bytes.
    fn open(&mut self, name: &str) -> Option<Box<dyn OpenFile>>;

    /// Unlinks `name`. Existing handles keep working.
    fn remove(&mut self, name: &str) -> bool;
}

/// The in-memory stand-in for the disk file system.
#[derive(Default)]
pub struct StubFileSystem {
    files: HashMap<String, Arc<Mutex<Vec<u8>>>>,
}

impl StubFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a ready-made file in place, existing or not. This is the
    /// fixture path for installing executables and input data.
    pub fn install(&mut self, name: &str, bytes: Vec<u8>) {
        self.files
            .insert(name.to_string(), Arc::new(Mutex::new(bytes)));
    }
}

impl FileSystem for StubFileSystem {
    fn create(&mut self, name: &str, size: usize) -> bool {
        if self.files.contains_key(name) {
            return false;
        }
        self.files
            .insert(name.to_string(), Arc::new(Mutex::new(vec![0; size])));
        true
    }

    fn open(&mut self, name: &str) -> Option<Box<dyn OpenFile>> {
        let data = self.files.get(name)?.clone();
        Some(Box::new(StubOpenFile { data, pos: 0 }))
    }

    fn remove(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }
}

struct StubOpenFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl OpenFile for StubOpenFile {
    fn read(&mut self, into: &mut [u8]) -> usize {
        let n = self.read_at_inner(into, self.pos);
        self.pos += n;
        n
    }

    fn write(&mut self, from: &[u8]) -> usize {
        let n = self.write_at_inner(from, self.pos);
        self.pos += n;
        n
    }

    fn read_at(&mut self, into: &mut [u8], offset: usize) -> usize {
        self.read_at_inner(into, offset)
    }

    fn write_at(&mut self, from: &[u8], offset: usize) -> usize {
        self.write_at_inner(from, offset)
    }

    fn length(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl StubOpenFile {
    fn read_at_inner(&self, into: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock().unwrap();
        let avail = data.len().saturating_sub(offset);
        let n = avail.min(into.len());
        into[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at_inner(&self, from: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock().unwrap();
        let room = data.len().saturating_sub(offset);
        let n = room.min(from.len());
        data[offset..offset + n].copy_from_slice(&from[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reopen_sees_the_same_bytes() {
        let mut fs = StubFileSystem::new();
        assert!(fs.create("f", 16));
        assert!(!fs.create("f", 16), "double create must fail");

        let mut a = fs.open("f").unwrap();
        assert_eq!(a.write(b"hello"), 5);

        let mut b = fs.open("f").unwrap();
        let mut buf = [0; 5];
        assert_eq!(b.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn writes_clamp_at_capacity() {
        let mut fs = StubFileSystem::new();
        fs.create("small", 4);
        let mut f = fs.open("small").unwrap();
        assert_eq!(f.write(b"abcdef"), 4);
        assert_eq!(f.write(b"x"), 0);
        assert_eq!(f.length(), 4);
    }

    #[test]
    fn read_past_end_returns_zero() {
        let mut fs = StubFileSystem::new();
        fs.install("f", b"ab".to_vec());
        let mut f = fs.open("f").unwrap();
        let mut buf = [0; 4];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn read_at_leaves_seek_position_alone() {
        let mut fs = StubFileSystem::new();
        fs.install("f", b"abcdef".to_vec());
        let mut f = fs.open("f").unwrap();
        let mut buf = [0; 2];
        assert_eq!(f.read_at(&mut buf, 4), 2);
        assert_eq!(&buf, b"ef");
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(&buf, b"ab");
    }

    #[test]
    fn remove_unlinks_but_handles_survive() {
        let mut fs = StubFileSystem::new();
        fs.install("f", b"zz".to_vec());
        let mut f = fs.open("f").unwrap();
        assert!(fs.remove("f"));
        assert!(fs.open("f").is_none());
        assert_eq!(f.length(), 2);
    }
}
