// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Failures split into two tiers. Kernel invariant violations (lock misuse,
//! fencepost corruption, destroying the running thread) are panics and live
//! nowhere near this module. Everything a user program can legitimately
//! cause comes back as a `Result` and ultimately as `-1` in its result
//! register.

use abi::noff::NoffError;

/// Ways process creation can fail. Every variant reaches the user as `-1`;
/// the distinctions exist for kernel-side logging and for embedders calling
/// [`crate::Kernel::exec`] directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecError {
    /// The command string contained no executable path.
    EmptyCommand,
    /// More arguments than the kernel marshals onto a user stack.
    TooManyArgs,
    /// The executable path did not resolve to a file.
    NoSuchFile,
    /// The executable exists but its image header does not parse.
    BadImage(NoffError),
    /// Not enough free physical frames for the image plus its stack.
    OutOfMemory,
    /// No free slot in the process table.
    ProcessTableFull,
}

impl From<NoffError> for ExecError {
    fn from(e: NoffError) -> Self {
        Self::BadImage(e)
    }
}
