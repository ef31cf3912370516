// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The asynchronous console device.
//!
//! Output: `put_char` accepts one character, goes busy, and raises
//! `ConsoleWriteDone` a fixed delay later; the character reaches the output
//! sink when the interrupt is serviced. Input: bytes fed by the embedder
//! become visible one at a time, each announced by a `ConsoleReadReady`
//! interrupt. The synchronization on top of this lives in the kernel.

use std::collections::VecDeque;

use crate::interrupt::{DeviceEvent, Timeline};
use crate::CONSOLE_TICKS;

#[derive(Default)]
pub struct Console {
    input: VecDeque<u8>,
    output: Vec<u8>,
    in_flight: Option<u8>,
    read_armed: bool,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a previous `put_char` has not yet completed.
    pub fn write_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Starts emitting `ch`. The device holds exactly one character; callers
    /// must await `ConsoleWriteDone` before the next.
    pub fn put_char(&mut self, timeline: &mut Timeline, ch: u8) {
        assert!(self.in_flight.is_none(), "console write while busy");
        self.in_flight = Some(ch);
        timeline.schedule(CONSOLE_TICKS, DeviceEvent::ConsoleWriteDone);
    }

    /// Completes the in-flight write; the kernel calls this when servicing
    /// `ConsoleWriteDone`.
    pub fn write_done(&mut self) {
        let ch = self.in_flight.take().expect("write-done with idle console");
        self.output.push(ch);
        log::trace!("console emitted {:?}", ch as char);
    }

    /// Supplies input bytes, arming a `ConsoleReadReady` if none is on the
    /// way.
    pub fn feed(&mut self, timeline: &mut Timeline, bytes: &[u8]) {
        self.input.extend(bytes);
        if !self.input.is_empty() && !self.read_armed {
            self.read_armed = true;
            timeline.schedule(CONSOLE_TICKS, DeviceEvent::ConsoleReadReady);
        }
    }

    /// Acknowledges `ConsoleReadReady`; the announced character may now be
    /// fetched with `read_char`.
    pub fn read_ready(&mut self) {
        self.read_armed = false;
    }

    /// Fetches the announced input character and arms the announcement for
    /// the next one, if any.
    pub fn read_char(&mut self, timeline: &mut Timeline) -> u8 {
        let ch = self.input.pop_front().expect("console read with no input");
        if !self.input.is_empty() && !self.read_armed {
            self.read_armed = true;
            timeline.schedule(CONSOLE_TICKS, DeviceEvent::ConsoleReadReady);
        }
        ch
    }

    /// Everything written so far, draining the sink.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }
}
