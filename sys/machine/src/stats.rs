// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Performance counters for the simulation, reported at halt.

/// Running totals since power-on. `total_ticks` mirrors the timeline clock;
/// the mode split records where that time went.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub total_ticks: u64,
    pub idle_ticks: u64,
    pub system_ticks: u64,
    pub user_ticks: u64,
    pub console_chars_read: u64,
    pub console_chars_written: u64,
    pub page_faults: u64,
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Ticks: total {}, idle {}, system {}, user {}",
            self.total_ticks, self.idle_ticks, self.system_ticks, self.user_ticks
        )?;
        writeln!(
            f,
            "Console I/O: reads {}, writes {}",
            self.console_chars_read, self.console_chars_written
        )?;
        write!(f, "Paging: faults {}", self.page_faults)
    }
}
