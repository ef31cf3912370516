// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated time and the pending-interrupt queue.
//!
//! Devices do not finish work when asked; they schedule a completion event
//! some ticks in the future. Time only moves when the kernel lets it: one
//! system tick whenever interrupts are re-enabled, or a jump to the next
//! pending event when the machine idles. The kernel drains due events and
//! runs the matching handlers.

use std::collections::VecDeque;

/// The interrupt-enable flag of the simulated processor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntLevel {
    Off,
    On,
}

/// What a due interrupt is about; the kernel maps these to handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    /// The console finished emitting the character given to `put_char`.
    ConsoleWriteDone,
    /// The console has an input character ready to fetch.
    ConsoleReadReady,
    /// The interval timer fired.
    TimerTick,
}

#[derive(Copy, Clone, Debug)]
struct Pending {
    due: u64,
    event: DeviceEvent,
}

/// Simulated clock plus the time-ordered queue of scheduled device events.
pub struct Timeline {
    level: IntLevel,
    now: u64,
    pending: VecDeque<Pending>,
    yield_on_return: bool,
    idling: bool,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            level: IntLevel::Off,
            now: 0,
            pending: VecDeque::new(),
            yield_on_return: false,
            idling: false,
        }
    }

    pub fn level(&self) -> IntLevel {
        self.level
    }

    /// Flips the interrupt-enable flag, returning the previous setting. The
    /// kernel's gate is responsible for advancing time on the off-to-on
    /// transition.
    pub fn set_level(&mut self, level: IntLevel) -> IntLevel {
        std::mem::replace(&mut self.level, level)
    }

    /// Current simulated time in ticks.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedules `event` to come due `delay` ticks from now. Events at equal
    /// times fire in scheduling order.
    pub fn schedule(&mut self, delay: u64, event: DeviceEvent) {
        let due = self.now + delay;
        let at = self.pending.partition_point(|p| p.due <= due);
        self.pending.insert(at, Pending { due, event });
        log::trace!("scheduled {event:?} at tick {due}");
    }

    /// Advances the clock by `ticks` and returns the events that came due,
    /// soonest first.
    pub fn advance(&mut self, ticks: u64) -> Vec<DeviceEvent> {
        self.now += ticks;
        self.drain_due()
    }

    /// Jumps the clock to the next pending event and returns everything due
    /// there. Returns `None` if nothing is pending: time can no longer
    /// move, so an idle machine is a dead machine.
    pub fn advance_to_next(&mut self) -> Option<Vec<DeviceEvent>> {
        let first = self.pending.front()?.due;
        self.now = self.now.max(first);
        Some(self.drain_due())
    }

    fn drain_due(&mut self) -> Vec<DeviceEvent> {
        let mut due = Vec::new();
        while let Some(p) = self.pending.front() {
            if p.due > self.now {
                break;
            }
            due.push(self.pending.pop_front().unwrap().event);
        }
        due
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Asks the kernel to yield the interrupted thread once the current
    /// handler batch finishes, instead of yielding from handler context.
    pub fn request_yield_on_return(&mut self) {
        self.yield_on_return = true;
    }

    pub fn take_yield_on_return(&mut self) -> bool {
        std::mem::take(&mut self.yield_on_return)
    }

    /// Marks whether the processor is in its idle loop; handlers use this to
    /// avoid preempting nothing.
    pub fn set_idling(&mut self, idling: bool) {
        self.idling = idling;
    }

    pub fn is_idling(&self) -> bool {
        self.idling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_level_returns_previous() {
        let mut t = Timeline::new();
        assert_eq!(t.set_level(IntLevel::On), IntLevel::Off);
        assert_eq!(t.set_level(IntLevel::On), IntLevel::On);
        assert_eq!(t.set_level(IntLevel::Off), IntLevel::On);
    }

    #[test]
    fn events_fire_in_time_order() {
        let mut t = Timeline::new();
        t.schedule(30, DeviceEvent::TimerTick);
        t.schedule(10, DeviceEvent::ConsoleWriteDone);
        assert_eq!(t.advance(10), vec![DeviceEvent::ConsoleWriteDone]);
        assert_eq!(t.advance(10), vec![]);
        assert_eq!(t.advance(10), vec![DeviceEvent::TimerTick]);
    }

    #[test]
    fn equal_times_fire_fifo() {
        let mut t = Timeline::new();
        t.schedule(5, DeviceEvent::ConsoleReadReady);
        t.schedule(5, DeviceEvent::ConsoleWriteDone);
        assert_eq!(
            t.advance(5),
            vec![DeviceEvent::ConsoleReadReady, DeviceEvent::ConsoleWriteDone]
        );
    }

    #[test]
    fn idle_jumps_to_next_event() {
        let mut t = Timeline::new();
        t.schedule(1000, DeviceEvent::TimerTick);
        assert_eq!(t.advance_to_next(), Some(vec![DeviceEvent::TimerTick]));
        assert_eq!(t.now(), 1000);
        assert_eq!(t.advance_to_next(), None);
    }

    #[test]
    fn yield_request_is_one_shot() {
        let mut t = Timeline::new();
        t.request_yield_on_return();
        assert!(t.take_yield_on_return());
        assert!(!t.take_yield_on_return());
    }
}
