// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interval timer device.
//!
//! Once armed, the timer raises `TimerTick` repeatedly; each service re-arms
//! the next one. In random mode the interval jitters around the base value,
//! which is how the bootstrap's random-time-slicing option shakes thread
//! interleavings loose. The generator is seeded, so a given seed replays the
//! same schedule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::interrupt::{DeviceEvent, Timeline};
use crate::TIMER_TICKS;

pub struct Timer {
    random: bool,
    rng: StdRng,
}

impl Timer {
    pub fn new(random: bool, seed: u64) -> Self {
        Self {
            random,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Schedules the next tick.
    pub fn arm(&mut self, timeline: &mut Timeline) {
        let delay = if self.random {
            1 + self.rng.random_range(0..TIMER_TICKS * 2)
        } else {
            TIMER_TICKS
        };
        timeline.schedule(delay, DeviceEvent::TimerTick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_timer_ticks_at_base_interval() {
        let mut t = Timeline::new();
        let mut timer = Timer::new(false, 0);
        timer.arm(&mut t);
        assert_eq!(t.advance(TIMER_TICKS), vec![DeviceEvent::TimerTick]);
    }

    #[test]
    fn random_timer_stays_in_range_and_replays() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        for out in [&mut a, &mut b] {
            let mut t = Timeline::new();
            let mut timer = Timer::new(true, 42);
            for _ in 0..32 {
                timer.arm(&mut t);
                let before = t.now();
                assert!(t.advance_to_next().is_some());
                let delay = t.now() - before;
                assert!((1..=TIMER_TICKS * 2).contains(&delay));
                out.push(delay);
            }
        }
        assert_eq!(a, b, "same seed must replay the same schedule");
    }
}
