// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt gate.
//!
//! Masking interrupts is the kernel's one atomic primitive: with the gate
//! off, no context switch can occur. Critical sections bracket themselves
//! with `set_level` save/restore rather than unconditionally enabling,
//! because many are entered with interrupts already off.
//!
//! Re-enabling the gate is also where simulated time moves: the off-to-on
//! transition burns one system tick, services whatever interrupts came due,
//! and honors a device's pending yield request. `idle` jumps time forward
//! to the next scheduled interrupt when nothing is runnable.

use machine::interrupt::{DeviceEvent, IntLevel};
use machine::SYSTEM_TICK;

use crate::synch;
use crate::thread;
use crate::{Guard, Kernel, KernelState};

/// Where a slice of simulated time is accounted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TickMode {
    System,
    User,
}

/// Sets the gate to `new`, returning the previous level. Turning the gate
/// on from off advances one system tick, which may service device
/// interrupts and even context switch before this returns.
pub(crate) fn set_level(g: Guard<'_>, new: IntLevel) -> (Guard<'_>, IntLevel) {
    let mut g = g;
    let old = g.timeline.set_level(new);
    if old == IntLevel::Off && new == IntLevel::On {
        g = one_tick(g, SYSTEM_TICK, TickMode::System);
    }
    (g, old)
}

/// Advances simulated time by `ticks` and services anything that came due.
/// Interrupt handlers run with the gate forced off; if one asked for a
/// yield, the interrupted thread yields on the way out, exactly as if it
/// had called yield itself at this point.
pub(crate) fn one_tick(mut g: Guard<'_>, ticks: u64, mode: TickMode) -> Guard<'_> {
    let level = g.timeline.set_level(IntLevel::Off);
    let events = g.timeline.advance(ticks);
    match mode {
        TickMode::System => g.stats.system_ticks += ticks,
        TickMode::User => g.stats.user_ticks += ticks,
    }
    g.stats.total_ticks = g.timeline.now();
    g = service(g, events);
    g.timeline.set_level(level);

    if g.timeline.take_yield_on_return() {
        g = thread::yield_locked(g);
    }
    g
}

/// Nothing is runnable: jump the clock to the next pending interrupt and
/// service it, in the hope that it readies a thread.
///
/// Panics if nothing is pending. With no runnable thread and no interrupt
/// ever coming, the machine can only sit here forever; that is a deadlock,
/// and a loud failure beats simulating the heat death of the universe.
pub(crate) fn idle(mut g: Guard<'_>) -> Guard<'_> {
    log::trace!("machine idling at tick {}", g.timeline.now());
    g.timeline.set_idling(true);
    let before = g.timeline.now();
    let events = match g.timeline.advance_to_next() {
        Some(events) => events,
        None => panic!("no threads ready or runnable, and no pending interrupts"),
    };
    g.stats.idle_ticks += g.timeline.now() - before;
    g.stats.total_ticks = g.timeline.now();
    g = service(g, events);
    g.timeline.set_idling(false);
    g
}

/// Runs the handler for each due device event.
fn service(mut g: Guard<'_>, events: Vec<DeviceEvent>) -> Guard<'_> {
    for event in events {
        match event {
            DeviceEvent::ConsoleWriteDone => {
                g.console_dev.write_done();
                g.stats.console_chars_written += 1;
                let sem = g.synch_console.write_sem;
                g = synch::sem_v(g, sem);
            }
            DeviceEvent::ConsoleReadReady => {
                g.console_dev.read_ready();
                let sem = g.synch_console.read_sem;
                g = synch::sem_v(g, sem);
            }
            DeviceEvent::TimerTick => {
                let KernelState {
                    timer, timeline, ..
                } = &mut *g;
                if let Some(t) = timer.as_mut() {
                    t.arm(timeline);
                    // Don't bother yielding if the interrupt landed in the
                    // idle loop; there is nobody to yield to.
                    if !timeline.is_idling() {
                        timeline.request_yield_on_return();
                    }
                }
            }
        }
    }
    g
}

impl Kernel {
    /// The current interrupt level.
    pub fn interrupt_level(&self) -> IntLevel {
        self.state().timeline.level()
    }

    /// Sets the interrupt level, returning the previous one. The idiomatic
    /// critical section saves the return value and restores it, rather than
    /// unconditionally enabling.
    pub fn set_interrupt_level(&self, new: IntLevel) -> IntLevel {
        let (g, old) = set_level(self.state(), new);
        drop(g);
        old
    }
}

#[cfg(test)]
mod tests {
    use crate::{Kernel, Options};
    use machine::interrupt::IntLevel;
    use machine::SYSTEM_TICK;

    #[test]
    fn set_level_reports_the_previous_level() {
        let kernel = Kernel::start(Options::default());
        // The bootstrap leaves interrupts enabled.
        assert_eq!(kernel.interrupt_level(), IntLevel::On);
        assert_eq!(kernel.set_interrupt_level(IntLevel::Off), IntLevel::On);
        assert_eq!(kernel.set_interrupt_level(IntLevel::Off), IntLevel::Off);
        assert_eq!(kernel.set_interrupt_level(IntLevel::On), IntLevel::Off);
        assert_eq!(kernel.interrupt_level(), IntLevel::On);
    }

    #[test]
    fn reenabling_advances_one_system_tick() {
        let kernel = Kernel::start(Options::default());
        let before = kernel.statistics();
        kernel.set_interrupt_level(IntLevel::Off);
        assert_eq!(kernel.statistics().total_ticks, before.total_ticks);
        kernel.set_interrupt_level(IntLevel::On);
        let after = kernel.statistics();
        assert_eq!(after.total_ticks, before.total_ticks + SYSTEM_TICK);
        assert_eq!(after.system_ticks, before.system_ticks + SYSTEM_TICK);
    }

    #[test]
    fn nested_save_restore_leaves_the_level_unchanged() {
        let kernel = Kernel::start(Options::default());
        let outer = kernel.set_interrupt_level(IntLevel::Off);
        let inner = kernel.set_interrupt_level(IntLevel::Off);
        kernel.set_interrupt_level(inner);
        kernel.set_interrupt_level(outer);
        assert_eq!(kernel.interrupt_level(), IntLevel::On);
    }

    #[test]
    #[should_panic(expected = "no pending interrupts")]
    fn blocking_with_nothing_pending_is_a_detected_deadlock() {
        let kernel = Kernel::start(Options::default());
        let sem = kernel.new_semaphore("never", 0);
        // Nothing will ever V this, and no device interrupt is scheduled.
        kernel.p(sem);
    }

    #[test]
    fn armed_timer_keeps_time_moving() {
        let kernel = Kernel::start(Options {
            random_slice: true,
            rng_seed: 7,
            ..Default::default()
        });
        let before = kernel.statistics().total_ticks;
        for _ in 0..100 {
            kernel.set_interrupt_level(IntLevel::Off);
            kernel.set_interrupt_level(IntLevel::On);
        }
        let after = kernel.statistics().total_ticks;
        // At least one tick per re-enable; timer yields burn extra ones.
        assert!(after >= before + 100 * SYSTEM_TICK);
        // The timer re-arms itself each service, so something is always
        // pending and an idle machine would wake again.
        assert!(kernel.state().timeline.has_pending());
    }
}
