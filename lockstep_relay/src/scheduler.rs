// Fixed-cadence network tick.
//
// `NetScheduler` decides when the order buffer is flushed. Each tick is one
// network frame (`timestep * net_frame_interval`). Deadlines advance by a
// whole step per tick so short delays are caught up. If the loop stalls
// long enough that `now` is more than `jank_threshold` past the deadline,
// the deadline is rebased to `now + step` instead of firing a burst of
// catch-up ticks.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct NetScheduler {
    step: Duration,
    jank_threshold: Duration,
    next_tick: Instant,
    net_frame: u64,
}

impl NetScheduler {
    /// First tick fires one step after `now`.
    pub fn new(step: Duration, jank_threshold: Duration, now: Instant) -> Self {
        Self {
            step,
            jank_threshold,
            next_tick: now + step,
            net_frame: 0,
        }
    }

    /// Number of ticks fired so far.
    pub fn net_frame(&self) -> u64 {
        self.net_frame
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Returns true if a tick is due at `now`, advancing the deadline.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_tick {
            return false;
        }
        if now - self.next_tick > self.jank_threshold {
            self.next_tick = now + self.step;
        } else {
            self.next_tick += self.step;
        }
        self.net_frame += 1;
        true
    }

    /// Time left before the next tick, zero if it is already due.
    pub fn time_until_next(&self, now: Instant) -> Duration {
        self.next_tick.saturating_duration_since(now)
    }
}
