//! Contract between the poll loop and the translation engine.
//!
//! The loop knows nothing about NAT, DHCP or TCP. It hands the engine a
//! poll set to extend, frames read from the interface, and a chance to act
//! on readiness and timers. Frames flow back through the [`FrameSink`]
//! the engine was constructed with.
//!
//! [`FrameSink`]: crate::relay::FrameSink

use crate::poll_set::PollSet;
use std::time::{Duration, Instant};

/// A user-space translation engine driven by [`PollLoop`](crate::PollLoop).
pub trait Engine {
    /// Register the engine's descriptors for the coming wait.
    ///
    /// Returns how long the engine can wait before its next timer, or
    /// `None` if it has no pending timer.
    fn fill_poll_set(&mut self, poll_set: &mut PollSet) -> Option<Duration>;

    /// Process one frame read from the interface.
    fn input(&mut self, frame: &[u8]);

    /// Act on the results of the last wait.
    ///
    /// With `only_timers` set, the engine must not look at socket readiness
    /// and only advances time-driven state.
    fn dispatch(&mut self, poll_set: &PollSet, only_timers: bool);
}

/// Periodic work that runs alongside the engine on the same loop.
pub trait Housekeeping {
    /// Time until the next check is due, `None` when nothing is scheduled.
    fn next_timeout(&self, now: Instant) -> Option<Duration>;

    /// Run whatever is due at `now`.
    fn check(&mut self, now: Instant);
}

impl<H: Housekeeping> Housekeeping for Option<H> {
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.as_ref().and_then(|h| h.next_timeout(now))
    }

    fn check(&mut self, now: Instant) {
        if let Some(h) = self {
            h.check(now);
        }
    }
}

/// Housekeeping that never schedules anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHousekeeping;

impl Housekeeping for NoHousekeeping {
    fn next_timeout(&self, _now: Instant) -> Option<Duration> {
        None
    }

    fn check(&mut self, _now: Instant) {}
}

/// The sooner of two optional deadlines.
pub fn earliest_deadline(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
