//! The bridge event loop.
//!
//! One thread, one blocking wait per iteration. The interface descriptor,
//! the optional exit descriptor and every host socket the engine manages
//! share the same poll set, and the wait timeout is the earliest deadline
//! requested by the engine or the housekeeping subsystem.

use crate::engine::{Engine, Housekeeping, earliest_deadline};
use crate::error::NetError;
use crate::poll_set::{EXIT_SLOT, PollSet, TAP_SLOT};
use crate::relay::{ETH_BUF_SIZE, read_frame};
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

pub struct PollLoop<'fd, E, H> {
    tap: BorrowedFd<'fd>,
    engine: E,
    housekeeping: H,
    poll_set: PollSet,
}

impl<'fd, E: Engine, H: Housekeeping> PollLoop<'fd, E, H> {
    /// Create a loop over `tap`, stopping when `exit` hangs up.
    ///
    /// Neither descriptor is closed by the loop.
    pub fn new(
        tap: BorrowedFd<'fd>,
        exit: Option<BorrowedFd<'fd>>,
        engine: E,
        housekeeping: H,
    ) -> Self {
        Self {
            tap,
            engine,
            housekeeping,
            poll_set: PollSet::new(tap, exit),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run until the exit descriptor hangs up or the wait fails.
    pub fn run(&mut self) -> Result<(), NetError> {
        let result = self.run_inner();
        tracing::info!(ok = result.is_ok(), "bridge loop is exiting");
        result
    }

    fn run_inner(&mut self) -> Result<(), NetError> {
        let mut scratch = Vec::new();
        if scratch.try_reserve_exact(ETH_BUF_SIZE).is_err() {
            tracing::error!(size = ETH_BUF_SIZE, "failed to allocate frame buffer");
            return Err(NetError::Alloc(ETH_BUF_SIZE));
        }
        scratch.resize(ETH_BUF_SIZE, 0);

        tracing::debug!(
            exit_slot = self.poll_set.has_exit_slot(),
            "bridge loop started"
        );

        loop {
            let timeout = self.prepare(Instant::now());

            let ready = match self.poll_set.wait(timeout) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    return Err(NetError::Poll(e));
                }
            };

            let mut only_timers = ready == 0;

            if !self.poll_set.revents(TAP_SLOT).is_empty() {
                if let Some(n) = read_frame(self.tap, &mut scratch) {
                    self.engine.input(&scratch[..n]);
                }
                only_timers = true;
            }

            if self.poll_set.has_exit_slot() && !self.poll_set.revents(EXIT_SLOT).is_empty() {
                tracing::info!("exit descriptor event");
                return Ok(());
            }

            self.engine.dispatch(&self.poll_set, only_timers);
            self.housekeeping.check(Instant::now());
        }
    }

    /// Rebuild the engine tail and compute the timeout for the next wait.
    fn prepare(&mut self, now: Instant) -> Option<Duration> {
        self.poll_set.truncate_to_prefix();
        let engine_timeout = self.engine.fill_poll_set(&mut self.poll_set);
        earliest_deadline(engine_timeout, self.housekeeping.next_timeout(now))
    }
}
