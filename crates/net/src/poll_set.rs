//! Descriptor set handed to `poll(2)` on every loop iteration.
//!
//! The set has two parts: a fixed prefix (the tap descriptor and, when
//! configured, the exit descriptor) whose slots never move, and a tail the
//! engine refills on each iteration.

use nix::errno::Errno;
use nix::poll::PollFlags;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

/// Slot of the tap descriptor.
pub const TAP_SLOT: PollToken = PollToken(0);

/// Slot of the exit descriptor, when one is configured.
pub const EXIT_SLOT: PollToken = PollToken(1);

/// Position of a descriptor in the poll set.
///
/// Tokens handed out for the engine tail are only meaningful until the
/// set is truncated at the start of the next iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PollToken(usize);

impl PollToken {
    pub fn index(self) -> usize {
        self.0
    }
}

pub struct PollSet {
    fds: Vec<libc::pollfd>,
    prefix_len: usize,
}

impl PollSet {
    /// Build the fixed prefix: the tap slot and the optional exit slot.
    pub fn new(tap: BorrowedFd<'_>, exit: Option<BorrowedFd<'_>>) -> Self {
        let mut fds = vec![pollfd(tap, PollFlags::POLLIN | PollFlags::POLLHUP)];
        if let Some(exit) = exit {
            fds.push(pollfd(exit, PollFlags::POLLHUP));
        }
        let prefix_len = fds.len();
        Self { fds, prefix_len }
    }

    /// Number of fixed slots (1 or 2).
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn has_exit_slot(&self) -> bool {
        self.prefix_len > 1
    }

    /// Drop the engine-owned tail from the previous iteration.
    pub fn truncate_to_prefix(&mut self) {
        self.fds.truncate(self.prefix_len);
        for slot in &mut self.fds {
            slot.revents = 0;
        }
    }

    /// Append a descriptor to the engine tail.
    pub fn register(&mut self, fd: impl AsFd, events: PollFlags) -> PollToken {
        let token = PollToken(self.fds.len());
        self.fds.push(pollfd(fd.as_fd(), events));
        token
    }

    /// Events reported for `token` by the last wait.
    pub fn revents(&self, token: PollToken) -> PollFlags {
        self.fds
            .get(token.0)
            .map(|slot| PollFlags::from_bits_truncate(slot.revents))
            .unwrap_or_else(PollFlags::empty)
    }

    /// Block until a descriptor is ready or `timeout` elapses.
    ///
    /// Returns the number of descriptors with events. `EINTR` is retried
    /// with the same timeout; any other failure is returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<usize, Errno> {
        let timeout_ms = timeout_millis(timeout);
        loop {
            // SAFETY: the pointer and length describe the live `fds` vector,
            // which is not touched until poll returns. Every descriptor in it
            // is borrowed for the current iteration, so none has been closed.
            let n = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(e),
            }
        }
    }
}

fn pollfd(fd: BorrowedFd<'_>, events: PollFlags) -> libc::pollfd {
    libc::pollfd {
        fd: fd.as_raw_fd(),
        events: events.bits(),
        revents: 0,
    }
}

/// Convert a deadline into a `poll(2)` timeout.
///
/// Partial milliseconds round up so a pending timer never turns into a
/// zero-timeout spin. `None` blocks indefinitely.
pub fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}
