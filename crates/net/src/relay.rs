//! Single-frame transfer between the tap descriptor and the engine.

use std::os::fd::{AsRawFd, BorrowedFd};

/// Size of the scratch buffer used for reads from the tap descriptor.
///
/// Large enough for any Ethernet frame the interface can carry, whatever
/// MTU the caller configured.
pub const ETH_BUF_SIZE: usize = 65536;

/// Destination for frames produced by a translation engine.
///
/// Engines receive a sink when they are constructed and hand every
/// outbound frame to it. The sink is the only thing an engine knows about
/// the interface it is attached to.
pub trait FrameSink {
    /// Deliver one complete Ethernet frame.
    fn deliver(&mut self, frame: &[u8]);
}

impl FrameSink for Vec<Vec<u8>> {
    fn deliver(&mut self, frame: &[u8]) {
        self.push(frame.to_vec());
    }
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn deliver(&mut self, frame: &[u8]) {
        (**self).deliver(frame);
    }
}

/// Output capability writing frames to a tap descriptor.
///
/// Holds a borrowed descriptor only; the caller keeps ownership of the
/// interface and outlives every writer.
#[derive(Clone, Copy, Debug)]
pub struct TapWriter<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> TapWriter<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }
}

impl FrameSink for TapWriter<'_> {
    fn deliver(&mut self, frame: &[u8]) {
        let fd = self.fd;
        write_whole_frame(|buf| nix::unistd::write(fd, buf), frame);
    }
}

/// Write `frame` with a single call to `write`.
///
/// The interface is expected to take whole frames or fail outright, so a
/// failed or short write is an invariant violation and panics. Release
/// builds abort on panic.
pub fn write_whole_frame<W>(write: W, frame: &[u8])
where
    W: FnOnce(&[u8]) -> nix::Result<usize>,
{
    let written = match write(frame) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::error!(error = %e, len = frame.len(), "tap write failed");
            None
        }
    };
    assert_eq!(
        written,
        Some(frame.len()),
        "tap descriptor did not accept the whole frame"
    );
}

/// Read at most one frame from the tap descriptor into `buf`.
///
/// Returns the frame length, or `None` when the read failed; the failure
/// is logged and the caller drops that frame.
pub fn read_frame(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Option<usize> {
    match nix::unistd::read(fd.as_raw_fd(), buf) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "tap read failed, dropping frame");
            None
        }
    }
}
