use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

const TUN_CLONE_DEVICE: &str = "/dev/net/tun";

/// `_IOW('T', 202, int)`
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Open (creating if needed) the tap interface `name`.
///
/// The descriptor carries raw Ethernet frames without packet information
/// headers and stays in blocking mode. The interface is owned by the
/// returned descriptor's lifetime unless it was made persistent elsewhere.
pub fn open_tap(name: &str) -> io::Result<OwnedFd> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name {name:?}"),
        ));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_CLONE_DEVICE)?;

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    // SAFETY: the descriptor is open for the duration of the call and ifr
    // is a properly initialized ifreq that outlives it.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    tracing::debug!(name, "opened tap interface");
    Ok(file.into())
}
