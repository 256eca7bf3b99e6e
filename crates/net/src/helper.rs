//! Running the network through an external helper instead of the embedded
//! engine.
//!
//! The helper gets the tap descriptor and runs its own user-mode network on
//! it. We only supervise: the helper dies with us, and we kill it when the
//! exit descriptor hangs up.

use crate::error::NetError;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::Signal;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

/// Arguments handed to the helper for a tap descriptor number.
pub fn helper_args(tap_fd: i32) -> Vec<String> {
    vec![
        "-M".to_string(),
        "none".to_string(),
        "-nographic".to_string(),
        "-net".to_string(),
        format!("tap,fd={tap_fd}"),
        "-net".to_string(),
        "user".to_string(),
    ]
}

/// Run `program` on `tap` until `exit` hangs up, or until the helper exits
/// when there is no exit descriptor.
pub fn run_helper(
    program: &Path,
    tap: BorrowedFd<'_>,
    exit: Option<BorrowedFd<'_>>,
) -> Result<(), NetError> {
    let mut child = spawn_helper(program, tap)?;

    let Some(exit) = exit else {
        let status = child.wait()?;
        tracing::info!(%status, "helper exited");
        return if status.success() {
            Ok(())
        } else {
            Err(NetError::Helper(format!(
                "{} exited with {status}",
                program.display()
            )))
        };
    };

    let waited = wait_for_hangup(exit);
    tracing::info!("exit descriptor event");

    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "helper already gone");
    }
    let status = child.wait()?;
    tracing::debug!(%status, "helper reaped");

    waited
}

fn spawn_helper(program: &Path, tap: BorrowedFd<'_>) -> Result<Child, NetError> {
    let tap_fd = tap.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(helper_args(tap_fd));

    // SAFETY: pre_exec runs after fork() but before exec() in the child process.
    // 1. tap_fd is valid because the caller's borrow outlives spawn()
    // 2. fcntl and prctl are async-signal-safe
    // 3. Clearing FD_CLOEXEC only affects the child's copy of the descriptor
    unsafe {
        cmd.pre_exec(move || {
            fcntl(tap_fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| NetError::Helper(format!("failed to spawn {}: {e}", program.display())))?;
    tracing::info!(program = %program.display(), pid = child.id(), tap_fd, "spawned helper");
    Ok(child)
}

/// Block until `exit` reaches end of stream.
fn wait_for_hangup(exit: BorrowedFd<'_>) -> Result<(), NetError> {
    let mut buf = [0u8; 64];
    loop {
        match nix::unistd::read(exit.as_raw_fd(), &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(NetError::Io(e.into())),
        }
    }
}
