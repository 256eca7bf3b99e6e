use nix::errno::Errno;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to allocate {0}-byte frame buffer")]
    Alloc(usize),

    #[error("poll failed: {0}")]
    Poll(Errno),

    #[error("helper process failed: {0}")]
    Helper(String),
}
