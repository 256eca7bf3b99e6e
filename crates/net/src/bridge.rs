//! Wiring the user-mode NAT engine to a tap descriptor.
//!
//! The writer, the engine and the router advertiser all share the same
//! borrowed tap descriptor; the loop reads from it and the other two write
//! to it through [`TapWriter`].

use crate::config::EngineConfig;
use crate::error::NetError;
use crate::helper::run_helper;
use crate::poll_loop::PollLoop;
use crate::ra::RouterAdvertiser;
use crate::relay::TapWriter;
use crate::stack::UserNatEngine;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::time::Instant;

/// Run the bridge between `tap` and a fresh user-mode NAT engine until
/// `exit` hangs up.
///
/// Without an exit descriptor this only returns on a fatal error.
pub fn run_bridge(
    tap: BorrowedFd<'_>,
    exit: Option<BorrowedFd<'_>>,
    config: &EngineConfig,
) -> Result<(), NetError> {
    let writer = TapWriter::new(tap);

    let engine = match UserNatEngine::new(writer, config.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "engine construction failed");
            return Err(e);
        }
    };
    let advertiser = RouterAdvertiser::new(writer, config, Instant::now());

    PollLoop::new(tap, exit, engine, advertiser).run()
}

/// Which network runs behind the tap descriptor.
#[derive(Clone, Debug)]
pub enum Backend {
    /// The embedded engine driven by the poll loop
    UserNat(EngineConfig),
    /// An external program handed the tap descriptor
    Helper { program: PathBuf },
}

impl Backend {
    pub fn run(&self, tap: BorrowedFd<'_>, exit: Option<BorrowedFd<'_>>) -> Result<(), NetError> {
        match self {
            Backend::UserNat(config) => run_bridge(tap, exit, config),
            Backend::Helper { program } => run_helper(program, tap, exit),
        }
    }
}
