//! User-space bridge between a tap interface and a NAT engine.
//!
//! [`PollLoop`] multiplexes the tap descriptor, an optional exit descriptor
//! and the engine's host sockets on a single thread. [`UserNatEngine`] is the
//! bundled engine: a smoltcp interface with DHCP, DNS forwarding and TCP/UDP/
//! ICMP NAT through unprivileged host sockets.

mod bridge;
mod config;
mod device;
mod dhcp;
mod dns;
mod engine;
mod error;
mod helper;
mod nat;
mod poll_loop;
mod poll_set;
mod ra;
mod relay;
mod stack;
mod tap;

pub use bridge::{Backend, run_bridge};
pub use config::{DEFAULT_MTU, EngineConfig, Ipv6Config, MAX_MTU, MIN_MTU};
pub use device::EngineDevice;
pub use dhcp::DhcpServer;
pub use dns::{DnsError, DnsForwarder, DnsReply};
pub use engine::{Engine, Housekeeping, NoHousekeeping, earliest_deadline};
pub use error::NetError;
pub use helper::{helper_args, run_helper};
pub use nat::{NatTable, tcp_mss};
pub use poll_loop::PollLoop;
pub use poll_set::{EXIT_SLOT, PollSet, PollToken, TAP_SLOT, timeout_millis};
pub use ra::{RouterAdvertiser, build_router_advertisement, is_router_solicitation};
pub use relay::{ETH_BUF_SIZE, FrameSink, TapWriter, read_frame, write_whole_frame};
pub use stack::UserNatEngine;
pub use tap::open_tap;
