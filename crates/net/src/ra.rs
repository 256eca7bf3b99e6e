//! IPv6 router advertisements.
//!
//! The guest learns its prefix, MTU and DNS server from periodic
//! unsolicited advertisements and from answers to its router solicitations.

use crate::config::{EngineConfig, Ipv6Config};
use crate::engine::Housekeeping;
use crate::nat::icmp_checksum;
use crate::relay::FrameSink;
use rand::Rng;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;
const IPPROTO_ICMPV6: u8 = 58;

const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const ALL_NODES_MAC: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];

const CUR_HOP_LIMIT: u8 = 64;
const ROUTER_LIFETIME: u16 = 1800;
const PREFIX_VALID_LIFETIME: u32 = 86400;
const PREFIX_PREFERRED_LIFETIME: u32 = 14400;
const RDNSS_LIFETIME: u32 = 1200;
/// On-link and autonomous address-configuration flags.
const PREFIX_FLAGS: u8 = 0xC0;

const INITIAL_MAX_DELAY: Duration = Duration::from_secs(16);
const MIN_INTERVAL: Duration = Duration::from_secs(200);
const MAX_INTERVAL: Duration = Duration::from_secs(600);

const ETH_LEN: usize = 14;
const IPV6_LEN: usize = 40;
const RA_HEADER_LEN: usize = 16;
const SLLA_LEN: usize = 8;
const MTU_OPT_LEN: usize = 8;
const PREFIX_OPT_LEN: usize = 32;
const RDNSS_LEN: usize = 24;
const RA_LEN: usize = RA_HEADER_LEN + SLLA_LEN + MTU_OPT_LEN + PREFIX_OPT_LEN + RDNSS_LEN;

/// Build a complete Ethernet frame carrying a router advertisement to all
/// nodes.
pub fn build_router_advertisement(gateway_mac: [u8; 6], mtu: u32, ipv6: &Ipv6Config) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_LEN + IPV6_LEN + RA_LEN);

    // Ethernet
    frame.extend_from_slice(&ALL_NODES_MAC);
    frame.extend_from_slice(&gateway_mac);
    frame.extend_from_slice(&0x86DDu16.to_be_bytes());

    // IPv6
    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&(RA_LEN as u16).to_be_bytes());
    frame.push(IPPROTO_ICMPV6);
    frame.push(255);
    frame.extend_from_slice(&ipv6.link_local.octets());
    frame.extend_from_slice(&ALL_NODES.octets());

    let icmp_start = frame.len();

    // Router advertisement header
    frame.push(ICMPV6_ROUTER_ADVERTISEMENT);
    frame.push(0); // code
    frame.extend_from_slice(&[0, 0]); // checksum
    frame.push(CUR_HOP_LIMIT);
    frame.push(0); // flags
    frame.extend_from_slice(&ROUTER_LIFETIME.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // reachable time
    frame.extend_from_slice(&0u32.to_be_bytes()); // retrans timer

    // Source link-layer address
    frame.extend_from_slice(&[1, 1]);
    frame.extend_from_slice(&gateway_mac);

    // MTU
    frame.extend_from_slice(&[5, 1, 0, 0]);
    frame.extend_from_slice(&mtu.to_be_bytes());

    // Prefix information
    frame.extend_from_slice(&[3, 4, ipv6.prefix_len, PREFIX_FLAGS]);
    frame.extend_from_slice(&PREFIX_VALID_LIFETIME.to_be_bytes());
    frame.extend_from_slice(&PREFIX_PREFERRED_LIFETIME.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&ipv6.prefix.octets());

    // Recursive DNS server
    frame.extend_from_slice(&[25, 3, 0, 0]);
    frame.extend_from_slice(&RDNSS_LIFETIME.to_be_bytes());
    frame.extend_from_slice(&ipv6.dns.octets());

    let checksum = icmpv6_checksum(&ipv6.link_local, &ALL_NODES, &frame[icmp_start..]);
    frame[icmp_start + 2..icmp_start + 4].copy_from_slice(&checksum.to_be_bytes());

    frame
}

/// ICMPv6 checksum over the IPv6 pseudo-header and the message.
fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, message: &[u8]) -> u16 {
    let mut data = Vec::with_capacity(40 + message.len());
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
    data.extend_from_slice(&(message.len() as u32).to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, IPPROTO_ICMPV6]);
    data.extend_from_slice(message);
    icmp_checksum(&data)
}

/// Whether `frame` is an ICMPv6 router solicitation.
pub fn is_router_solicitation(frame: &[u8]) -> bool {
    frame.len() > ETH_LEN + IPV6_LEN
        && frame[12..14] == [0x86, 0xDD]
        && frame[ETH_LEN + 6] == IPPROTO_ICMPV6
        && frame[ETH_LEN + IPV6_LEN] == ICMPV6_ROUTER_SOLICITATION
}

/// Housekeeping subsystem sending unsolicited router advertisements.
pub struct RouterAdvertiser<S: FrameSink> {
    sink: S,
    frame: Vec<u8>,
    next_at: Instant,
}

impl<S: FrameSink> RouterAdvertiser<S> {
    /// Returns `None` when IPv6 is disabled in `config`.
    pub fn new(sink: S, config: &EngineConfig, now: Instant) -> Option<Self> {
        let ipv6 = config.ipv6.as_ref()?;
        let delay = rand::thread_rng().gen_range(Duration::ZERO..=INITIAL_MAX_DELAY);
        Some(Self {
            sink,
            frame: build_router_advertisement(config.gateway_mac, config.mtu, ipv6),
            next_at: now + delay,
        })
    }

    pub fn next_at(&self) -> Instant {
        self.next_at
    }
}

impl<S: FrameSink> Housekeeping for RouterAdvertiser<S> {
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        Some(self.next_at.saturating_duration_since(now))
    }

    fn check(&mut self, now: Instant) {
        if now < self.next_at {
            return;
        }
        tracing::debug!("sending router advertisement");
        self.sink.deliver(&self.frame);
        self.next_at = now + rand::thread_rng().gen_range(MIN_INTERVAL..=MAX_INTERVAL);
    }
}
