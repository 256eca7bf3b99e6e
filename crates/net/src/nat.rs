//! NAT connection tracking and packet forwarding.
//!
//! Frames from the guest addressed outside the virtual network (or to the
//! gateway, when host loopback is enabled) are relayed through non-blocking
//! host sockets. Every host socket joins the loop's poll set, and replies
//! are crafted back into Ethernet frames for the guest.

use crate::poll_set::{PollSet, PollToken};
use crate::relay::FrameSink;

use nix::poll::PollFlags;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4Packet, Icmpv4Repr,
    IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket,
    UdpRepr,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const ICMP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Host socket limits. New flows beyond these are refused.
const MAX_TCP_CONNECTIONS: usize = 1024;
const MAX_UDP_BINDINGS: usize = 256;
const MAX_ICMP_BINDINGS_PER_GUEST: usize = 64;

const ETH_HEADER_SIZE: usize = 14;
const IP_HEADER_SIZE: usize = 20;
const TCP_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;
const ICMP_HEADER_SIZE: usize = 8;

/// Guest data held for a host socket that is not draining. Segments beyond
/// this are dropped unacknowledged and the guest retransmits them.
const MAX_PENDING_TO_HOST: usize = 256 * 1024;

/// Retransmission timeout for data sent to the guest, doubled on every
/// expiry up to the maximum.
const INITIAL_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(60);

/// Duplicate ACKs that trigger a fast retransmit.
const DUP_ACK_THRESHOLD: u8 = 3;

/// Datagrams drained from one socket per wakeup.
const MAX_RECV_PER_WAKEUP: usize = 16;

const RECV_BUF_SIZE: usize = 65536;

/// TCP maximum segment size for an interface MTU.
pub fn tcp_mss(mtu: u32) -> usize {
    (mtu as usize)
        .saturating_sub(IP_HEADER_SIZE + TCP_HEADER_SIZE)
        .max(1)
}

/// Tracks guest flows and the host sockets relaying them.
pub struct NatTable {
    udp_bindings: HashMap<UdpKey, DatagramEntry>,
    icmp_bindings: HashMap<IcmpKey, DatagramEntry>,
    tcp_connections: HashMap<TcpKey, TcpNatEntry>,
    gateway_ip: Ipv4Addr,
    gateway_mac: EthernetAddress,
    mtu: usize,
    mss: usize,
    recv_buf: Vec<u8>,
}

/// One host UDP socket per guest source address, shared by every
/// destination that source talks to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct UdpKey {
    guest_addr: SocketAddrV4,
}

/// Echo requests are tracked by guest and identifier. The host socket is an
/// unprivileged `SOCK_DGRAM`/`IPPROTO_ICMP` socket, which std exposes as a
/// `UdpSocket`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct IcmpKey {
    guest_ip: Ipv4Addr,
    identifier: u16,
}

struct DatagramEntry {
    socket: UdpSocket,
    guest_mac: EthernetAddress,
    token: Option<PollToken>,
    last_activity: Instant,
}

impl DatagramEntry {
    fn new(socket: UdpSocket, guest_mac: EthernetAddress) -> Self {
        Self {
            socket,
            guest_mac,
            token: None,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self, guest_mac: EthernetAddress) {
        self.guest_mac = guest_mac;
        self.last_activity = Instant::now();
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct TcpKey {
    guest_addr: SocketAddrV4,
    /// Destination as the guest sees it
    remote_addr: SocketAddrV4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TcpState {
    /// Guest SYN seen, host connect in progress
    Connecting,
    /// SYN-ACK sent, waiting for the guest's ACK
    SynReceived,
    Established,
}

struct TcpNatEntry {
    stream: TcpStream,
    state: TcpState,
    guest_mac: EthernetAddress,
    /// Next sequence number we send to the guest
    our_seq: u32,
    /// Oldest sequence number the guest has not acknowledged
    guest_acked: u32,
    /// Receive window last advertised by the guest (never scaled: our
    /// SYN-ACK carries no window scale option)
    guest_window: u32,
    /// Host data sent to the guest and not yet acknowledged, starting at
    /// `guest_acked`
    to_guest: Vec<u8>,
    dup_acks: u8,
    rto: Duration,
    retransmit_at: Option<Instant>,
    /// Next sequence number expected from the guest
    guest_next_seq: u32,
    /// Guest data not yet accepted by the host socket
    to_host: Vec<u8>,
    guest_fin: bool,
    /// Host write side shut down after the guest's FIN was flushed
    host_write_shut: bool,
    /// Host reached end of stream and a FIN went to the guest
    host_eof: bool,
    token: Option<PollToken>,
    last_activity: Instant,
}

impl NatTable {
    pub fn new(gateway_ip: Ipv4Addr, gateway_mac: [u8; 6], mtu: u32) -> Self {
        Self {
            udp_bindings: HashMap::new(),
            icmp_bindings: HashMap::new(),
            tcp_connections: HashMap::new(),
            gateway_ip,
            gateway_mac: EthernetAddress(gateway_mac),
            mtu: mtu as usize,
            mss: tcp_mss(mtu),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        }
    }

    /// Number of tracked UDP, TCP and ICMP entries.
    pub fn len(&self) -> usize {
        self.udp_bindings.len() + self.tcp_connections.len() + self.icmp_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relay a guest frame to the host.
    ///
    /// Returns false if the frame is not IPv4 TCP, UDP or ICMP echo, or if
    /// no host socket could take it.
    pub fn process_frame<S: FrameSink + ?Sized>(&mut self, frame: &[u8], out: &mut S) -> bool {
        let Ok(eth_frame) = EthernetFrame::new_checked(frame) else {
            return false;
        };
        if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
            return false;
        }
        let Ok(ip_packet) = Ipv4Packet::new_checked(eth_frame.payload()) else {
            return false;
        };

        let guest_mac = eth_frame.src_addr();
        match ip_packet.next_header() {
            IpProtocol::Udp => self.handle_udp(guest_mac, &ip_packet),
            IpProtocol::Tcp => self.handle_tcp(guest_mac, &ip_packet, out),
            IpProtocol::Icmp => self.handle_icmp(guest_mac, &ip_packet),
            _ => false,
        }
    }

    /// Register every host socket that needs attention in the poll set.
    pub fn fill_poll_set(&mut self, poll_set: &mut PollSet) {
        for entry in self
            .udp_bindings
            .values_mut()
            .chain(self.icmp_bindings.values_mut())
        {
            entry.token = Some(poll_set.register(&entry.socket, PollFlags::POLLIN));
        }
        for entry in self.tcp_connections.values_mut() {
            let events = entry.interest();
            entry.token = (!events.is_empty()).then(|| poll_set.register(&entry.stream, events));
        }
    }

    /// Service host sockets reported ready by the last wait.
    pub fn dispatch<S: FrameSink + ?Sized>(&mut self, poll_set: &PollSet, out: &mut S) {
        for key in ready_keys(&self.udp_bindings, poll_set) {
            self.udp_ready(key, out);
        }
        for key in ready_keys(&self.icmp_bindings, poll_set) {
            self.icmp_ready(key, out);
        }

        let ready_tcp: Vec<(TcpKey, PollFlags)> = self
            .tcp_connections
            .iter()
            .filter_map(|(key, entry)| Some((*key, poll_set.revents(entry.token?))))
            .filter(|(_, revents)| !revents.is_empty())
            .collect();
        for (key, revents) in ready_tcp {
            self.tcp_ready(key, revents, out);
        }
    }

    /// Time until the earliest TCP retransmission or window check is due.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.tcp_connections
            .values()
            .filter_map(|entry| entry.retransmit_at)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    /// Run the TCP retransmissions and closed-window checks that are due.
    pub fn run_timers<S: FrameSink + ?Sized>(&mut self, now: Instant, out: &mut S) {
        let mss = self.mss;
        let gateway_mac = self.gateway_mac;
        for (key, entry) in self.tcp_connections.iter_mut() {
            if entry.retransmit_at.is_some_and(|at| at <= now) {
                entry.on_retransmit_timer(key, mss, now, gateway_mac, out);
            }
        }
    }

    /// Drop entries idle past their protocol's timeout. Dropping an entry
    /// closes its host socket.
    pub fn cleanup(&mut self, now: Instant) {
        let before = self.len();
        self.udp_bindings
            .retain(|_, entry| is_live(entry.last_activity, now, UDP_IDLE_TIMEOUT));
        self.icmp_bindings
            .retain(|_, entry| is_live(entry.last_activity, now, ICMP_IDLE_TIMEOUT));
        self.tcp_connections.retain(|key, entry| {
            let live = is_live(entry.last_activity, now, TCP_IDLE_TIMEOUT);
            if !live {
                tracing::debug!(
                    guest = %key.guest_addr,
                    remote = %key.remote_addr,
                    "nat: dropping idle TCP connection"
                );
            }
            live
        });

        let expired = before - self.len();
        if expired > 0 {
            tracing::debug!(expired, remaining = self.len(), "nat: expired idle entries");
        }
    }

    /// Where the host socket actually connects: the gateway stands for the
    /// host's loopback interface.
    fn host_target(&self, remote: SocketAddrV4) -> SocketAddrV4 {
        if *remote.ip() == self.gateway_ip {
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, remote.port())
        } else {
            remote
        }
    }

    fn handle_tcp<S: FrameSink + ?Sized>(
        &mut self,
        guest_mac: EthernetAddress,
        ip_packet: &Ipv4Packet<&[u8]>,
        out: &mut S,
    ) -> bool {
        let Ok(tcp_packet) = TcpPacket::new_checked(ip_packet.payload()) else {
            return false;
        };

        let key = TcpKey {
            guest_addr: SocketAddrV4::new(ip_packet.src_addr(), tcp_packet.src_port()),
            remote_addr: SocketAddrV4::new(ip_packet.dst_addr(), tcp_packet.dst_port()),
        };
        let seq = tcp_packet.seq_number().0 as u32;

        if tcp_packet.rst() {
            if self.tcp_connections.remove(&key).is_some() {
                tracing::debug!(
                    guest = %key.guest_addr,
                    remote = %key.remote_addr,
                    "nat: guest reset TCP connection"
                );
            }
            return true;
        }

        if tcp_packet.syn() && !tcp_packet.ack() {
            let window = u32::from(tcp_packet.window_len());
            self.handle_tcp_syn(key, guest_mac, seq, window, out);
            return true;
        }

        let gateway_mac = self.gateway_mac;
        let mss = self.mss;
        let Some(entry) = self.tcp_connections.get_mut(&key) else {
            // Late segment for a connection that is already gone
            tracing::trace!(
                guest = %key.guest_addr,
                remote = %key.remote_addr,
                "nat: TCP segment without connection"
            );
            return true;
        };
        entry.last_activity = Instant::now();

        match entry.state {
            TcpState::Connecting => return true,
            TcpState::SynReceived => {
                if !tcp_packet.ack() || tcp_packet.ack_number().0 as u32 != entry.our_seq {
                    return true;
                }
                entry.state = TcpState::Established;
                tracing::debug!(
                    guest = %key.guest_addr,
                    remote = %key.remote_addr,
                    "nat: TCP connection established"
                );
            }
            TcpState::Established => {}
        }

        let payload = tcp_packet.payload();
        let pure_ack = payload.is_empty() && !tcp_packet.fin();
        if tcp_packet.ack() {
            let now = Instant::now();
            let ack = tcp_packet.ack_number().0 as u32;
            let window = u32::from(tcp_packet.window_len());
            if entry.on_guest_ack(ack, window, pure_ack, now) {
                entry.resend(&key, mss, mss, gateway_mac, out);
            }
        }

        if pure_ack {
            if entry.finished() {
                self.tcp_connections.remove(&key);
            }
            return true;
        }

        if seq != entry.guest_next_seq || entry.guest_fin {
            // Out of order or retransmitted: repeat what we expect next
            entry.send(&key, TcpControl::None, &[], gateway_mac, out);
            return true;
        }

        if entry.to_host.len() + payload.len() > MAX_PENDING_TO_HOST {
            tracing::debug!(
                remote = %key.remote_addr,
                bytes = payload.len(),
                "nat: host not draining, dropping segment"
            );
            return true;
        }

        entry.to_host.extend_from_slice(payload);
        entry.guest_next_seq = entry.guest_next_seq.wrapping_add(payload.len() as u32);
        if tcp_packet.fin() {
            entry.guest_next_seq = entry.guest_next_seq.wrapping_add(1);
            entry.guest_fin = true;
        }

        let close = match entry.flush_to_host() {
            Ok(()) => {
                entry.send(&key, TcpControl::None, &[], gateway_mac, out);
                entry.finished()
            }
            Err(e) => {
                tracing::debug!(
                    remote = %key.remote_addr,
                    error = %e,
                    "nat: TCP write to host failed"
                );
                entry.send(&key, TcpControl::Rst, &[], gateway_mac, out);
                true
            }
        };

        if close {
            self.tcp_connections.remove(&key);
        }
        true
    }

    fn handle_tcp_syn<S: FrameSink + ?Sized>(
        &mut self,
        key: TcpKey,
        guest_mac: EthernetAddress,
        guest_isn: u32,
        guest_window: u32,
        out: &mut S,
    ) {
        if let Some(entry) = self.tcp_connections.get(&key) {
            // Retransmitted SYN: repeat the SYN-ACK if one already went out
            if entry.state == TcpState::SynReceived {
                if let Some(frame) = craft_tcp_syn_ack(
                    key.remote_addr,
                    key.guest_addr,
                    entry.our_seq.wrapping_sub(1),
                    entry.guest_next_seq,
                    self.mss,
                    self.gateway_mac,
                    entry.guest_mac,
                ) {
                    out.deliver(&frame);
                }
            }
            return;
        }

        if self.tcp_connections.len() >= MAX_TCP_CONNECTIONS {
            tracing::warn!(
                limit = MAX_TCP_CONNECTIONS,
                guest = %key.guest_addr,
                remote = %key.remote_addr,
                "nat: TCP connection limit reached"
            );
            self.reject_syn(&key, guest_isn, guest_mac, out);
            return;
        }

        let target = self.host_target(key.remote_addr);
        let stream = match connect_nonblocking(target) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(host = %target, error = %e, "nat: TCP connect failed");
                self.reject_syn(&key, guest_isn, guest_mac, out);
                return;
            }
        };
        tracing::debug!(guest = %key.guest_addr, host = %target, "nat: TCP connecting");

        let isn: u32 = rand::random();
        self.tcp_connections.insert(
            key,
            TcpNatEntry {
                stream,
                state: TcpState::Connecting,
                guest_mac,
                our_seq: isn,
                guest_acked: isn,
                guest_window,
                to_guest: Vec::new(),
                dup_acks: 0,
                rto: INITIAL_RTO,
                retransmit_at: None,
                guest_next_seq: guest_isn.wrapping_add(1),
                to_host: Vec::new(),
                guest_fin: false,
                host_write_shut: false,
                host_eof: false,
                token: None,
                last_activity: Instant::now(),
            },
        );
    }

    fn reject_syn<S: FrameSink + ?Sized>(
        &self,
        key: &TcpKey,
        guest_isn: u32,
        guest_mac: EthernetAddress,
        out: &mut S,
    ) {
        if let Some(frame) = craft_tcp_rst(
            key.remote_addr,
            key.guest_addr,
            0,
            guest_isn.wrapping_add(1),
            self.gateway_mac,
            guest_mac,
        ) {
            out.deliver(&frame);
        }
    }

    fn tcp_ready<S: FrameSink + ?Sized>(&mut self, key: TcpKey, revents: PollFlags, out: &mut S) {
        let gateway_mac = self.gateway_mac;
        let mss = self.mss;
        let Some(entry) = self.tcp_connections.get_mut(&key) else {
            return;
        };
        entry.last_activity = Instant::now();

        let close = match entry.state {
            TcpState::Connecting => match entry.connect_result() {
                Ok(()) => {
                    if let Some(frame) = craft_tcp_syn_ack(
                        key.remote_addr,
                        key.guest_addr,
                        entry.our_seq,
                        entry.guest_next_seq,
                        mss,
                        gateway_mac,
                        entry.guest_mac,
                    ) {
                        out.deliver(&frame);
                    }
                    entry.our_seq = entry.our_seq.wrapping_add(1);
                    entry.state = TcpState::SynReceived;
                    false
                }
                Err(e) => {
                    tracing::debug!(
                        remote = %key.remote_addr,
                        error = %e,
                        "nat: TCP connect failed"
                    );
                    if let Some(frame) = craft_tcp_rst(
                        key.remote_addr,
                        key.guest_addr,
                        0,
                        entry.guest_next_seq,
                        gateway_mac,
                        entry.guest_mac,
                    ) {
                        out.deliver(&frame);
                    }
                    true
                }
            },
            TcpState::SynReceived | TcpState::Established => {
                let mut result = Ok(());
                if revents.contains(PollFlags::POLLOUT) && !entry.to_host.is_empty() {
                    result = entry.flush_to_host();
                }
                let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                if result.is_ok()
                    && entry.state == TcpState::Established
                    && !entry.host_eof
                    && revents.intersects(readable)
                {
                    result = entry.read_from_host(
                        &key,
                        &mut self.recv_buf,
                        mss,
                        Instant::now(),
                        gateway_mac,
                        out,
                    );
                }
                match result {
                    Ok(()) => entry.finished(),
                    Err(e) => {
                        tracing::debug!(
                            remote = %key.remote_addr,
                            error = %e,
                            "nat: TCP host socket error"
                        );
                        entry.send(&key, TcpControl::Rst, &[], gateway_mac, out);
                        true
                    }
                }
            }
        };

        if close {
            tracing::debug!(
                guest = %key.guest_addr,
                remote = %key.remote_addr,
                "nat: TCP connection closed"
            );
            self.tcp_connections.remove(&key);
        }
    }

    fn handle_udp(&mut self, guest_mac: EthernetAddress, ip_packet: &Ipv4Packet<&[u8]>) -> bool {
        let Ok(udp_packet) = UdpPacket::new_checked(ip_packet.payload()) else {
            return false;
        };

        let src = SocketAddrV4::new(ip_packet.src_addr(), udp_packet.src_port());
        let dst = SocketAddrV4::new(ip_packet.dst_addr(), udp_packet.dst_port());
        let target = self.host_target(dst);
        let full = self.udp_bindings.len() >= MAX_UDP_BINDINGS;

        let entry = match self.udp_bindings.entry(UdpKey { guest_addr: src }) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(_) if full => {
                tracing::warn!(
                    limit = MAX_UDP_BINDINGS,
                    guest = %src,
                    "nat: UDP binding limit reached"
                );
                return false;
            }
            Entry::Vacant(slot) => match bind_udp() {
                Ok(socket) => slot.insert(DatagramEntry::new(socket, guest_mac)),
                Err(e) => {
                    tracing::warn!(error = %e, "nat: UDP bind failed");
                    return false;
                }
            },
        };
        entry.touch(guest_mac);

        let payload = udp_packet.payload();
        match entry.socket.send_to(payload, target) {
            Ok(_) => {
                tracing::trace!(
                    guest = %src,
                    host = %target,
                    bytes = payload.len(),
                    "nat: UDP out"
                );
                true
            }
            Err(e) => {
                tracing::debug!(host = %target, error = %e, "nat: UDP send failed");
                false
            }
        }
    }

    fn udp_ready<S: FrameSink + ?Sized>(&mut self, key: UdpKey, out: &mut S) {
        let max_payload = self.mtu.saturating_sub(IP_HEADER_SIZE + UDP_HEADER_SIZE);
        let Some(entry) = self.udp_bindings.get_mut(&key) else {
            return;
        };

        for _ in 0..MAX_RECV_PER_WAKEUP {
            let (len, remote) = match entry.socket.recv_from(&mut self.recv_buf) {
                Ok((len, SocketAddr::V4(remote))) => (len, remote),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(guest = %key.guest_addr, error = %e, "nat: UDP recv failed");
                    break;
                }
            };
            entry.last_activity = Instant::now();

            if len > max_payload {
                tracing::debug!(
                    host = %remote,
                    bytes = len,
                    "nat: UDP reply exceeds MTU, dropping"
                );
                continue;
            }

            if let Some(frame) = craft_udp_frame(
                &self.recv_buf[..len],
                guest_visible(self.gateway_ip, remote),
                key.guest_addr,
                self.gateway_mac,
                entry.guest_mac,
            ) {
                out.deliver(&frame);
            }
        }
    }

    fn handle_icmp(&mut self, guest_mac: EthernetAddress, ip_packet: &Ipv4Packet<&[u8]>) -> bool {
        let Ok(icmp_packet) = Icmpv4Packet::new_checked(ip_packet.payload()) else {
            return false;
        };
        let Ok(Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        }) = Icmpv4Repr::parse(&icmp_packet, &ChecksumCapabilities::default())
        else {
            return false;
        };

        let guest_ip = ip_packet.src_addr();
        let dst_ip = ip_packet.dst_addr();
        let full = self
            .icmp_bindings
            .keys()
            .filter(|k| k.guest_ip == guest_ip)
            .count()
            >= MAX_ICMP_BINDINGS_PER_GUEST;

        let key = IcmpKey {
            guest_ip,
            identifier: ident,
        };
        let entry = match self.icmp_bindings.entry(key) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(_) if full => {
                tracing::warn!(
                    limit = MAX_ICMP_BINDINGS_PER_GUEST,
                    guest = %guest_ip,
                    "nat: ICMP binding limit reached"
                );
                return false;
            }
            Entry::Vacant(slot) => match icmp_socket() {
                Ok(socket) => slot.insert(DatagramEntry::new(socket, guest_mac)),
                Err(e) => {
                    tracing::warn!(error = %e, "nat: ICMP socket unavailable");
                    return false;
                }
            },
        };
        entry.touch(guest_mac);

        let request = Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        };
        let mut message = vec![0u8; request.buffer_len()];
        request.emit(
            &mut Icmpv4Packet::new_unchecked(&mut message[..]),
            &ChecksumCapabilities::default(),
        );

        match entry.socket.send_to(&message, SocketAddr::new(IpAddr::V4(dst_ip), 0)) {
            Ok(_) => {
                tracing::trace!(
                    guest = %guest_ip,
                    host = %dst_ip,
                    ident,
                    seq_no,
                    "nat: ICMP echo out"
                );
                true
            }
            Err(e) => {
                tracing::debug!(host = %dst_ip, error = %e, "nat: ICMP send failed");
                false
            }
        }
    }

    fn icmp_ready<S: FrameSink + ?Sized>(&mut self, key: IcmpKey, out: &mut S) {
        let mtu = self.mtu;
        let Some(entry) = self.icmp_bindings.get_mut(&key) else {
            return;
        };

        for _ in 0..MAX_RECV_PER_WAKEUP {
            let buf = &mut self.recv_buf;
            let (len, remote_ip) = match entry.socket.recv_from(buf) {
                Ok((len, SocketAddr::V4(remote))) => (len, *remote.ip()),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(guest = %key.guest_ip, error = %e, "nat: ICMP recv failed");
                    break;
                }
            };
            entry.last_activity = Instant::now();

            // Some kernels prepend the IPv4 header to datagram ICMP reads
            let icmp_data = if len > IP_HEADER_SIZE && buf[0] >> 4 == 4 {
                let header_len = usize::from(buf[0] & 0x0f) * 4;
                if len <= header_len {
                    continue;
                }
                &buf[header_len..len]
            } else {
                &buf[..len]
            };

            if IP_HEADER_SIZE + icmp_data.len() > mtu {
                continue;
            }

            if let Some(frame) = craft_icmp_echo_reply(
                remote_ip,
                key.guest_ip,
                key.identifier,
                icmp_data,
                self.gateway_mac,
                entry.guest_mac,
            ) {
                out.deliver(&frame);
            }
        }
    }
}

impl TcpNatEntry {
    fn interest(&self) -> PollFlags {
        match self.state {
            TcpState::Connecting => PollFlags::POLLOUT,
            TcpState::SynReceived | TcpState::Established => {
                let mut events = PollFlags::empty();
                if self.state == TcpState::Established && !self.host_eof && self.send_room() > 0 {
                    events |= PollFlags::POLLIN;
                }
                if !self.to_host.is_empty() {
                    events |= PollFlags::POLLOUT;
                }
                events
            }
        }
    }

    fn connect_result(&self) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        self.stream.peer_addr().map(|_| ())
    }

    /// Write as much pending guest data as the host socket takes, then
    /// half-close once the guest's FIN has been flushed.
    fn flush_to_host(&mut self) -> io::Result<()> {
        while !self.to_host.is_empty() {
            match (&self.stream).write(&self.to_host) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.to_host.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.to_host.is_empty() && self.guest_fin && !self.host_write_shut {
            self.stream.shutdown(Shutdown::Write)?;
            self.host_write_shut = true;
        }
        Ok(())
    }

    /// Sequence space sent to the guest and not yet acknowledged.
    fn in_flight(&self) -> u32 {
        self.our_seq.wrapping_sub(self.guest_acked)
    }

    /// Bytes the guest's window still accepts.
    fn send_room(&self) -> usize {
        self.guest_window.saturating_sub(self.in_flight()) as usize
    }

    /// Read host data that fits in the guest's window and send it on.
    /// End of stream turns into a FIN.
    fn read_from_host<S: FrameSink + ?Sized>(
        &mut self,
        key: &TcpKey,
        buf: &mut [u8],
        mss: usize,
        now: Instant,
        gateway_mac: EthernetAddress,
        out: &mut S,
    ) -> io::Result<()> {
        let room = self.send_room().min(buf.len());
        if room == 0 {
            return Ok(());
        }
        match (&self.stream).read(&mut buf[..room]) {
            Ok(0) => {
                self.send(key, TcpControl::Fin, &[], gateway_mac, out);
                self.our_seq = self.our_seq.wrapping_add(1);
                self.host_eof = true;
            }
            Ok(n) => {
                for segment in buf[..n].chunks(mss) {
                    self.send(key, TcpControl::None, segment, gateway_mac, out);
                    self.our_seq = self.our_seq.wrapping_add(segment.len() as u32);
                }
                self.to_guest.extend_from_slice(&buf[..n]);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if self.retransmit_at.is_none() {
            self.rearm(now);
        }
        Ok(())
    }

    /// Apply the guest's cumulative ACK and window.
    ///
    /// Returns true when a run of duplicate ACKs calls for a fast
    /// retransmit. ACKs for data never sent are ignored.
    fn on_guest_ack(&mut self, ack: u32, window: u32, pure_ack: bool, now: Instant) -> bool {
        let acked = ack.wrapping_sub(self.guest_acked);
        let in_flight = self.in_flight();
        if acked > in_flight {
            return false;
        }

        if acked == 0 {
            let duplicate = pure_ack && in_flight > 0 && window == self.guest_window;
            self.guest_window = window;
            if !duplicate {
                if in_flight == 0 || self.retransmit_at.is_none() {
                    self.rearm(now);
                }
                return false;
            }
            self.dup_acks = self.dup_acks.saturating_add(1);
            return self.dup_acks == DUP_ACK_THRESHOLD;
        }

        let data_acked = (acked as usize).min(self.to_guest.len());
        self.to_guest.drain(..data_acked);
        self.guest_acked = ack;
        self.guest_window = window;
        self.dup_acks = 0;
        self.rto = INITIAL_RTO;
        self.rearm(now);
        false
    }

    /// Run the retransmission timer while data is in flight, or the window
    /// check while the guest's window is closed.
    fn rearm(&mut self, now: Instant) {
        let waiting = self.in_flight() > 0
            || (self.guest_window == 0 && self.state == TcpState::Established && !self.host_eof);
        self.retransmit_at = waiting.then(|| now + self.rto);
    }

    fn on_retransmit_timer<S: FrameSink + ?Sized>(
        &mut self,
        key: &TcpKey,
        mss: usize,
        now: Instant,
        gateway_mac: EthernetAddress,
        out: &mut S,
    ) {
        if self.in_flight() == 0 {
            // Closed window: an old sequence number makes the guest
            // answer with its current window
            let stale_seq = self.our_seq.wrapping_sub(1);
            self.send_at(key, stale_seq, TcpControl::None, &[], gateway_mac, out);
        } else {
            self.resend(key, mss, usize::MAX, gateway_mac, out);
        }
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.retransmit_at = Some(now + self.rto);
    }

    /// Resend up to `limit` unacknowledged bytes from the oldest one, then
    /// the FIN if it is outstanding and everything before it went out.
    fn resend<S: FrameSink + ?Sized>(
        &self,
        key: &TcpKey,
        mss: usize,
        limit: usize,
        gateway_mac: EthernetAddress,
        out: &mut S,
    ) {
        let len = self.to_guest.len().min(limit);
        let mut seq = self.guest_acked;
        for segment in self.to_guest[..len].chunks(mss) {
            self.send_at(key, seq, TcpControl::None, segment, gateway_mac, out);
            seq = seq.wrapping_add(segment.len() as u32);
        }
        if len == self.to_guest.len() && self.host_eof && seq != self.our_seq {
            self.send_at(key, seq, TcpControl::Fin, &[], gateway_mac, out);
        }
    }

    /// Both directions closed and everything we sent acknowledged.
    fn finished(&self) -> bool {
        self.guest_fin && self.host_eof && self.to_host.is_empty() && self.in_flight() == 0
    }

    /// Send a segment to the guest at the current sequence numbers.
    fn send<S: FrameSink + ?Sized>(
        &self,
        key: &TcpKey,
        control: TcpControl,
        payload: &[u8],
        gateway_mac: EthernetAddress,
        out: &mut S,
    ) {
        self.send_at(key, self.our_seq, control, payload, gateway_mac, out);
    }

    fn send_at<S: FrameSink + ?Sized>(
        &self,
        key: &TcpKey,
        seq: u32,
        control: TcpControl,
        payload: &[u8],
        gateway_mac: EthernetAddress,
        out: &mut S,
    ) {
        if let Some(frame) = craft_tcp_frame(
            key.remote_addr,
            key.guest_addr,
            seq,
            self.guest_next_seq,
            control,
            payload,
            None,
            gateway_mac,
            self.guest_mac,
        ) {
            out.deliver(&frame);
        }
    }
}

/// The address a host reply appears to come from: loopback stands for
/// the gateway.
fn guest_visible(gateway_ip: Ipv4Addr, remote: SocketAddrV4) -> SocketAddrV4 {
    if remote.ip().is_loopback() {
        SocketAddrV4::new(gateway_ip, remote.port())
    } else {
        remote
    }
}

fn ready_keys<K: Copy>(entries: &HashMap<K, DatagramEntry>, poll_set: &PollSet) -> Vec<K> {
    entries
        .iter()
        .filter(|(_, entry)| {
            entry
                .token
                .is_some_and(|token| !poll_set.revents(token).is_empty())
        })
        .map(|(key, _)| *key)
        .collect()
}

fn is_live(last_activity: Instant, now: Instant, timeout: Duration) -> bool {
    now.saturating_duration_since(last_activity) <= timeout
}

fn connect_nonblocking(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

fn bind_udp() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn icmp_socket() -> io::Result<UdpSocket> {
    // Non-privileged ICMP via SOCK_DGRAM
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Build an Ethernet/IPv4 frame around a `payload_len`-byte transport
/// payload written by `emit_payload`.
///
/// Returns `None` if the datagram exceeds the IPv4 total length field.
fn ipv4_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: IpProtocol,
    payload_len: usize,
    emit_payload: impl FnOnce(&Ipv4Repr, &mut [u8]),
) -> Option<Vec<u8>> {
    let ip_len = IP_HEADER_SIZE + payload_len;
    if ip_len > usize::from(u16::MAX) {
        return None;
    }

    let mut frame = vec![0u8; ETH_HEADER_SIZE + ip_len];
    EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    }
    .emit(&mut EthernetFrame::new_unchecked(&mut frame[..]));

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: protocol,
        payload_len,
        hop_limit: 64,
    };
    ip_repr.emit(
        &mut Ipv4Packet::new_unchecked(&mut frame[ETH_HEADER_SIZE..]),
        &ChecksumCapabilities::default(),
    );
    emit_payload(&ip_repr, &mut frame[ETH_HEADER_SIZE + IP_HEADER_SIZE..]);
    Some(frame)
}

/// Ethernet/IPv4/UDP frame carrying `payload`.
#[allow(clippy::useless_conversion)] // Ipv4Address -> IpAddress is needed for emit()
pub(crate) fn craft_udp_frame(
    payload: &[u8],
    src_addr: SocketAddrV4,
    dst_addr: SocketAddrV4,
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
) -> Option<Vec<u8>> {
    let udp_repr = UdpRepr {
        src_port: src_addr.port(),
        dst_port: dst_addr.port(),
    };
    ipv4_frame(
        src_mac,
        dst_mac,
        *src_addr.ip(),
        *dst_addr.ip(),
        IpProtocol::Udp,
        UDP_HEADER_SIZE + payload.len(),
        |ip, buf| {
            udp_repr.emit(
                &mut UdpPacket::new_unchecked(buf),
                &ip.src_addr.into(),
                &ip.dst_addr.into(),
                payload.len(),
                |dst| dst.copy_from_slice(payload),
                &ChecksumCapabilities::default(),
            );
        },
    )
}

fn craft_tcp_syn_ack(
    src_addr: SocketAddrV4,
    dst_addr: SocketAddrV4,
    seq_num: u32,
    ack_num: u32,
    mss: usize,
    gateway_mac: EthernetAddress,
    guest_mac: EthernetAddress,
) -> Option<Vec<u8>> {
    let mss = u16::try_from(mss).unwrap_or(u16::MAX);
    craft_tcp_frame(
        src_addr,
        dst_addr,
        seq_num,
        ack_num,
        TcpControl::Syn,
        &[],
        Some(mss),
        gateway_mac,
        guest_mac,
    )
}

pub(crate) fn craft_tcp_rst(
    src_addr: SocketAddrV4,
    dst_addr: SocketAddrV4,
    seq_num: u32,
    ack_num: u32,
    gateway_mac: EthernetAddress,
    guest_mac: EthernetAddress,
) -> Option<Vec<u8>> {
    craft_tcp_frame(
        src_addr,
        dst_addr,
        seq_num,
        ack_num,
        TcpControl::Rst,
        &[],
        None,
        gateway_mac,
        guest_mac,
    )
}

/// Ethernet/IPv4/TCP frame. Every segment carries an ACK and a fixed
/// 64 KiB window.
#[allow(clippy::useless_conversion)] // Ipv4Address -> IpAddress is needed for emit()
#[allow(clippy::too_many_arguments)]
pub(crate) fn craft_tcp_frame(
    src_addr: SocketAddrV4,
    dst_addr: SocketAddrV4,
    seq_num: u32,
    ack_num: u32,
    control: TcpControl,
    payload: &[u8],
    max_seg_size: Option<u16>,
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
) -> Option<Vec<u8>> {
    let tcp_repr = TcpRepr {
        src_port: src_addr.port(),
        dst_port: dst_addr.port(),
        seq_number: TcpSeqNumber(seq_num as i32),
        ack_number: Some(TcpSeqNumber(ack_num as i32)),
        window_len: u16::MAX,
        window_scale: None,
        control,
        max_seg_size,
        sack_permitted: false,
        sack_ranges: [None; 3],
        timestamp: None,
        payload,
    };
    ipv4_frame(
        src_mac,
        dst_mac,
        *src_addr.ip(),
        *dst_addr.ip(),
        IpProtocol::Tcp,
        tcp_repr.buffer_len(),
        |ip, buf| {
            tcp_repr.emit(
                &mut TcpPacket::new_unchecked(buf),
                &ip.src_addr.into(),
                &ip.dst_addr.into(),
                &ChecksumCapabilities::default(),
            );
        },
    )
}

/// Internet checksum (RFC 1071) over `data`.
pub(crate) fn icmp_checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Turn an echo reply read from a host ICMP socket into a frame for the
/// guest, restoring the guest's identifier (the kernel rewrites it).
///
/// Anything that is not a complete echo reply yields `None`.
fn craft_icmp_echo_reply(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    identifier: u16,
    icmp_data: &[u8],
    gateway_mac: EthernetAddress,
    guest_mac: EthernetAddress,
) -> Option<Vec<u8>> {
    if icmp_data.len() < ICMP_HEADER_SIZE || icmp_data[0] != 0 {
        return None;
    }

    ipv4_frame(
        gateway_mac,
        guest_mac,
        src_ip,
        dst_ip,
        IpProtocol::Icmp,
        icmp_data.len(),
        |_, buf| {
            buf.copy_from_slice(icmp_data);
            buf[1] = 0;
            buf[2..4].fill(0);
            buf[4..6].copy_from_slice(&identifier.to_be_bytes());
            let checksum = icmp_checksum(buf);
            buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Icmpv4Message;
    use std::net::TcpListener;

    const GATEWAY_MAC: EthernetAddress = EthernetAddress([0x52, 0x55, 0x0a, 0x00, 0x02, 0x02]);
    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
    const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

    fn table() -> NatTable {
        NatTable::new(GATEWAY_IP, GATEWAY_MAC.0, 1500)
    }

    /// Run fill/wait/dispatch until `done` holds or the attempts run out.
    fn pump(
        nat: &mut NatTable,
        out: &mut Vec<Vec<u8>>,
        done: impl Fn(&[Vec<u8>]) -> bool,
    ) {
        let (tap, _peer) = std::os::unix::net::UnixDatagram::pair().unwrap();
        for _ in 0..50 {
            if done(out) {
                return;
            }
            let mut set = PollSet::new(std::os::fd::AsFd::as_fd(&tap), None);
            nat.fill_poll_set(&mut set);
            set.wait(Some(Duration::from_millis(100))).unwrap();
            nat.dispatch(&set, out);
        }
    }

    fn guest_tcp(
        dst_port: u16,
        seq: u32,
        ack: Option<u32>,
        control: TcpControl,
        payload: &[u8],
    ) -> Vec<u8> {
        guest_segment(dst_port, seq, ack, control, payload, u16::MAX)
    }

    fn guest_segment(
        dst_port: u16,
        seq: u32,
        ack: Option<u32>,
        control: TcpControl,
        payload: &[u8],
        window: u16,
    ) -> Vec<u8> {
        let tcp_repr = TcpRepr {
            src_port: 40000,
            dst_port,
            seq_number: TcpSeqNumber(seq as i32),
            ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
            window_len: window,
            window_scale: None,
            control,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload,
        };
        let tcp_len = tcp_repr.buffer_len();
        let mut frame = vec![0u8; ETH_HEADER_SIZE + IP_HEADER_SIZE + tcp_len];
        EthernetRepr {
            src_addr: GUEST_MAC,
            dst_addr: GATEWAY_MAC,
            ethertype: EthernetProtocol::Ipv4,
        }
        .emit(&mut EthernetFrame::new_unchecked(&mut frame[..]));
        let ip_repr = Ipv4Repr {
            src_addr: GUEST_IP,
            dst_addr: GATEWAY_IP,
            next_header: IpProtocol::Tcp,
            payload_len: tcp_len,
            hop_limit: 64,
        };
        let caps = ChecksumCapabilities::default();
        ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut frame[14..]), &caps);
        tcp_repr.emit(
            &mut TcpPacket::new_unchecked(&mut frame[34..]),
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            &caps,
        );
        frame
    }

    const GUEST_ISN: u32 = 5000;

    /// Complete a handshake through the table with a guest advertising
    /// `window`. Returns the accepted host stream and the sequence number
    /// of the first byte of host data.
    fn establish(
        listener: &TcpListener,
        nat: &mut NatTable,
        out: &mut Vec<Vec<u8>>,
        window: u16,
    ) -> (TcpStream, u32) {
        let port = listener.local_addr().unwrap().port();
        let syn = guest_segment(port, GUEST_ISN, None, TcpControl::Syn, &[], window);
        assert!(nat.process_frame(&syn, out));
        let (accepted, _) = listener.accept().unwrap();

        pump(nat, out, |out| !out.is_empty());
        let (our_isn, ..) = parse_tcp(&out[0]);
        out.clear();

        let first_seq = our_isn.wrapping_add(1);
        let ack = guest_segment(
            port,
            GUEST_ISN + 1,
            Some(first_seq),
            TcpControl::None,
            &[],
            window,
        );
        nat.process_frame(&ack, out);
        assert!(out.is_empty());
        (accepted, first_seq)
    }

    /// A fixed number of fill/wait/dispatch rounds.
    fn spin(nat: &mut NatTable, out: &mut Vec<Vec<u8>>, rounds: usize) {
        let (tap, _peer) = std::os::unix::net::UnixDatagram::pair().unwrap();
        for _ in 0..rounds {
            let mut set = PollSet::new(std::os::fd::AsFd::as_fd(&tap), None);
            nat.fill_poll_set(&mut set);
            set.wait(Some(Duration::from_millis(50))).unwrap();
            nat.dispatch(&set, out);
        }
    }

    fn payload_bytes(out: &[Vec<u8>]) -> usize {
        out.iter().map(|f| parse_tcp(f).6.len()).sum()
    }

    fn parse_tcp(frame: &[u8]) -> (u32, u32, bool, bool, bool, bool, Vec<u8>) {
        let eth = EthernetFrame::new_checked(frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        (
            tcp.seq_number().0 as u32,
            tcp.ack_number().0 as u32,
            tcp.syn(),
            tcp.ack(),
            tcp.fin(),
            tcp.rst(),
            tcp.payload().to_vec(),
        )
    }

    #[test]
    fn test_craft_tcp_data_within_mss() {
        let src = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443);
        let dst = SocketAddrV4::new(GUEST_IP, 12345);

        let payload = vec![0xAB; 100];
        let frame = craft_tcp_frame(
            src,
            dst,
            1000,
            2000,
            TcpControl::None,
            &payload,
            None,
            GATEWAY_MAC,
            GUEST_MAC,
        )
        .unwrap();

        // Ethernet: 14, IP: 20, TCP: 20, Payload: 100
        assert_eq!(frame.len(), 154);

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();

        assert_eq!(tcp.seq_number(), TcpSeqNumber(1000));
        assert_eq!(tcp.ack_number(), TcpSeqNumber(2000));
        assert_eq!(tcp.payload().len(), 100);
    }

    #[test]
    fn test_syn_ack_carries_mss_option() {
        let src = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 80);
        let dst = SocketAddrV4::new(GUEST_IP, 5555);
        let frame = craft_tcp_syn_ack(src, dst, 7, 8, 1460, GATEWAY_MAC, GUEST_MAC).unwrap();

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        let repr = TcpRepr::parse(
            &tcp,
            &ip.src_addr().into(),
            &ip.dst_addr().into(),
            &ChecksumCapabilities::default(),
        )
        .unwrap();
        assert!(tcp.syn() && tcp.ack());
        assert_eq!(repr.max_seg_size, Some(1460));
    }

    #[test]
    fn test_mss_follows_mtu() {
        assert_eq!(tcp_mss(1500), 1460);
        assert_eq!(tcp_mss(9000), 8960);
        assert_eq!(tcp_mss(68), 28);
    }

    #[test]
    fn test_udp_frame_checksums_and_size_limit() {
        let src = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let dst = SocketAddrV4::new(GUEST_IP, 12345);

        let frame = craft_udp_frame(b"hello", src, dst, GATEWAY_MAC, GUEST_MAC).unwrap();
        assert_eq!(
            frame.len(),
            ETH_HEADER_SIZE + IP_HEADER_SIZE + UDP_HEADER_SIZE + 5
        );
        let eth = EthernetFrame::new_checked(&frame).unwrap();
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert!(udp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
        assert_eq!((udp.src_port(), udp.dst_port()), (53, 12345));
        assert_eq!(udp.payload(), b"hello");

        let oversized = vec![0u8; usize::from(u16::MAX)];
        assert!(craft_udp_frame(&oversized, src, dst, GATEWAY_MAC, GUEST_MAC).is_none());
    }

    #[test]
    fn test_internet_checksum() {
        // RFC 1071 section 3 example
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(icmp_checksum(&data), !0xddf2);

        // Odd length pads with a zero byte
        assert_eq!(icmp_checksum(&[0xff]), 0x00ff);
        assert_eq!(icmp_checksum(&[]), 0xffff);
    }

    #[test]
    fn test_craft_icmp_echo_reply() {
        let src_ip = Ipv4Addr::new(8, 8, 8, 8);
        let identifier = 1234;

        // Echo reply as returned by the host socket, with a rewritten id
        let icmp_data = vec![
            0, 0, // Type = echo reply, Code = 0
            0x00, 0x00, // Checksum (ignored)
            0x99, 0x99, // Identifier chosen by the kernel
            0x00, 0x01, // Sequence = 1
            b'p', b'i', b'n', b'g',
        ];

        let frame = craft_icmp_echo_reply(
            src_ip,
            GUEST_IP,
            identifier,
            &icmp_data,
            GATEWAY_MAC,
            GUEST_MAC,
        )
        .unwrap();

        let eth = EthernetFrame::new_checked(&frame).unwrap();
        assert_eq!(eth.src_addr(), GATEWAY_MAC);
        assert_eq!(eth.dst_addr(), GUEST_MAC);

        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), src_ip);
        assert_eq!(ip.dst_addr(), GUEST_IP);
        assert_eq!(ip.next_header(), IpProtocol::Icmp);

        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv4Message::EchoReply);
        assert_eq!(icmp.echo_ident(), identifier);
        assert_eq!(icmp.echo_seq_no(), 1);
        assert_eq!(icmp.data(), b"ping");
        assert_eq!(icmp_checksum(ip.payload()), 0);
    }

    #[test]
    fn test_craft_icmp_echo_reply_rejects_non_reply() {
        let icmp_data = vec![8, 0, 0x00, 0x00, 0x04, 0xD2, 0x00, 0x01];
        let frame = craft_icmp_echo_reply(
            Ipv4Addr::new(8, 8, 8, 8),
            GUEST_IP,
            1234,
            &icmp_data,
            GATEWAY_MAC,
            GUEST_MAC,
        );
        assert!(frame.is_none());
    }

    #[test]
    fn test_craft_icmp_echo_reply_rejects_short_data() {
        let frame = craft_icmp_echo_reply(
            Ipv4Addr::new(8, 8, 8, 8),
            GUEST_IP,
            1234,
            &[0, 0, 0, 0],
            GATEWAY_MAC,
            GUEST_MAC,
        );
        assert!(frame.is_none());
    }

    #[test]
    fn test_host_target_maps_gateway_to_loopback() {
        let nat = table();
        let to_gateway = SocketAddrV4::new(GATEWAY_IP, 8080);
        let external = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 80);
        assert_eq!(
            nat.host_target(to_gateway),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)
        );
        assert_eq!(nat.host_target(external), external);
        assert_eq!(
            guest_visible(GATEWAY_IP, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)),
            to_gateway
        );
    }

    #[test]
    fn test_udp_relay_through_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = server.local_addr().unwrap().port();

        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let guest = SocketAddrV4::new(GUEST_IP, 5000);
        let frame = craft_udp_frame(
            b"ping",
            guest,
            SocketAddrV4::new(GATEWAY_IP, port),
            GUEST_MAC,
            GATEWAY_MAC,
        )
        .unwrap();
        assert!(nat.process_frame(&frame, &mut out));
        assert_eq!(nat.len(), 1);

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).unwrap();

        pump(&mut nat, &mut out, |out| !out.is_empty());
        assert_eq!(out.len(), 1);

        let eth = EthernetFrame::new_checked(&out[0]).unwrap();
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), GATEWAY_IP);
        assert_eq!(ip.dst_addr(), GUEST_IP);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), port);
        assert_eq!(udp.dst_port(), 5000);
        assert_eq!(udp.payload(), b"pong");
    }

    #[test]
    fn test_tcp_handshake_and_data_through_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();

        let guest_isn = 1000u32;
        let syn = guest_tcp(port, guest_isn, None, TcpControl::Syn, &[]);
        assert!(nat.process_frame(&syn, &mut out));
        let (mut accepted, _) = listener.accept().unwrap();
        accepted
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        pump(&mut nat, &mut out, |out| !out.is_empty());
        let (our_isn, ack, is_syn, is_ack, _, rst, _) = parse_tcp(&out[0]);
        assert!(is_syn && is_ack && !rst);
        assert_eq!(ack, guest_isn + 1);
        out.clear();

        // Complete the handshake and send data in the same segment
        let data = guest_tcp(
            port,
            guest_isn + 1,
            Some(our_isn.wrapping_add(1)),
            TcpControl::None,
            b"hello",
        );
        nat.process_frame(&data, &mut out);
        let (_, ack, _, _, _, _, _) = parse_tcp(&out[0]);
        assert_eq!(ack, guest_isn + 1 + 5);
        out.clear();

        let mut buf = [0u8; 16];
        let n = accepted.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Out-of-order data is answered with a duplicate ACK and not forwarded
        let stray = guest_tcp(
            port,
            guest_isn + 100,
            Some(our_isn.wrapping_add(1)),
            TcpControl::None,
            b"zzz",
        );
        nat.process_frame(&stray, &mut out);
        let (_, ack, _, _, _, _, _) = parse_tcp(&out[0]);
        assert_eq!(ack, guest_isn + 1 + 5);
        out.clear();

        accepted.write_all(b"world").unwrap();
        pump(&mut nat, &mut out, |out| !out.is_empty());
        let (seq, _, _, _, _, _, payload) = parse_tcp(&out[0]);
        assert_eq!(seq, our_isn.wrapping_add(1));
        assert_eq!(payload, b"world");
        out.clear();

        // Host closes: the guest sees a FIN
        drop(accepted);
        pump(&mut nat, &mut out, |out| out.iter().any(|f| parse_tcp(f).4));
        assert!(out.iter().any(|f| parse_tcp(f).4));
    }

    #[test]
    fn test_host_data_respects_guest_window() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let (mut accepted, first_seq) = establish(&listener, &mut nat, &mut out, 2000);

        accepted.write_all(&[7u8; 10_000]).unwrap();
        pump(&mut nat, &mut out, |out| payload_bytes(out) >= 2000);
        spin(&mut nat, &mut out, 4);
        assert_eq!(payload_bytes(&out), 2000);
        assert_eq!(parse_tcp(&out[0]).0, first_seq);
        out.clear();

        // Acknowledging the window lets the next 2000 bytes through
        let ack = guest_segment(
            port,
            GUEST_ISN + 1,
            Some(first_seq.wrapping_add(2000)),
            TcpControl::None,
            &[],
            2000,
        );
        nat.process_frame(&ack, &mut out);
        pump(&mut nat, &mut out, |out| payload_bytes(out) >= 2000);
        spin(&mut nat, &mut out, 2);
        assert_eq!(payload_bytes(&out), 2000);
        assert_eq!(parse_tcp(&out[0]).0, first_seq.wrapping_add(2000));
    }

    #[test]
    fn test_duplicate_acks_resend_oldest_segment() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let (mut accepted, first_seq) = establish(&listener, &mut nat, &mut out, u16::MAX);

        accepted.write_all(&[1u8; 3000]).unwrap();
        pump(&mut nat, &mut out, |out| payload_bytes(out) >= 3000);
        out.clear();

        // The guest lost the first segment and keeps acknowledging its start
        let dup = guest_segment(
            port,
            GUEST_ISN + 1,
            Some(first_seq),
            TcpControl::None,
            &[],
            u16::MAX,
        );
        nat.process_frame(&dup, &mut out);
        nat.process_frame(&dup, &mut out);
        assert!(out.is_empty());
        nat.process_frame(&dup, &mut out);

        assert_eq!(out.len(), 1);
        let (seq, _, _, _, _, _, payload) = parse_tcp(&out[0]);
        assert_eq!(seq, first_seq);
        assert_eq!(payload.len(), tcp_mss(1500));
    }

    #[test]
    fn test_retransmit_timer_resends_and_backs_off() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let (mut accepted, first_seq) = establish(&listener, &mut nat, &mut out, u16::MAX);

        accepted.write_all(b"lost").unwrap();
        pump(&mut nat, &mut out, |out| payload_bytes(out) >= 4);
        out.clear();

        let now = Instant::now();
        assert!(nat.next_timeout(now).unwrap() <= INITIAL_RTO);
        nat.run_timers(now, &mut out);
        assert!(out.is_empty());

        let later = now + INITIAL_RTO * 2;
        nat.run_timers(later, &mut out);
        assert_eq!(out.len(), 1);
        let (seq, _, _, _, _, _, payload) = parse_tcp(&out[0]);
        assert_eq!(seq, first_seq);
        assert_eq!(payload, b"lost");
        assert_eq!(nat.next_timeout(later), Some(INITIAL_RTO * 2));

        let ack = guest_segment(
            port,
            GUEST_ISN + 1,
            Some(first_seq.wrapping_add(4)),
            TcpControl::None,
            &[],
            u16::MAX,
        );
        nat.process_frame(&ack, &mut out);
        assert_eq!(nat.next_timeout(later), None);
    }

    #[test]
    fn test_closed_window_is_rechecked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let (mut accepted, first_seq) = establish(&listener, &mut nat, &mut out, 0);

        accepted.write_all(&[3u8; 100]).unwrap();
        spin(&mut nat, &mut out, 3);
        assert!(out.is_empty());

        nat.run_timers(Instant::now() + INITIAL_RTO * 2, &mut out);
        assert_eq!(out.len(), 1);
        let (seq, _, _, _, _, _, payload) = parse_tcp(&out[0]);
        assert_eq!(seq, first_seq.wrapping_sub(1));
        assert!(payload.is_empty());
        out.clear();

        // The guest's answer reopens the window
        let update = guest_segment(
            port,
            GUEST_ISN + 1,
            Some(first_seq),
            TcpControl::None,
            &[],
            4000,
        );
        nat.process_frame(&update, &mut out);
        pump(&mut nat, &mut out, |out| payload_bytes(out) >= 100);
        assert_eq!(payload_bytes(&out), 100);
    }

    #[test]
    fn test_tcp_connect_refused_sends_rst() {
        // Grab a port that nothing listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let syn = guest_tcp(port, 42, None, TcpControl::Syn, &[]);
        nat.process_frame(&syn, &mut out);

        pump(&mut nat, &mut out, |out| !out.is_empty());
        let (_, ack, _, _, _, rst, _) = parse_tcp(&out[0]);
        assert!(rst);
        assert_eq!(ack, 43);
        assert!(nat.is_empty());
    }

    #[test]
    fn test_cleanup_drops_idle_entries() {
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let frame = craft_udp_frame(
            b"x",
            SocketAddrV4::new(GUEST_IP, 6000),
            SocketAddrV4::new(GATEWAY_IP, 9),
            GUEST_MAC,
            GATEWAY_MAC,
        )
        .unwrap();
        nat.process_frame(&frame, &mut out);
        assert_eq!(nat.len(), 1);

        nat.cleanup(Instant::now());
        assert_eq!(nat.len(), 1);

        nat.cleanup(Instant::now() + UDP_IDLE_TIMEOUT + Duration::from_secs(1));
        assert!(nat.is_empty());
    }

    #[test]
    fn test_non_ipv4_is_not_handled() {
        let mut nat = table();
        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut frame = vec![0u8; 42];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(!nat.process_frame(&frame, &mut out));
        assert!(out.is_empty());
    }
}
