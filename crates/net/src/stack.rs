use crate::config::EngineConfig;
use crate::device::EngineDevice;
use crate::dhcp::DhcpServer;
use crate::dns::{DnsForwarder, DnsReply};
use crate::engine::{Engine, earliest_deadline};
use crate::error::NetError;
use crate::nat::NatTable;
use crate::poll_set::PollSet;
use crate::ra::{build_router_advertisement, is_router_solicitation};
use crate::relay::FrameSink;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::udp::{self, PacketBuffer, PacketMetadata};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    DhcpPacket, EthernetAddress, EthernetFrame, EthernetProtocol, HardwareAddress, IpAddress,
    IpCidr, IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Address, Ipv4Packet, UdpPacket,
};

use std::time::{Duration, Instant};

/// How often idle NAT entries are swept.
const NAT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const DNS_PORT: u16 = 53;

/// Smallest DHCP message a BOOTP client is required to accept.
const MIN_DHCP_MESSAGE: usize = 300;

/// The user-mode NAT engine.
///
/// This runs the smoltcp interface and handles:
/// - ARP and NDP (automatic via smoltcp)
/// - ICMP echo to the gateway and DNS addresses (automatic via smoltcp)
/// - DHCP server
/// - DNS forwarding to the host's resolver
/// - Router advertisements in answer to solicitations
/// - TCP, UDP and ICMP echo NAT through host sockets
pub struct UserNatEngine<S: FrameSink> {
    device: EngineDevice<S>,
    iface: Interface,
    sockets: SocketSet<'static>,
    dhcp_handle: SocketHandle,
    dns_v4_handle: SocketHandle,
    dns_v6_handle: Option<SocketHandle>,
    dhcp_server: DhcpServer,
    dns: DnsForwarder,
    nat: NatTable,
    router_advertisement: Option<Vec<u8>>,
    config: EngineConfig,
    start_time: Instant,
    next_cleanup: Instant,
}

impl<S: FrameSink> UserNatEngine<S> {
    /// Create an engine delivering its frames to `sink`, forwarding DNS to
    /// the system resolver.
    pub fn new(sink: S, config: EngineConfig) -> Result<Self, NetError> {
        config.validate()?;
        Self::with_dns(sink, config, DnsForwarder::new())
    }

    /// Create an engine with an explicit DNS forwarder.
    pub fn with_dns(sink: S, config: EngineConfig, dns: DnsForwarder) -> Result<Self, NetError> {
        config.validate()?;

        let mut device = EngineDevice::new(sink, config.mtu as usize);
        let start_time = Instant::now();

        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(config.gateway_mac));
        let mut iface_config = Config::new(hw_addr);
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut device, smoltcp_now(start_time));

        // The gateway goes first: it is the source of broadcast replies
        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(
                    IpAddress::Ipv4(config.gateway_ip),
                    config.prefix_len,
                ))
                .ok();
            addrs
                .push(IpCidr::new(IpAddress::Ipv4(config.dns_ip), config.prefix_len))
                .ok();
            if let Some(v6) = &config.ipv6 {
                addrs
                    .push(IpCidr::new(IpAddress::Ipv6(v6.gateway), v6.prefix_len))
                    .ok();
                addrs
                    .push(IpCidr::new(IpAddress::Ipv6(v6.dns), v6.prefix_len))
                    .ok();
                addrs
                    .push(IpCidr::new(IpAddress::Ipv6(v6.link_local), 64))
                    .ok();
            }
        });

        let mut sockets = SocketSet::new(vec![]);

        let mut dhcp_socket = udp_socket(4, 1500);
        dhcp_socket
            .bind(DHCP_SERVER_PORT)
            .map_err(|e| NetError::InvalidConfig(format!("DHCP socket bind: {e}")))?;
        let dhcp_handle = sockets.add(dhcp_socket);

        let mut dns_v4 = udp_socket(16, 4096);
        dns_v4
            .bind(IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(config.dns_ip)),
                port: DNS_PORT,
            })
            .map_err(|e| NetError::InvalidConfig(format!("DNS socket bind: {e}")))?;
        let dns_v4_handle = sockets.add(dns_v4);

        let dns_v6_handle = match &config.ipv6 {
            Some(v6) => {
                let mut dns_v6 = udp_socket(16, 4096);
                dns_v6
                    .bind(IpListenEndpoint {
                        addr: Some(IpAddress::Ipv6(v6.dns)),
                        port: DNS_PORT,
                    })
                    .map_err(|e| NetError::InvalidConfig(format!("DNS socket bind: {e}")))?;
                Some(sockets.add(dns_v6))
            }
            None => None,
        };

        let router_advertisement = config
            .ipv6
            .as_ref()
            .map(|v6| build_router_advertisement(config.gateway_mac, config.mtu, v6));

        tracing::info!(
            gateway = %config.gateway_ip,
            dns = %config.dns_ip,
            mtu = config.mtu,
            ipv6 = config.ipv6.is_some(),
            host_loopback = config.host_loopback,
            "user-mode NAT engine ready"
        );

        Ok(Self {
            device,
            iface,
            sockets,
            dhcp_handle,
            dns_v4_handle,
            dns_v6_handle,
            dhcp_server: DhcpServer::new(&config),
            dns,
            nat: NatTable::new(config.gateway_ip, config.gateway_mac, config.mtu),
            router_advertisement,
            config,
            start_time,
            next_cleanup: start_time + NAT_CLEANUP_INTERVAL,
        })
    }

    /// Whether a guest frame must be relayed through a host socket rather than
    /// answered by the virtual network itself.
    fn is_nat_destination(&self, frame: &[u8]) -> bool {
        let Ok(eth_frame) = EthernetFrame::new_checked(frame) else {
            return false;
        };

        // ARP and IPv6 are answered locally
        if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
            return false;
        }

        let Ok(ip_packet) = Ipv4Packet::new_checked(eth_frame.payload()) else {
            return false;
        };

        let dst_ip: Ipv4Address = ip_packet.dst_addr();

        // Gateway: TCP and non-DHCP UDP reach the host's loopback
        if dst_ip == self.config.gateway_ip {
            if !self.config.host_loopback {
                return false;
            }
            return match ip_packet.next_header() {
                IpProtocol::Tcp => true,
                IpProtocol::Udp => UdpPacket::new_checked(ip_packet.payload())
                    .is_ok_and(|udp| udp.dst_port() != DHCP_SERVER_PORT),
                _ => false,
            };
        }

        // The virtual subnet (including the DNS address and the subnet
        // broadcast) belongs to smoltcp
        if self.config.in_subnet(dst_ip) {
            return false;
        }

        if dst_ip.is_broadcast()
            || dst_ip.is_multicast()
            || dst_ip.is_unspecified()
            || dst_ip.is_loopback()
        {
            return false;
        }

        // Everything else is external and should be NAT'd
        true
    }

    fn poll_iface(&mut self) {
        let timestamp = smoltcp_now(self.start_time);
        self.iface
            .poll(timestamp, &mut self.device, &mut self.sockets);
        self.process_dhcp();
        self.process_dns_queries();
        // Flush whatever the DHCP server and DNS replies queued
        self.iface
            .poll(timestamp, &mut self.device, &mut self.sockets);
    }

    fn process_dhcp(&mut self) {
        let socket = self.sockets.get_mut::<udp::Socket>(self.dhcp_handle);

        while let Ok((data, _meta)) = socket.recv() {
            let Ok(dhcp_packet) = DhcpPacket::new_checked(data) else {
                continue;
            };
            let client_mac = dhcp_packet.client_hardware_address();

            let Some(response) = self.dhcp_server.handle_packet(client_mac, &dhcp_packet) else {
                continue;
            };

            let mut response_buf = vec![0u8; response.buffer_len().max(MIN_DHCP_MESSAGE)];
            let mut response_packet = DhcpPacket::new_unchecked(&mut response_buf[..]);
            if let Err(e) = response.emit(&mut response_packet) {
                tracing::warn!("Failed to serialize DHCP response: {:?}", e);
                continue;
            }

            let dest = IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::BROADCAST), DHCP_CLIENT_PORT);
            if let Err(e) = socket.send_slice(&response_buf, dest) {
                tracing::warn!("Failed to send DHCP response: {:?}", e);
            }
        }
    }

    fn process_dns_queries(&mut self) {
        let now = Instant::now();
        for handle in std::iter::once(self.dns_v4_handle).chain(self.dns_v6_handle) {
            let socket = self.sockets.get_mut::<udp::Socket>(handle);
            while let Ok((query, meta)) = socket.recv() {
                if let Err(e) = self.dns.forward(query, meta.endpoint, now) {
                    tracing::debug!("DNS: dropping query from {}: {}", meta.endpoint, e);
                }
            }
        }
    }

    fn send_dns_replies(&mut self, replies: Vec<DnsReply>) {
        for reply in replies {
            let handle = match reply.client.addr {
                IpAddress::Ipv4(_) => Some(self.dns_v4_handle),
                IpAddress::Ipv6(_) => self.dns_v6_handle,
            };
            let Some(handle) = handle else {
                continue;
            };
            let socket = self.sockets.get_mut::<udp::Socket>(handle);
            if let Err(e) = socket.send_slice(&reply.payload, reply.client) {
                tracing::debug!("DNS: failed to answer {}: {:?}", reply.client, e);
            }
        }
    }
}

impl<S: FrameSink> Engine for UserNatEngine<S> {
    fn fill_poll_set(&mut self, poll_set: &mut PollSet) -> Option<Duration> {
        self.nat.fill_poll_set(poll_set);
        self.dns.fill_poll_set(poll_set);

        let now = Instant::now();
        let iface_delay = self
            .iface
            .poll_delay(smoltcp_now(self.start_time), &self.sockets)
            .map(|d| Duration::from_millis(d.total_millis()));
        let cleanup = Some(self.next_cleanup.saturating_duration_since(now));

        let engine_timers =
            earliest_deadline(self.dns.next_timeout(now), self.nat.next_timeout(now));
        earliest_deadline(earliest_deadline(iface_delay, cleanup), engine_timers)
    }

    fn input(&mut self, frame: &[u8]) {
        if self.config.ipv6.is_some() && is_router_solicitation(frame) {
            if let Some(ra) = &self.router_advertisement {
                tracing::debug!("answering router solicitation");
                self.device.send_frame(ra);
            }
            return;
        }

        if self.is_nat_destination(frame) {
            if !self.nat.process_frame(frame, self.device.sink_mut()) {
                tracing::trace!("NAT: frame not forwarded");
            }
            return;
        }

        if !self.device.push_rx(frame) {
            tracing::debug!(len = frame.len(), "dropping frame larger than the MTU");
            return;
        }
        self.poll_iface();
    }

    fn dispatch(&mut self, poll_set: &PollSet, only_timers: bool) {
        let now = Instant::now();

        if !only_timers {
            self.nat.dispatch(poll_set, self.device.sink_mut());
            let replies = self.dns.collect_replies(poll_set);
            self.send_dns_replies(replies);
        }

        self.dns.expire(now);
        self.nat.run_timers(now, self.device.sink_mut());

        if now >= self.next_cleanup {
            self.nat.cleanup(now);
            self.next_cleanup = now + NAT_CLEANUP_INTERVAL;
        }

        self.poll_iface();
    }
}

fn udp_socket(packets: usize, packet_size: usize) -> udp::Socket<'static> {
    let rx_buffer = PacketBuffer::new(
        vec![PacketMetadata::EMPTY; packets],
        vec![0u8; packet_size * packets],
    );
    let tx_buffer = PacketBuffer::new(
        vec![PacketMetadata::EMPTY; packets],
        vec![0u8; packet_size * packets],
    );
    udp::Socket::new(rx_buffer, tx_buffer)
}

/// Convert system time to smoltcp Instant
fn smoltcp_now(start: Instant) -> SmolInstant {
    let elapsed = start.elapsed();
    SmolInstant::from_millis(elapsed.as_millis() as i64)
}
