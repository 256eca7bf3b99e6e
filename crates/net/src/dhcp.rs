use crate::config::{EngineConfig, prefix_mask};
use heapless::Vec as HeaplessVec;
use smoltcp::wire::{DhcpMessageType, DhcpPacket, DhcpRepr, EthernetAddress, Ipv4Address};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Lease time handed to clients, in seconds.
const LEASE_DURATION: u32 = 3600;

/// Built-in DHCP server for the guest network.
///
/// Each client MAC holds at most one address from a fixed pool. The lowest
/// address no live lease holds is handed out first, so a released address
/// is offered again.
pub struct DhcpServer {
    /// Gateway address, used as router, server identifier and `siaddr`
    server_ip: Ipv4Address,
    subnet_mask: Ipv4Address,
    lease_duration: u32,
    first_ip: Ipv4Addr,
    last_ip: Ipv4Addr,
    leases: HashMap<EthernetAddress, Ipv4Address>,
    /// smoltcp's repr carries at most three resolvers
    dns_servers: HeaplessVec<Ipv4Address, 3>,
}

impl DhcpServer {
    pub fn new(config: &EngineConfig) -> Self {
        let mut dns_servers = HeaplessVec::new();
        dns_servers.push(config.dns_ip).ok();

        Self {
            server_ip: config.gateway_ip,
            subnet_mask: Ipv4Addr::from(prefix_mask(config.prefix_len)),
            lease_duration: LEASE_DURATION,
            first_ip: config.dhcp_start,
            last_ip: config.dhcp_end,
            leases: HashMap::new(),
            dns_servers,
        }
    }

    /// Answer a client message. Discover gets an Offer, Request an Ack or
    /// Nak, and Release drops the lease without a reply.
    pub fn handle_packet<'a>(
        &mut self,
        client_mac: EthernetAddress,
        packet: &DhcpPacket<&'a [u8]>,
    ) -> Option<DhcpRepr<'a>> {
        let repr = DhcpRepr::parse(packet).ok()?;

        match repr.message_type {
            DhcpMessageType::Discover => self.handle_discover(client_mac, &repr),
            DhcpMessageType::Request => self.handle_request(client_mac, &repr),
            DhcpMessageType::Release => {
                self.handle_release(client_mac);
                None
            }
            _ => None,
        }
    }

    /// Address leased to `client_mac`, if any.
    pub fn lease(&self, client_mac: EthernetAddress) -> Option<Ipv4Addr> {
        self.leases.get(&client_mac).copied()
    }

    fn handle_discover<'a>(
        &mut self,
        client_mac: EthernetAddress,
        discover: &DhcpRepr<'_>,
    ) -> Option<DhcpRepr<'a>> {
        let offered = self.get_or_allocate_ip(client_mac)?;
        tracing::debug!(client = %client_mac, ip = %offered, "dhcp: offer");
        Some(self.reply(DhcpMessageType::Offer, client_mac, discover, offered))
    }

    /// Released addresses stay out of the pool.
    fn handle_release(&mut self, client_mac: EthernetAddress) {
        if let Some(ip) = self.leases.remove(&client_mac) {
            tracing::debug!(client = %client_mac, ip = %ip, "dhcp: release");
        }
    }

    fn handle_request<'a>(
        &mut self,
        client_mac: EthernetAddress,
        request: &DhcpRepr<'_>,
    ) -> Option<DhcpRepr<'a>> {
        // Selecting state carries the address in option 50, renewing and
        // rebinding clients put it in ciaddr
        let wanted = request
            .requested_ip
            .or_else(|| (!request.client_ip.is_unspecified()).then_some(request.client_ip));

        let assigned_ip = match (self.leases.get(&client_mac).copied(), wanted) {
            (Some(leased), Some(wanted)) if leased != wanted => None,
            (Some(leased), _) => Some(leased),
            // No lease yet (INIT-REBOOT or a restarted server): any free pool
            // address is granted
            (None, Some(wanted)) if self.is_free(wanted) => {
                self.leases.insert(client_mac, wanted);
                Some(wanted)
            }
            (None, _) => None,
        };

        match assigned_ip {
            Some(ip) => {
                tracing::debug!(client = %client_mac, ip = %ip, "dhcp: ack");
                Some(self.reply(DhcpMessageType::Ack, client_mac, request, ip))
            }
            None => {
                tracing::debug!(client = %client_mac, wanted = ?wanted, "dhcp: nak");
                let mut nak = self.reply(
                    DhcpMessageType::Nak,
                    client_mac,
                    request,
                    Ipv4Address::UNSPECIFIED,
                );
                nak.router = None;
                nak.subnet_mask = None;
                nak.dns_servers = None;
                nak.lease_duration = None;
                nak.renew_duration = None;
                nak.rebind_duration = None;
                Some(nak)
            }
        }
    }

    fn reply<'a>(
        &self,
        message_type: DhcpMessageType,
        client_mac: EthernetAddress,
        request: &DhcpRepr<'_>,
        your_ip: Ipv4Address,
    ) -> DhcpRepr<'a> {
        DhcpRepr {
            message_type,
            transaction_id: request.transaction_id,
            secs: 0,
            client_hardware_address: client_mac,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip,
            server_ip: self.server_ip,
            router: Some(self.server_ip),
            subnet_mask: Some(self.subnet_mask),
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: None,
            server_identifier: Some(self.server_ip),
            parameter_request_list: None,
            dns_servers: Some(self.dns_servers.clone()),
            max_size: None,
            lease_duration: Some(self.lease_duration),
            renew_duration: Some(self.lease_duration / 2),
            rebind_duration: Some(self.lease_duration * 7 / 8),
            additional_options: &[],
        }
    }

    fn get_or_allocate_ip(&mut self, client_mac: EthernetAddress) -> Option<Ipv4Address> {
        if let Some(&ip) = self.leases.get(&client_mac) {
            return Some(ip);
        }

        let pool = u32::from(self.first_ip)..=u32::from(self.last_ip);
        let Some(ip) = pool.map(Ipv4Addr::from).find(|ip| self.is_free(*ip)) else {
            tracing::warn!(client = %client_mac, "dhcp: address pool exhausted");
            return None;
        };
        self.leases.insert(client_mac, ip);
        Some(ip)
    }

    /// In the pool and not leased to any client.
    fn is_free(&self, ip: Ipv4Addr) -> bool {
        (self.first_ip..=self.last_ip).contains(&ip) && !self.leases.values().any(|&l| l == ip)
    }
}
