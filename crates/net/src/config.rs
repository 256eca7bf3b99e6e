use crate::error::NetError;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Smallest MTU an IPv4 host must accept (RFC 791).
pub const MIN_MTU: u32 = 68;

/// Largest MTU the engine accepts: 65535 minus IPv4 and Ethernet headroom.
pub const MAX_MTU: u32 = 65521;

/// Default MTU for the virtual interface.
pub const DEFAULT_MTU: u32 = 1500;

/// Number of addresses handed out by the DHCP server.
const DHCP_POOL_SIZE: u8 = 16;

/// IPv6 parameters of the virtual network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Config {
    /// Prefix advertised to the guest
    pub prefix: Ipv6Addr,
    /// Prefix length
    pub prefix_len: u8,
    /// Gateway address inside the prefix
    pub gateway: Ipv6Addr,
    /// DNS forwarder address inside the prefix
    pub dns: Ipv6Addr,
    /// Link-local router address used as the source of router advertisements
    pub link_local: Ipv6Addr,
}

impl Default for Ipv6Config {
    fn default() -> Self {
        Self {
            prefix: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0),
            prefix_len: 64,
            gateway: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2),
            dns: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 3),
            link_local: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2),
        }
    }
}

/// Configuration of the user-mode NAT engine.
///
/// The addressing plan is fixed; only the MTU, IPv6 and host loopback
/// settings are chosen by the caller.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Virtual network address
    pub network: Ipv4Addr,
    /// Subnet prefix length
    pub prefix_len: u8,
    /// Gateway IP address (our IP)
    pub gateway_ip: Ipv4Addr,
    /// DNS forwarder address
    pub dns_ip: Ipv4Addr,
    /// First IP to assign via DHCP
    pub dhcp_start: Ipv4Addr,
    /// Last IP to assign via DHCP
    pub dhcp_end: Ipv4Addr,
    /// MAC address for the gateway interface
    pub gateway_mac: [u8; 6],
    /// Interface MTU, used for both directions
    pub mtu: u32,
    /// IPv6 parameters, `None` when IPv6 is disabled
    pub ipv6: Option<Ipv6Config>,
    /// Relay TCP/UDP addressed to the gateway to the host's loopback
    pub host_loopback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let dhcp_start = Ipv4Addr::new(10, 0, 2, 15);
        Self {
            network: Ipv4Addr::new(10, 0, 2, 0),
            prefix_len: 24,
            gateway_ip: Ipv4Addr::new(10, 0, 2, 2),
            dns_ip: Ipv4Addr::new(10, 0, 2, 3),
            dhcp_start,
            dhcp_end: Ipv4Addr::from(u32::from(dhcp_start) + u32::from(DHCP_POOL_SIZE) - 1),
            gateway_mac: [0x52, 0x55, 0x0a, 0x00, 0x02, 0x02],
            mtu: DEFAULT_MTU,
            ipv6: None,
            host_loopback: true,
        }
    }
}

impl EngineConfig {
    pub fn new(mtu: u32, enable_ipv6: bool) -> Self {
        Self::default().mtu(mtu).ipv6(enable_ipv6)
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.ipv6 = enabled.then(Ipv6Config::default);
        self
    }

    pub fn host_loopback(mut self, enabled: bool) -> Self {
        self.host_loopback = enabled;
        self
    }

    /// Largest Ethernet frame the interface carries.
    pub fn max_frame_len(&self) -> usize {
        self.mtu as usize + 14
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(NetError::InvalidConfig(format!(
                "MTU {} outside {MIN_MTU}..={MAX_MTU}",
                self.mtu
            )));
        }
        if self.prefix_len == 0 || self.prefix_len > 30 {
            return Err(NetError::InvalidConfig(format!(
                "subnet prefix /{} leaves no room for hosts",
                self.prefix_len
            )));
        }
        if self.dhcp_start > self.dhcp_end {
            return Err(NetError::InvalidConfig(
                "DHCP range start is after range end".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `addr` lies inside the virtual IPv4 subnet.
    pub fn in_subnet(&self, addr: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        u32::from(addr) & mask == u32::from(self.network) & mask
    }

    /// Directed broadcast address of the virtual subnet.
    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        let mask = prefix_mask(self.prefix_len);
        Ipv4Addr::from((u32::from(self.network) & mask) | !mask)
    }
}

pub(crate) fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else if prefix >= 32 {
        u32::MAX
    } else {
        !((1u32 << (32 - prefix)) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addressing_plan() {
        let config = EngineConfig::default();
        assert_eq!(config.gateway_ip, Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(config.dns_ip, Ipv4Addr::new(10, 0, 2, 3));
        assert_eq!(config.dhcp_start, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(config.dhcp_end, Ipv4Addr::new(10, 0, 2, 30));
        assert!(config.ipv6.is_none());
        assert!(config.host_loopback);
    }

    #[test]
    fn ipv6_plan() {
        let config = EngineConfig::new(1500, true);
        let v6 = config.ipv6.unwrap();
        assert_eq!(v6.gateway, "fd00::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(v6.dns, "fd00::3".parse::<Ipv6Addr>().unwrap());
        assert_eq!(v6.prefix, "fd00::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(v6.prefix_len, 64);
    }

    #[test]
    fn mtu_bounds() {
        assert!(EngineConfig::new(1500, false).validate().is_ok());
        assert!(EngineConfig::new(MIN_MTU, false).validate().is_ok());
        assert!(EngineConfig::new(MAX_MTU, false).validate().is_ok());
        assert!(EngineConfig::new(MIN_MTU - 1, false).validate().is_err());
        assert!(EngineConfig::new(MAX_MTU + 1, false).validate().is_err());
    }

    #[test]
    fn subnet_membership() {
        let config = EngineConfig::default();
        assert!(config.in_subnet(Ipv4Addr::new(10, 0, 2, 200)));
        assert!(!config.in_subnet(Ipv4Addr::new(10, 0, 3, 1)));
        assert_eq!(config.subnet_broadcast(), Ipv4Addr::new(10, 0, 2, 255));
    }

    #[test]
    fn test_prefix_mask() {
        assert_eq!(prefix_mask(24), 0xFFFF_FF00);
        assert_eq!(prefix_mask(16), 0xFFFF_0000);
        assert_eq!(prefix_mask(32), u32::MAX);
        assert_eq!(prefix_mask(0), 0);
    }
}
