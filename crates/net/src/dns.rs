//! DNS forwarding for the guest.
//!
//! Queries arriving at the virtual DNS address are validated, forwarded to
//! the host's resolver from a fresh non-blocking socket, and the answer is
//! handed back for delivery to the querying client.

use crate::poll_set::{PollSet, PollToken};
use nix::poll::PollFlags;
use smoltcp::wire::IpEndpoint;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::{Duration, Instant};

const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_DNS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
const MAX_PENDING_QUERIES: usize = 256;
const RESPONSE_BUF_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to parse DNS packet")]
    Parse,

    #[error("DNS I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("DNS query timed out")]
    Timeout,

    #[error("too many DNS queries in flight")]
    TooManyPending,
}

/// Read the first nameserver from a resolv.conf file.
fn system_dns(path: &Path) -> Option<SocketAddr> {
    let contents = std::fs::read(path).ok()?;
    let config = resolv_conf::Config::parse(&contents).ok()?;
    let ip = match config.nameservers.first()? {
        resolv_conf::ScopedIp::V4(ip) => IpAddr::V4(*ip),
        resolv_conf::ScopedIp::V6(ip, _) => IpAddr::V6(*ip),
    };
    Some(SocketAddr::new(ip, 53))
}

/// An answer ready to be sent back to a guest client.
#[derive(Debug)]
pub struct DnsReply {
    pub client: IpEndpoint,
    pub payload: Vec<u8>,
}

struct PendingQuery {
    socket: UdpSocket,
    id: u16,
    client: IpEndpoint,
    deadline: Instant,
    token: Option<PollToken>,
}

/// Forwards guest DNS queries to the host's resolver.
pub struct DnsForwarder {
    upstream: SocketAddr,
    pending: Vec<PendingQuery>,
}

impl DnsForwarder {
    /// Create a forwarder using the system's resolver from `/etc/resolv.conf`,
    /// falling back to 8.8.8.8.
    pub fn new() -> Self {
        let upstream = system_dns(Path::new("/etc/resolv.conf")).unwrap_or_else(|| {
            tracing::debug!("Using fallback DNS server: {}", FALLBACK_DNS);
            FALLBACK_DNS
        });
        Self::with_upstream(upstream)
    }

    pub fn with_upstream(upstream: SocketAddr) -> Self {
        tracing::debug!("DNS forwarder using upstream server: {}", upstream);
        Self {
            upstream,
            pending: Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send a guest query upstream.
    pub fn forward(
        &mut self,
        query: &[u8],
        client: IpEndpoint,
        now: Instant,
    ) -> Result<(), DnsError> {
        let packet = dns_parser::Packet::parse(query).map_err(|_| DnsError::Parse)?;
        if self.pending.len() >= MAX_PENDING_QUERIES {
            return Err(DnsError::TooManyPending);
        }

        let local: SocketAddr = match self.upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        socket.connect(self.upstream)?;
        socket.send(query)?;

        self.pending.push(PendingQuery {
            socket,
            id: packet.header.id,
            client,
            deadline: now + DNS_TIMEOUT,
            token: None,
        });
        Ok(())
    }

    pub fn fill_poll_set(&mut self, poll_set: &mut PollSet) {
        for query in &mut self.pending {
            query.token = Some(poll_set.register(&query.socket, PollFlags::POLLIN));
        }
    }

    /// Collect answers for queries whose sockets were reported ready.
    pub fn collect_replies(&mut self, poll_set: &PollSet) -> Vec<DnsReply> {
        let mut replies = Vec::new();
        let mut buf = [0u8; RESPONSE_BUF_SIZE];

        self.pending.retain(|query| {
            let ready = query
                .token
                .is_some_and(|t| !poll_set.revents(t).is_empty());
            if !ready {
                return true;
            }
            match query.socket.recv(&mut buf) {
                Ok(len) => {
                    let response = &buf[..len];
                    match dns_parser::Packet::parse(response) {
                        Ok(packet) if packet.header.id == query.id => {
                            replies.push(DnsReply {
                                client: query.client,
                                payload: response.to_vec(),
                            });
                            false
                        }
                        _ => {
                            tracing::debug!("DNS: discarding unexpected upstream packet");
                            true
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
                Err(e) => {
                    tracing::debug!("DNS: query for {} failed: {}", query.client, DnsError::Io(e));
                    false
                }
            }
        });

        replies
    }

    /// Drop queries that have outlived their deadline.
    pub fn expire(&mut self, now: Instant) {
        self.pending.retain(|query| {
            if now >= query.deadline {
                tracing::debug!("DNS: query for {}: {}", query.client, DnsError::Timeout);
                false
            } else {
                true
            }
        });
    }

    /// Time until the earliest pending query expires.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.pending
            .iter()
            .map(|q| q.deadline.saturating_duration_since(now))
            .min()
    }
}

impl Default for DnsForwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a minimal DNS query packet for a domain.
#[cfg(test)]
pub(crate) fn build_dns_query(domain: &str, query_id: u16) -> Vec<u8> {
    let mut packet = Vec::new();

    // Header
    packet.extend_from_slice(&query_id.to_be_bytes()); // ID
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT: 1 question
    packet.extend_from_slice(&[0x00, 0x00]); // ANCOUNT: 0
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT: 0
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT: 0

    // Question section
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00); // End of domain name

    packet.extend_from_slice(&[0x00, 0x01]); // QTYPE: A
    packet.extend_from_slice(&[0x00, 0x01]); // QCLASS: IN

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::IpAddress;
    use std::error::Error;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixDatagram;

    fn client() -> IpEndpoint {
        IpEndpoint::new(IpAddress::Ipv4(Ipv4Addr::new(10, 0, 2, 15)), 33333)
    }

    #[test]
    fn build_dns_query_valid() {
        let query = build_dns_query("example.com", 0x1234);
        let packet = dns_parser::Packet::parse(&query).unwrap();
        assert_eq!(packet.header.id, 0x1234);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].qname.to_string(), "example.com");
    }

    #[test]
    fn rejects_invalid_query() {
        let mut dns = DnsForwarder::with_upstream("127.0.0.1:53".parse().unwrap());
        let result = dns.forward(&[0x00, 0x01, 0x02], client(), Instant::now());
        assert!(matches!(result, Err(DnsError::Parse)));
        assert_eq!(dns.pending(), 0);
    }

    #[test]
    fn dns_error_display_and_source() {
        assert_eq!(DnsError::Parse.to_string(), "failed to parse DNS packet");
        assert_eq!(DnsError::Timeout.to_string(), "DNS query timed out");
        let io_err = DnsError::from(io::Error::other("test"));
        assert!(io_err.source().is_some());
        assert!(DnsError::Parse.source().is_none());
    }

    #[test]
    fn reads_first_nameserver() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "search example.org").unwrap();
        writeln!(file, "nameserver 192.0.2.53").unwrap();
        writeln!(file, "nameserver 192.0.2.54").unwrap();

        assert_eq!(
            system_dns(file.path()),
            Some("192.0.2.53:53".parse().unwrap())
        );
    }

    #[test]
    fn missing_resolv_conf_has_no_nameserver() {
        assert_eq!(system_dns(Path::new("/nonexistent/resolv.conf")), None);
    }

    #[test]
    fn forwards_query_and_collects_answer() {
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        upstream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut dns = DnsForwarder::with_upstream(upstream.local_addr().unwrap());

        let query = build_dns_query("example.com", 0xBEEF);
        dns.forward(&query, client(), Instant::now()).unwrap();
        assert_eq!(dns.pending(), 1);

        let mut buf = [0u8; 512];
        let (len, from) = upstream.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &query[..]);

        // Echo the query back with the response bit set
        let mut answer = query.clone();
        answer[2] |= 0x80;
        upstream.send_to(&answer, from).unwrap();

        let (tap, _peer) = UnixDatagram::pair().unwrap();
        let mut replies = Vec::new();
        for _ in 0..20 {
            let mut set = PollSet::new(tap.as_fd(), None);
            dns.fill_poll_set(&mut set);
            set.wait(Some(Duration::from_millis(100))).unwrap();
            replies.extend(dns.collect_replies(&set));
            if !replies.is_empty() {
                break;
            }
        }

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].client, client());
        assert_eq!(replies[0].payload, answer);
        assert_eq!(dns.pending(), 0);
    }

    #[test]
    fn pending_queries_expire() {
        let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut dns = DnsForwarder::with_upstream(upstream.local_addr().unwrap());
        let start = Instant::now();

        dns.forward(&build_dns_query("example.com", 1), client(), start)
            .unwrap();
        assert_eq!(dns.next_timeout(start), Some(DNS_TIMEOUT));

        dns.expire(start + Duration::from_secs(1));
        assert_eq!(dns.pending(), 1);

        dns.expire(start + DNS_TIMEOUT);
        assert_eq!(dns.pending(), 0);
        assert_eq!(dns.next_timeout(start), None);
    }
}
