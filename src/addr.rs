//! Target addresses
//!
//! A relay target is either a socket address or a domain name with a
//! port. Stream handshakes surface one per connection; datagram
//! framings may carry one per packet.
//!
//! Client addresses observed from sockets are canonicalized to
//! IPv4-mapped-IPv6 form before use as keys or in comparisons, so that
//! `1.2.3.4:9` and `::ffff:1.2.3.4:9` refer to the same peer.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tokio::net::lookup_host;

/// A relay target: either a concrete socket address or a domain name
/// to be resolved at dial/send time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Concrete IP address and port
    Socket(SocketAddr),
    /// Domain name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// Get the port of the target.
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// Return the socket address if the target is concrete.
    #[must_use]
    pub const fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Socket(addr) => Some(*addr),
            Self::Domain(..) => None,
        }
    }

    /// Check whether the target is a domain name.
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(..))
    }

    /// Resolve the target to a socket address.
    ///
    /// Concrete targets resolve to themselves. Domain targets go through
    /// the system resolver; when `prefer_ipv6` is set the first IPv6
    /// result wins over IPv4 results, and vice versa.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no addresses.
    pub async fn resolve(&self, prefer_ipv6: bool) -> io::Result<SocketAddr> {
        match self {
            Self::Socket(addr) => Ok(*addr),
            Self::Domain(domain, port) => {
                let mut fallback = None;
                for addr in lookup_host((domain.as_str(), *port)).await? {
                    if addr.is_ipv6() == prefer_ipv6 {
                        return Ok(addr);
                    }
                    fallback.get_or_insert(addr);
                }
                fallback.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {domain}"),
                    )
                })
            }
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => addr.fmt(f),
            Self::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Socket(addr));
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("missing port in {s}"))
        })?;
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("empty host in {s}"),
            ));
        }
        let port = port.parse::<u16>().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad port in {s}"))
        })?;
        Ok(Self::Domain(host.to_string(), port))
    }
}

/// Canonicalize a client address to IPv4-mapped-IPv6 form.
///
/// Equivalent IPv4 and IPv4-mapped-IPv6 addresses must compare equal
/// when used as session keys; mapping every IPv4 client address into
/// the IPv6 space gives one canonical representation.
#[must_use]
pub fn canonicalize_client_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

/// Check whether an address is IPv4 or IPv4-mapped-IPv6.
///
/// Used to size client-facing packets: such clients sit behind an IPv4
/// path and get the IPv4 header overhead budget.
#[must_use]
pub fn is_ipv4_or_mapped(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}
