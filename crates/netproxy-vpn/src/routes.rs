//! Exclude-Route Policy
//!
//! Turns the user's pass-through list into routing directives that make
//! traffic for those destinations bypass the tunnel.
//!
//! | Entry                  | Result                      |
//! |------------------------|-----------------------------|
//! | `localhost`, `127.0.0.1` | skipped                   |
//! | `a.b.c.d/n` (n <= 32)  | CIDR directive              |
//! | `a.b.c.d`              | single-IP directive (`/32`) |
//! | `example.com`, `*.x`   | skipped (not routable)      |
//!
//! A bad entry only drops itself; the rest of the list still applies.

use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Largest prefix accepted in a pass-through CIDR
const MAX_PREFIX_LEN: u8 = 32;

/// Kind of exclude-route directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Address range, `a.b.c.d/n`
    Cidr,
    /// One host, `a.b.c.d/32`
    SingleIp,
}

/// A destination that must bypass the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExcludeRoute {
    pub kind: RouteKind,
    pub network: IpNet,
}

impl ExcludeRoute {
    /// Range directive, truncated to its network address
    pub fn cidr(network: IpNet) -> Self {
        Self {
            kind: RouteKind::Cidr,
            network: network.trunc(),
        }
    }

    /// Host directive for `addr`
    pub fn single_ip(addr: Ipv4Addr) -> Self {
        Self {
            kind: RouteKind::SingleIp,
            network: IpNet::V4(Ipv4Net::from(addr)),
        }
    }

    /// Network address
    pub fn address(&self) -> IpAddr {
        self.network.addr()
    }

    /// Prefix length
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Whether this route would swallow the loopback address
    fn covers_loopback(&self) -> bool {
        match self.network {
            IpNet::V4(net) => net.contains(&Ipv4Addr::LOCALHOST),
            IpNet::V6(net) => net.contains(&Ipv6Addr::LOCALHOST),
        }
    }
}

impl std::fmt::Display for ExcludeRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Why a single entry produced no directive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteDirectiveError {
    #[error("loopback is never excluded")]
    Loopback,

    #[error("hostnames cannot be excluded by route")]
    Hostname,

    #[error("malformed CIDR: expected address/prefix")]
    MalformedCidr,

    #[error("invalid prefix length (0..=32)")]
    InvalidPrefix,

    #[error("unparsable address")]
    InvalidAddress,
}

/// Resolve pass-through entries into exclude-route directives.
///
/// Per-entry failures are logged and dropped; order of the surviving
/// entries is preserved.
pub fn resolve<I, S>(entries: I) -> Vec<ExcludeRoute>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut routes = Vec::new();

    for entry in entries {
        let entry = entry.as_ref();
        match resolve_entry(entry) {
            Ok(route) => {
                debug!("Pass-through entry {} -> exclude route {}", entry.trim(), route);
                routes.push(route);
            }
            Err(RouteDirectiveError::Hostname) | Err(RouteDirectiveError::Loopback) => {
                debug!("Skipped pass-through entry {:?}", entry.trim());
            }
            Err(e) => {
                warn!("Dropped pass-through entry {:?}: {}", entry, e);
            }
        }
    }

    routes
}

/// Resolve one pass-through entry.
pub fn resolve_entry(entry: &str) -> Result<ExcludeRoute, RouteDirectiveError> {
    let entry = entry.trim();

    if entry == "localhost" || entry == "127.0.0.1" {
        return Err(RouteDirectiveError::Loopback);
    }

    let route = if entry.contains('/') {
        parse_cidr(entry)?
    } else if !entry.contains('*') && is_dotted_quad(entry) {
        ExcludeRoute::single_ip(parse_dotted_quad(entry)?)
    } else {
        return Err(RouteDirectiveError::Hostname);
    };

    if route.covers_loopback() {
        return Err(RouteDirectiveError::Loopback);
    }
    Ok(route)
}

fn parse_cidr(entry: &str) -> Result<ExcludeRoute, RouteDirectiveError> {
    let mut parts = entry.split('/');
    let (Some(addr), Some(prefix), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(RouteDirectiveError::MalformedCidr);
    };

    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= MAX_PREFIX_LEN)
        .ok_or(RouteDirectiveError::InvalidPrefix)?;
    let addr: IpAddr = if is_dotted_quad(addr) {
        IpAddr::V4(parse_dotted_quad(addr)?)
    } else {
        addr.parse()
            .map_err(|_| RouteDirectiveError::InvalidAddress)?
    };
    let network = IpNet::new(addr, prefix).map_err(|_| RouteDirectiveError::InvalidPrefix)?;

    Ok(ExcludeRoute::cidr(network))
}

/// Four dot-separated groups of decimal digits
fn is_dotted_quad(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse a dotted quad with decimal groups; zero padding (`010`) is allowed
fn parse_dotted_quad(s: &str) -> Result<Ipv4Addr, RouteDirectiveError> {
    let mut octets = [0u8; 4];
    for (octet, group) in octets.iter_mut().zip(s.split('.')) {
        *octet = group
            .parse()
            .map_err(|_| RouteDirectiveError::InvalidAddress)?;
    }
    Ok(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_loopback_never_excluded() {
        assert!(resolve(["localhost", "127.0.0.1", " localhost "]).is_empty());
        assert_eq!(resolve_entry("127.0.0.0/8"), Err(RouteDirectiveError::Loopback));
        assert_eq!(resolve_entry("0.0.0.0/0"), Err(RouteDirectiveError::Loopback));
        assert_eq!(resolve_entry("::1/32"), Err(RouteDirectiveError::Loopback));
    }

    #[test]
    fn test_mixed_batch() {
        let routes = resolve([
            "192.168.0.0/16",
            "localhost",
            "*.example.com",
            "8.8.8.8",
            "bad/ip/99",
        ]);

        assert_eq!(
            routes,
            vec![
                ExcludeRoute {
                    kind: RouteKind::Cidr,
                    network: v4("192.168.0.0/16"),
                },
                ExcludeRoute {
                    kind: RouteKind::SingleIp,
                    network: v4("8.8.8.8/32"),
                },
            ]
        );
    }

    #[test]
    fn test_cidr_validation() {
        assert_eq!(resolve_entry("10.0.0.0/33"), Err(RouteDirectiveError::InvalidPrefix));
        assert_eq!(resolve_entry("10.0.0.0/x"), Err(RouteDirectiveError::InvalidPrefix));
        assert_eq!(resolve_entry("10.0.0.0/-1"), Err(RouteDirectiveError::InvalidPrefix));
        assert_eq!(resolve_entry("a/b/c"), Err(RouteDirectiveError::MalformedCidr));
        assert_eq!(resolve_entry("intranet/24"), Err(RouteDirectiveError::InvalidAddress));

        let route = resolve_entry(" 172.16.4.5/12 ").unwrap();
        assert_eq!(route.kind, RouteKind::Cidr);
        assert_eq!(route.address(), "172.16.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(route.prefix_len(), 12);
    }

    #[test]
    fn test_ipv6_cidr_within_prefix_range() {
        let route = resolve_entry("fd00::/8").unwrap();
        assert_eq!(route.kind, RouteKind::Cidr);
        assert_eq!(route.prefix_len(), 8);
    }

    #[test]
    fn test_single_ip() {
        let route = resolve_entry("1.1.1.1").unwrap();
        assert_eq!(route.kind, RouteKind::SingleIp);
        assert_eq!(route.prefix_len(), 32);
        assert_eq!(route.to_string(), "1.1.1.1/32");

        assert_eq!(resolve_entry("999.1.1.1"), Err(RouteDirectiveError::InvalidAddress));
        assert_eq!(resolve_entry("1.1.1"), Err(RouteDirectiveError::Hostname));
        assert_eq!(resolve_entry("1.1.*.1"), Err(RouteDirectiveError::Hostname));
    }

    #[test]
    fn test_zero_padded_groups() {
        let route = resolve_entry("010.1.1.1").unwrap();
        assert_eq!(route.kind, RouteKind::SingleIp);
        assert_eq!(route.to_string(), "10.1.1.1/32");

        let route = resolve_entry("192.168.001.0/24").unwrap();
        assert_eq!(route.network, v4("192.168.1.0/24"));

        assert_eq!(resolve_entry("127.000.0.1"), Err(RouteDirectiveError::Loopback));
        assert_eq!(resolve_entry("010.1.1.256"), Err(RouteDirectiveError::InvalidAddress));
    }

    #[test]
    fn test_domains_skipped() {
        assert!(resolve(["example.com", "*.google.com", "", "api.internal"]).is_empty());
    }
}
