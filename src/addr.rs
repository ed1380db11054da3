//! Typed server endpoints and name resolution.
//!
//! Configured server strings are either `host:port` pairs or unix-socket
//! paths (anything containing a `/`). Both become a [`ServerAddr`]: a
//! network family tag plus the canonical string form that keys the pool
//! map and the hash ring.
//!
//! Resolution of a headless DNS name into a set of endpoints goes through
//! the [`Resolver`] trait so tests can substitute a fake for the system
//! resolver. The utilities here memoize nothing.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::ring::RingNode;

/// Network family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    Tcp,
    Unix,
}

impl AddrFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrFamily::Tcp => "tcp",
            AddrFamily::Unix => "unix",
        }
    }
}

/// A parsed server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    family: AddrFamily,
    repr: String,
}

impl ServerAddr {
    /// Parse a configured server string.
    ///
    /// Strings containing a `/` are unix-socket paths; everything else must
    /// be a `host:port` pair with a numeric port. Hostname resolution is
    /// deferred to dial time.
    pub fn parse(server: &str) -> Result<ServerAddr> {
        if server.is_empty() {
            return Err(Error::InvalidAddr(server.to_string()));
        }

        if server.contains('/') {
            return Ok(ServerAddr {
                family: AddrFamily::Unix,
                repr: server.to_string(),
            });
        }

        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddr(server.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(Error::InvalidAddr(server.to_string()));
        }

        Ok(ServerAddr {
            family: AddrFamily::Tcp,
            repr: server.to_string(),
        })
    }

    /// The endpoint's network family.
    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Canonical string form (`host:port` or the socket path).
    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr)
    }
}

impl RingNode for ServerAddr {
    fn canonical(&self) -> String {
        self.repr.clone()
    }
}

/// Joins a resolved IP with a port, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Turns a headless DNS name into the set of backend IPs.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a host name to its A/AAAA records, as strings.
    async fn lookup_host(&self, host: &str) -> Result<Vec<String>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<String>> {
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addrs.map(|sa| sa.ip().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = ServerAddr::parse("cache-1.internal:11211").unwrap();
        assert_eq!(addr.family(), AddrFamily::Tcp);
        assert_eq!(addr.as_str(), "cache-1.internal:11211");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = ServerAddr::parse("[::1]:11211").unwrap();
        assert_eq!(addr.family(), AddrFamily::Tcp);
    }

    #[test]
    fn test_parse_unix_path() {
        let addr = ServerAddr::parse("/var/run/memcached.sock").unwrap();
        assert_eq!(addr.family(), AddrFamily::Unix);
        assert_eq!(addr.as_str(), "/var/run/memcached.sock");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(matches!(
            ServerAddr::parse("cache-1.internal"),
            Err(Error::InvalidAddr(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(matches!(
            ServerAddr::parse("host:notaport"),
            Err(Error::InvalidAddr(_))
        ));
        assert!(matches!(
            ServerAddr::parse("host:70000"),
            Err(Error::InvalidAddr(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(ServerAddr::parse(""), Err(Error::InvalidAddr(_))));
        assert!(matches!(
            ServerAddr::parse(":11211"),
            Err(Error::InvalidAddr(_))
        ));
    }

    #[test]
    fn test_canonical_matches_input() {
        let addr = ServerAddr::parse("127.0.0.1:11211").unwrap();
        assert_eq!(addr.canonical(), "127.0.0.1:11211");
        assert_eq!(addr.to_string(), "127.0.0.1:11211");
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("10.0.0.1", 11211), "10.0.0.1:11211");
        assert_eq!(join_host_port("fe80::1", 11211), "[fe80::1]:11211");
    }

    #[test]
    fn test_family_names() {
        assert_eq!(AddrFamily::Tcp.as_str(), "tcp");
        assert_eq!(AddrFamily::Unix.as_str(), "unix");
    }
}
