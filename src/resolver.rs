// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! Name resolution collaborators of the code generator.
//!
//! The compiler never talks to the network itself: hostname lookups go through the [`Resolver`]
//! trait supplied by the caller, which also owns deadlines and cancellation. Tests plug in a
//! static map; production code can use [`SystemResolver`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use crate::error::ResolveError;

/// Addresses a hostname resolved to, split by family. Either list may be empty; a host with
/// neither an A nor a AAAA record is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedHost {
    /// IPv4 (A record) addresses, in answer order.
    pub v4: Vec<Ipv4Addr>,
    /// IPv6 (AAAA record) addresses, in answer order.
    pub v6: Vec<Ipv6Addr>,
}

impl ResolvedHost {
    /// True when the lookup produced no address at all.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Maps a textual host identifier to its addresses.
///
/// Resolution is the only blocking operation in a compile; implementations must bound it with
/// their own deadline and surface cancellation as [`ResolveError::Cancelled`].
pub trait Resolver {
    /// Look up `host`, returning its A and AAAA addresses.
    fn resolve(&self, host: &str) -> Result<ResolvedHost, ResolveError>;
}

/// Resolver backed by the operating system's lookup machinery.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<ResolvedHost, ResolveError> {
        log::trace!("resolving {host} through the system resolver");
        let addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| ResolveError::Other(e.to_string()))?;
        let mut resolved = ResolvedHost::default();
        for addr in addrs {
            match addr.ip() {
                IpAddr::V4(v4) => resolved.v4.push(v4),
                IpAddr::V6(v6) => resolved.v6.push(v6),
            }
        }
        if resolved.is_empty() {
            return Err(ResolveError::NotFound(host.to_string()));
        }
        Ok(resolved)
    }
}

/// Well-known service names accepted as port identifiers. Lookups are case-sensitive, matching
/// the qualifier tables.
const SERVICES: &[(&str, u16)] = &[
    ("echo", 7),
    ("ftp-data", 20),
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("bootps", 67),
    ("bootpc", 68),
    ("tftp", 69),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("snmp", 161),
    ("ldap", 389),
    ("https", 443),
    ("syslog", 514),
];

/// Map a service name to its well-known port number.
pub fn lookup_service(name: &str) -> Option<u16> {
    SERVICES
        .iter()
        .find(|(service, _)| *service == name)
        .map(|&(_, port)| port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_service() {
        assert_eq!(lookup_service("ssh"), Some(22));
        assert_eq!(lookup_service("ftp"), Some(21));
        assert_eq!(lookup_service("ftp-data"), Some(20));
        assert_eq!(lookup_service("domain"), Some(53));
        assert_eq!(lookup_service("no-such-service"), None);
        // Case-sensitive by design.
        assert_eq!(lookup_service("SSH"), None);
    }
}
