//! Address Grammar
//!
//! Listening and target addresses share one textual form:
//! `[tcp://]HOST:PORT` or `[tcp://][V6]:PORT`. A listening address may also
//! be a bare `PORT`, which binds every IPv4 interface.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

const TCP_SCHEME: &str = "tcp://";

/// Reasons an address string is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("unsupported scheme in '{0}', only tcp:// is accepted")]
    UnsupportedScheme(String),
    #[error("missing port in '{0}'")]
    MissingPort(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("invalid host in '{0}'")]
    InvalidHost(String),
}

/// Host part of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    fn parse_host(host: &str, raw: &str) -> Result<Self, AddressError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(TargetAddr::Ipv4(ip));
        }
        // Dotted digits that failed to parse are a broken IPv4 literal, not a name
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(AddressError::InvalidHost(raw.to_string()));
        }
        if is_valid_domain(host) {
            Ok(TargetAddr::Domain(host.to_ascii_lowercase()))
        } else {
            Err(AddressError::InvalidHost(raw.to_string()))
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "[{}]", ip),
            TargetAddr::Domain(domain) => f.write_str(domain),
        }
    }
}

/// A host and port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: TargetAddr,
    pub port: u16,
}

impl Endpoint {
    /// Parse an address a connection will be made to. Port 0 is rejected.
    pub fn parse_target(input: &str) -> Result<Self, AddressError> {
        let endpoint = Self::parse_inner(input, false)?;
        if endpoint.port == 0 {
            return Err(AddressError::InvalidPort(input.to_string()));
        }
        Ok(endpoint)
    }

    /// Parse an address to listen on. Accepts a bare port and port 0.
    pub fn parse_listen(input: &str) -> Result<Self, AddressError> {
        Self::parse_inner(input, true)
    }

    /// The socket address when the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            TargetAddr::Ipv4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            TargetAddr::Ipv6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            TargetAddr::Domain(_) => None,
        }
    }

    fn parse_inner(input: &str, allow_bare_port: bool) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let rest = match trimmed.strip_prefix(TCP_SCHEME) {
            Some(rest) => rest,
            None if trimmed.contains("://") => {
                return Err(AddressError::UnsupportedScheme(input.to_string()))
            }
            None => trimmed,
        };

        if allow_bare_port && !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self {
                host: TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED),
                port: parse_port(rest, input)?,
            });
        }

        if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| AddressError::InvalidHost(input.to_string()))?;
            let ip = host
                .parse::<Ipv6Addr>()
                .map_err(|_| AddressError::InvalidHost(input.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| AddressError::MissingPort(input.to_string()))?;
            return Ok(Self {
                host: TargetAddr::Ipv6(ip),
                port: parse_port(port, input)?,
            });
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(input.to_string()))?;
        if host.contains(':') {
            // IPv6 literals must be bracketed
            return Err(AddressError::InvalidHost(input.to_string()));
        }

        Ok(Self {
            host: TargetAddr::parse_host(host, input)?,
            port: parse_port(port, input)?,
        })
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_target(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, AddressError> {
    if port.is_empty() {
        return Err(AddressError::MissingPort(raw.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(raw.to_string()))
}

fn is_valid_domain(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_target() {
        let ep = Endpoint::parse_target("127.0.0.1:8080").unwrap();
        assert_eq!(ep.host, TargetAddr::Ipv4(Ipv4Addr::LOCALHOST));
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.socket_addr(), Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_parse_with_tcp_scheme() {
        let ep = Endpoint::parse_target("tcp://example.com:443").unwrap();
        assert_eq!(ep.host, TargetAddr::Domain("example.com".to_string()));
        assert_eq!(ep.port, 443);
        assert_eq!(ep.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let ep = Endpoint::parse_target("[::1]:9000").unwrap();
        assert_eq!(ep.host, TargetAddr::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(ep.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_bare_port_only_for_listen() {
        let ep = Endpoint::parse_listen("8443").unwrap();
        assert_eq!(ep.host, TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ep.port, 8443);

        assert_eq!(
            Endpoint::parse_target("8443"),
            Err(AddressError::MissingPort("8443".to_string()))
        );
    }

    #[test]
    fn test_port_zero() {
        assert!(Endpoint::parse_listen("127.0.0.1:0").is_ok());
        assert!(matches!(
            Endpoint::parse_target("127.0.0.1:0"),
            Err(AddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Endpoint::parse_target("  "), Err(AddressError::Empty));
        assert!(matches!(
            Endpoint::parse_target("ssl://example.com:443"),
            Err(AddressError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("example.com:http"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("example.com:70000"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("::1:80"),
            Err(AddressError::InvalidHost(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("999.1.1.1:80"),
            Err(AddressError::InvalidHost(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("bad host!:80"),
            Err(AddressError::InvalidHost(_))
        ));
        assert!(matches!(
            Endpoint::parse_target("example.com:"),
            Err(AddressError::MissingPort(_))
        ));
    }
}
