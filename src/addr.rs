//! Address spec parsing and resolution.
//!
//! A spec is a free-form `[host]:port`, `host:port` or `port` string.
//! Parsing never fails; the socket factories decide which of the two
//! components they require and report what is missing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Context, Result};

use crate::config::ConfigError;

/// Host and port components of an address spec. Either may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpec<'a> {
    pub host: Option<&'a str>,
    pub port: Option<&'a str>,
}

/// Splits an address spec into host and port.
///
/// Bracketed IPv6 literals keep their port; an unbracketed literal with
/// more than one colon is taken as a bare host, since splitting it would
/// be ambiguous. A string with no colon at all is a port when it is all
/// digits and a host otherwise.
pub fn parse_addr_spec(spec: &str) -> AddrSpec<'_> {
    fn non_empty(s: &str) -> Option<&str> {
        (!s.is_empty()).then_some(s)
    }

    if spec.is_empty() {
        return AddrSpec { host: None, port: None };
    }

    if let Some(rest) = spec.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = non_empty(&rest[..close]);
            let after = &rest[close + 1..];
            let port = after.strip_prefix(':').and_then(non_empty);
            return AddrSpec { host, port };
        }
    }

    match spec.find(':') {
        // A second colon means an unbracketed IPv6 literal: never split.
        Some(first) if spec[first + 1..].contains(':') => {
            AddrSpec { host: Some(spec), port: None }
        }
        Some(first) => AddrSpec {
            host: non_empty(&spec[..first]),
            port: non_empty(&spec[first + 1..]),
        },
        None if spec.bytes().all(|b| b.is_ascii_digit()) => {
            AddrSpec { host: None, port: Some(spec) }
        }
        None => AddrSpec { host: Some(spec), port: None },
    }
}

impl AddrSpec<'_> {
    /// Port component as a number, or the ConfigError naming the spec.
    pub fn require_port(&self, spec: &str) -> Result<u16, ConfigError> {
        let port = self.port.ok_or_else(|| ConfigError::MissingPort(spec.to_string()))?;
        port.parse().map_err(|_| ConfigError::InvalidPort(spec.to_string()))
    }

    /// Host and port, for specs naming a remote peer.
    pub fn require_host_port(&self, spec: &str) -> Result<(&str, u16), ConfigError> {
        let host = self.host.ok_or_else(|| ConfigError::MissingAddress(spec.to_string()))?;
        let port = self
            .port
            .ok_or_else(|| ConfigError::MissingAddress(spec.to_string()))?
            .parse()
            .map_err(|_| ConfigError::InvalidPort(spec.to_string()))?;
        Ok((host, port))
    }
}

/// Resolves a host to socket addresses. A missing host with `passive`
/// set yields the unspecified address of both families, so listeners can
/// cover IPv4 and IPv6 at once. Resolution failure is fatal and names
/// the offending `host:port`.
pub async fn resolve(host: Option<&str>, port: u16, passive: bool) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = match host {
        None if passive => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ],
        None => bail!("no host to resolve for port {port}"),
        Some(host) => match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .with_context(|| format!("Cannot resolve {host}:{port}"))?
                .collect(),
        },
    };

    if addrs.is_empty() {
        let host = host.unwrap_or("");
        bail!("Cannot resolve {host}:{port}: no addresses returned");
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(spec: &str) -> (Option<&str>, Option<&str>) {
        let parsed = parse_addr_spec(spec);
        (parsed.host, parsed.port)
    }

    #[test]
    fn port_only() {
        assert_eq!(parts("8080"), (None, Some("8080")));
    }

    #[test]
    fn ipv4_with_port() {
        assert_eq!(parts("192.0.2.1:8080"), (Some("192.0.2.1"), Some("8080")));
    }

    #[test]
    fn hostname_with_port() {
        assert_eq!(parts("example.com:8080"), (Some("example.com"), Some("8080")));
    }

    #[test]
    fn bracketed_ipv6_with_port() {
        assert_eq!(parts("[2001:db8::1]:8080"), (Some("2001:db8::1"), Some("8080")));
    }

    #[test]
    fn bracketed_ipv6_without_port() {
        assert_eq!(parts("[2001:db8::1]"), (Some("2001:db8::1"), None));
        assert_eq!(parts("[2001:db8::1]:"), (Some("2001:db8::1"), None));
    }

    #[test]
    fn unbracketed_ipv6_is_never_split() {
        assert_eq!(parts("2001:db8::1"), (Some("2001:db8::1"), None));
        assert_eq!(parts("::1"), (Some("::1"), None));
    }

    #[test]
    fn empty_string() {
        assert_eq!(parts(""), (None, None));
    }

    #[test]
    fn hostname_only() {
        assert_eq!(parts("example.com"), (Some("example.com"), None));
    }

    #[test]
    fn empty_segments() {
        assert_eq!(parts(":8080"), (None, Some("8080")));
        assert_eq!(parts("example.com:"), (Some("example.com"), None));
        assert_eq!(parts(":"), (None, None));
    }

    #[test]
    fn require_port_errors() {
        assert!(matches!(
            parse_addr_spec("example.com").require_port("example.com"),
            Err(ConfigError::MissingPort(_))
        ));
        assert!(matches!(
            parse_addr_spec("example.com:http").require_port("example.com:http"),
            Err(ConfigError::InvalidPort(_))
        ));
        assert_eq!(parse_addr_spec("9000").require_port("9000").unwrap(), 9000);
    }

    #[test]
    fn require_host_port_errors() {
        assert!(matches!(
            parse_addr_spec("8080").require_host_port("8080"),
            Err(ConfigError::MissingAddress(_))
        ));
        assert_eq!(
            parse_addr_spec("[::1]:53").require_host_port("[::1]:53").unwrap(),
            ("::1", 53)
        );
    }

    #[tokio::test]
    async fn resolve_passive_without_host_covers_both_families() {
        let addrs = resolve(None, 9000, true).await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().any(|a| a.is_ipv6()));
        assert!(addrs.iter().any(|a| a.is_ipv4()));
        assert!(addrs.iter().all(|a| a.port() == 9000));
    }

    #[tokio::test]
    async fn resolve_literal_skips_lookup() {
        let addrs = resolve(Some("192.0.2.7"), 53, false).await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7:53".parse().unwrap()]);
    }
}
