//! UDP side of the tunnel.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::net::UdpSocket;

use crate::addr::{parse_addr_spec, resolve};

/// Binds a UDP socket on the spec's address. A port is required. The
/// resolved addresses are tried in order and the first one that binds
/// wins; UDP needs no dual-stack set since a single socket serves the
/// tunnel's one peer.
pub async fn udp_listener(spec: &str) -> Result<UdpSocket> {
    let parsed = parse_addr_spec(spec);
    let port = parsed.require_port(spec)?;
    let addrs = resolve(parsed.host, port, true).await?;

    let mut last_err = None;
    for addr in addrs {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                info!("Listening for UDP connections on {}", socket.local_addr()?);
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("Cannot bind to {spec}"))
}

/// Opens an unconnected UDP socket for talking to the spec's host and
/// port, both required. UDP is connectionless, so nothing is sent here;
/// the resolved peer address is returned for later `send_to` calls.
pub async fn udp_client(spec: &str) -> Result<(UdpSocket, SocketAddr)> {
    let parsed = parse_addr_spec(spec);
    let (host, port) = parsed.require_host_port(spec)?;
    let addrs = resolve(Some(host), port, false).await?;

    let mut last_err = None;
    for peer in addrs {
        // Ephemeral local port in the peer's family.
        let local: SocketAddr = if peer.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        match UdpSocket::bind(local).await {
            Ok(socket) => {
                debug!("The UDP destination is {peer}");
                return Ok((socket, peer));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("Cannot open a UDP socket for {spec}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_requires_a_port() {
        let err = udp_listener("localhost").await.unwrap_err();
        assert!(err.downcast_ref::<crate::ConfigError>().is_some());
    }

    #[tokio::test]
    async fn listener_binds_first_usable_address() {
        let socket = udp_listener("127.0.0.1:0").await.unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
    }

    #[tokio::test]
    async fn client_requires_host_and_port() {
        let err = udp_client("5353").await.unwrap_err();
        assert!(err.downcast_ref::<crate::ConfigError>().is_some());
    }

    #[tokio::test]
    async fn client_resolves_peer_without_connecting() {
        let (socket, peer) = udp_client("127.0.0.1:5353").await.unwrap();
        assert_eq!(peer, "127.0.0.1:5353".parse().unwrap());
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
