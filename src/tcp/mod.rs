//! TCP side of the tunnel.
//!
//! This module owns the listening-socket factory and the client connect
//! path, plus the channel types the acceptor uses to hand accepted
//! connections to the session supervisor.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::info;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::addr::{parse_addr_spec, resolve};

pub mod acceptor;
pub mod framer;

const LISTEN_BACKLOG: i32 = 128;

/// An accepted connection on its way to a relay session.
pub struct ConnRequest {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// Messages from the per-listener accept tasks to the supervisor.
pub enum ConnMessage {
    /// A connection was accepted; ownership of the stream moves with it.
    Incoming(ConnRequest),
    /// An accept call failed for real. Fatal to the whole server.
    Failed(std::io::Error),
}

pub type ConnSender = Sender<ConnMessage>;
pub type ConnReceiver = Receiver<ConnMessage>;

/// The listening sockets of a server, one per resolved address family.
#[derive(Debug)]
pub struct ListenerSet(Vec<TcpListener>);

impl ListenerSet {
    pub fn new(listeners: Vec<TcpListener>) -> Self {
        ListenerSet(listeners)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bound addresses, mostly useful when listening on port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.0.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    pub fn into_inner(self) -> Vec<TcpListener> {
        self.0
    }
}

/// Creates listening sockets for every address the spec resolves to,
/// giving a dual-stack set when both families are available. A port is
/// required. Socket creation failures skip that address; bind or listen
/// failures are fatal, as is ending up with no socket at all.
pub async fn tcp_listeners(spec: &str) -> Result<ListenerSet> {
    let parsed = parse_addr_spec(spec);
    let port = parsed.require_port(spec)?;
    let addrs = resolve(parsed.host, port, true).await?;

    let mut listeners = Vec::new();
    for addr in addrs {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(socket) => socket,
            // Typically an address family the kernel does not support.
            Err(_) => continue,
        };
        if addr.is_ipv6() {
            // One socket per family; leave IPv4 to its own listener.
            socket.set_only_v6(true).context("setsockopt(IPV6_V6ONLY)")?;
        }
        socket.set_reuse_address(true).context("setsockopt(SO_REUSEADDR)")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("Cannot bind to {addr}"))?;
        socket.listen(LISTEN_BACKLOG).context("listen")?;
        socket.set_nonblocking(true).context("set_nonblocking")?;

        let listener = TcpListener::from_std(socket.into())?;
        info!("Listening for TCP connections on {}", listener.local_addr()?);
        listeners.push(listener);
    }

    if listeners.is_empty() {
        anyhow::bail!("No listening socket could be created for '{spec}'");
    }
    Ok(ListenerSet::new(listeners))
}

/// Connects to the spec's host and port, trying each resolved address in
/// order. Both components are required; running out of addresses is
/// fatal, with no retry.
pub async fn tcp_client(spec: &str) -> Result<TcpStream> {
    let parsed = parse_addr_spec(spec);
    let (host, port) = parsed.require_host_port(spec)?;
    let addrs = resolve(Some(host), port, false).await?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!("TCP connection opened to {addr}");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("Cannot connect to {spec}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_requires_a_port() {
        let err = tcp_listeners("localhost").await.unwrap_err();
        assert!(err.downcast_ref::<crate::ConfigError>().is_some());
    }

    #[tokio::test]
    async fn client_requires_host_and_port() {
        let err = tcp_client("8080").await.unwrap_err();
        assert!(err.downcast_ref::<crate::ConfigError>().is_some());
    }

    #[tokio::test]
    async fn listeners_cover_available_families() {
        let set = tcp_listeners("0").await.unwrap();
        assert!(!set.is_empty());
        assert!(set.len() <= 2);
        let addrs = set.local_addrs();
        if addrs.len() == 2 {
            assert!(addrs.iter().any(|a| a.is_ipv6()));
            assert!(addrs.iter().any(|a| a.is_ipv4()));
        }
        // Every listener in the set must accept on its own. A bound v6
        // wildcard with no usable loopback route can happen on hosts
        // with IPv6 switched off; only a successful connect must be
        // matched by an accept.
        for listener in set.into_inner() {
            let addr = listener.local_addr().unwrap();
            let target = if addr.is_ipv6() {
                format!("[::1]:{}", addr.port())
            } else {
                format!("127.0.0.1:{}", addr.port())
            };
            match TcpStream::connect(target.as_str()).await {
                Ok(_client) => {
                    listener.accept().await.unwrap();
                }
                Err(_) => assert!(addr.is_ipv6()),
            }
        }
    }

    #[tokio::test]
    async fn client_connects_to_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spec = listener.local_addr().unwrap().to_string();
        let (connect, accept) = tokio::join!(tcp_client(&spec), listener.accept());
        connect.unwrap();
        accept.unwrap();
    }
}
