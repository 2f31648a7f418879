//! The per-connection relay engine.
//!
//! A [`Session`] owns one TCP stream and one UDP socket and moves
//! datagrams between them: UDP datagrams are encapsulated as
//! length-prefixed frames on the stream, and parsed frames coming back
//! are sent out as datagrams. The loop is single-tasked and cooperative;
//! exactly one readiness wait and one I/O step run per iteration.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::tcp::framer::{FramerEvent, StreamFramer};
use crate::{HANDSHAKE_LEN, MAX_UDP_PAYLOAD};

/// The tunnel direction whose idle timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Udp,
    Tcp,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Udp => "UDP",
            Direction::Tcp => "TCP",
        }
    }
}

/// Why a session ended. All of these are orderly shutdowns, not faults;
/// faults surface as errors from [`Session::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The TCP peer closed the connection.
    PeerClosed,
    /// The peer's handshake token did not match.
    BadHandshake,
    /// No traffic arrived on the given direction within its timeout.
    IdleTimeout(Direction),
}

/// How often the loop wakes to check idle timers when any are armed.
const TIMEOUT_TICK: Duration = Duration::from_secs(10);

/// One tunnel connection: sockets, peer address, parser and timers.
pub struct Session {
    tcp: TcpStream,
    udp: UdpSocket,
    /// Where decapsulated packets go. The server resolves this up front;
    /// the client learns it from the first datagram it receives.
    peer: Option<SocketAddr>,
    udp_timeout: Option<Duration>,
    tcp_timeout: Option<Duration>,
    framer: StreamFramer,
    tick: Duration,
}

impl Session {
    /// Client-role session: the peer is learned lazily and incoming
    /// frames need no handshake. The idle timeout covers the UDP side.
    pub fn client(tcp: TcpStream, udp: UdpSocket, timeout: Option<Duration>) -> Self {
        Session {
            tcp,
            udp,
            peer: None,
            udp_timeout: timeout,
            tcp_timeout: None,
            framer: StreamFramer::new(),
            tick: TIMEOUT_TICK,
        }
    }

    /// Server-role session: decapsulated packets go to the resolved
    /// `peer`, the stream must open with `handshake`, and the idle
    /// timeout covers the TCP side.
    pub fn server(
        tcp: TcpStream,
        udp: UdpSocket,
        peer: SocketAddr,
        handshake: [u8; HANDSHAKE_LEN],
        timeout: Option<Duration>,
    ) -> Self {
        Session {
            tcp,
            udp,
            peer: Some(peer),
            udp_timeout: None,
            tcp_timeout: timeout,
            framer: StreamFramer::with_handshake(handshake),
            tick: TIMEOUT_TICK,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
    }

    /// Writes the 32-byte token once, before the loop starts. Client
    /// role only; failure here is fatal.
    pub async fn send_handshake(&mut self, handshake: &[u8; HANDSHAKE_LEN]) -> Result<()> {
        self.tcp.write_all(handshake).await.context("send(tcp, handshake)")
    }

    /// Runs the relay loop to completion. `Ok` is an orderly end (peer
    /// close, idle timeout, bad handshake); `Err` is a session fault.
    pub async fn run(self) -> Result<SessionEnd> {
        let Session { tcp, udp, mut peer, udp_timeout, tcp_timeout, mut framer, tick } = self;

        let mut last_udp = udp_timeout.map(|_| Instant::now());
        let mut last_tcp = tcp_timeout.map(|_| Instant::now());
        let track_idle = last_udp.is_some() || last_tcp.is_some();
        let mut udp_buf = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick), if track_idle => {
                    if let Some(end) = check_timeout(last_udp, udp_timeout, Direction::Udp) {
                        return Ok(end);
                    }
                    if let Some(end) = check_timeout(last_tcp, tcp_timeout, Direction::Tcp) {
                        return Ok(end);
                    }
                }

                ready = tcp.readable() => {
                    ready.context("read(tcp)")?;
                    match tcp_to_udp(&tcp, &udp, &mut framer, peer).await? {
                        TcpStep::Continue => {}
                        TcpStep::PeerClosed => {
                            info!("Remote closed the connection");
                            return Ok(SessionEnd::PeerClosed);
                        }
                        TcpStep::BadHandshake => {
                            info!("Received a bad handshake, exiting");
                            return Ok(SessionEnd::BadHandshake);
                        }
                    }
                    if let Some(t) = last_tcp.as_mut() {
                        *t = Instant::now();
                    }
                }

                received = udp.recv_from(&mut udp_buf) => {
                    let (len, from) = received.context("recv_from(udp)")?;
                    // Any datagram counts as activity, even an empty
                    // keepalive that is otherwise discarded.
                    if let Some(t) = last_udp.as_mut() {
                        *t = Instant::now();
                    }
                    if len == 0 {
                        continue; // ignore empty packets
                    }
                    // Remember the sender so decapsulated replies can
                    // find their way back.
                    peer = Some(from);
                    debug!("Received a {len} bytes UDP packet from {from}");

                    let mut frame = BytesMut::with_capacity(len + 2);
                    frame.put_u16(len as u16);
                    frame.extend_from_slice(&udp_buf[..len]);
                    write_stream(&tcp, &frame).await.context("send(tcp)")?;
                }
            }
        }
    }
}

fn check_timeout(
    last: Option<Instant>,
    limit: Option<Duration>,
    direction: Direction,
) -> Option<SessionEnd> {
    let (last, limit) = (last?, limit?);
    if last.elapsed() > limit {
        info!(
            "Exiting after a {}s timeout for {} input",
            limit.as_secs(),
            direction.label()
        );
        return Some(SessionEnd::IdleTimeout(direction));
    }
    None
}

enum TcpStep {
    Continue,
    PeerClosed,
    BadHandshake,
}

/// One read-and-parse step: pulls whatever the socket has into the
/// framer and forwards every completed frame as a UDP datagram.
async fn tcp_to_udp(
    tcp: &TcpStream,
    udp: &UdpSocket,
    framer: &mut StreamFramer,
    peer: Option<SocketAddr>,
) -> Result<TcpStep> {
    let read = match tcp.try_read(framer.free_space()) {
        Ok(0) => return Ok(TcpStep::PeerClosed),
        Ok(n) => n,
        // Readiness was spurious; wait again.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(TcpStep::Continue),
        Err(e) => return Err(e).context("read(tcp)"),
    };
    framer.commit(read);

    loop {
        match framer.next_event() {
            Ok(Some(FramerEvent::HandshakeVerified)) => debug!("Received a good handshake"),
            Ok(Some(FramerEvent::Packet(payload))) => {
                send_udp_packet(udp, peer, &payload).await?;
            }
            Ok(None) => return Ok(TcpStep::Continue),
            Err(_) => return Ok(TcpStep::BadHandshake),
        }
    }
}

/// Sends one decapsulated payload to the current UDP peer. A frame that
/// arrives before any peer is known is dropped, and a refused
/// destination is ignored: UDP promises neither delivery nor a
/// listening peer.
async fn send_udp_packet(udp: &UdpSocket, peer: Option<SocketAddr>, payload: &[u8]) -> Result<()> {
    let Some(peer) = peer else {
        info!("Ignoring a packet for a still unknown UDP destination!");
        return Ok(());
    };
    match udp.send_to(payload, peer).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            info!("send_to(udp) returned ECONNREFUSED: ignored");
            Ok(())
        }
        Err(e) => Err(e).context("send_to(udp)"),
    }
}

/// Writes the whole buffer through the readiness API, so the stream can
/// stay behind a shared reference inside the select loop.
async fn write_stream(tcp: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        tcp.writable().await?;
        match tcp.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
