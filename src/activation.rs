//! Pre-opened sockets handed over by a process manager.
//!
//! Two hand-off styles are supported: systemd-style socket activation,
//! where `LISTEN_PID`/`LISTEN_FDS` describe pre-bound descriptors
//! starting at fd 3, and inetd-style, where the already-established
//! socket sits on stdin. The server role takes one or more listening
//! stream sockets; the client role takes exactly one datagram socket.
//! The asymmetry is deliberate: a stream listener per address family
//! makes sense, a second datagram socket never does.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use socket2::{Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::ConfigError;
use crate::tcp::ListenerSet;

/// First descriptor passed by socket activation, after stdio.
const LISTEN_FDS_START: RawFd = 3;

fn inherited_count() -> Option<RawFd> {
    let listen_pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if listen_pid != std::process::id() {
        return None;
    }
    let count: RawFd = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    (count > 0).then_some(count)
}

/// Whether socket activation is in effect for this process. Does not
/// claim the descriptors.
pub fn activation_pending() -> bool {
    inherited_count().is_some()
}

/// Descriptors passed via the socket-activation protocol, if any.
/// Returns `None` when activation is not in effect or the variables
/// were meant for a different process. Call at most once: the returned
/// handles own the descriptors.
pub fn inherited_descriptors() -> Option<Vec<OwnedFd>> {
    let count = inherited_count()?;
    let fds = (LISTEN_FDS_START..LISTEN_FDS_START + count)
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    Some(fds)
}

/// Validates inherited descriptors as listening stream sockets, one or
/// more, and wraps them into a listener set.
pub fn tcp_listeners_from(fds: Vec<OwnedFd>) -> Result<ListenerSet> {
    let mut listeners = Vec::with_capacity(fds.len());
    for fd in fds {
        let raw = fd.as_raw_fd();
        let socket = Socket::from(fd);
        if !is_stream(&socket)? || !socket.is_listener().unwrap_or(false) {
            return Err(ConfigError::ActivationFdType(raw, "TCP listening").into());
        }
        socket.set_nonblocking(true).context("set_nonblocking")?;
        listeners.push(TcpListener::from_std(socket.into())?);
    }
    if listeners.is_empty() {
        return Err(ConfigError::ActivationEmpty.into());
    }
    Ok(ListenerSet::new(listeners))
}

/// Validates inherited descriptors as exactly one datagram socket.
pub fn udp_socket_from(mut fds: Vec<OwnedFd>) -> Result<UdpSocket> {
    if fds.len() != 1 {
        return Err(ConfigError::ActivationCount.into());
    }
    let fd = fds.remove(0);
    let raw = fd.as_raw_fd();
    let socket = Socket::from(fd);
    if is_stream(&socket)? {
        return Err(ConfigError::ActivationFdType(raw, "UDP").into());
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// The inetd-style connected stream on stdin.
pub fn stdio_stream() -> Result<TcpStream> {
    let socket = Socket::from(clone_stdin()?);
    if !is_stream(&socket)? {
        return Err(ConfigError::StdioFdType("TCP").into());
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    Ok(TcpStream::from_std(socket.into())?)
}

/// The inetd-style bound datagram socket on stdin.
pub fn stdio_datagram() -> Result<UdpSocket> {
    let socket = Socket::from(clone_stdin()?);
    if is_stream(&socket)? {
        return Err(ConfigError::StdioFdType("UDP").into());
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn clone_stdin() -> Result<OwnedFd> {
    let stdin = unsafe { BorrowedFd::borrow_raw(0) };
    stdin.try_clone_to_owned().context("dup(stdin)")
}

fn is_stream(socket: &Socket) -> Result<bool> {
    let kind = socket.r#type().context("getsockopt(SO_TYPE)")?;
    Ok(kind == Type::STREAM)
}
