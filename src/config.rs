//! Configuration consumed by the tunnel core.
//!
//! The CLI layer populates a [`TunnelConfig`]; everything below it only
//! looks at this struct. Misconfiguration is reported as [`ConfigError`]
//! so the binary can exit with status 2 instead of 1.

use std::os::fd::RawFd;

use thiserror::Error;

use crate::{DEFAULT_HANDSHAKE, HANDSHAKE_LEN};

/// Operating mode, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listen for TCP connections, relay decapsulated packets via UDP.
    Server,
    /// Listen for UDP datagrams, encapsulate them onto a TCP connection.
    Client,
}

/// Where the source sockets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The tunnel creates and binds its own sockets.
    Standalone,
    /// Pre-bound descriptors are inherited from the process manager
    /// (systemd-style socket activation, fds starting at 3).
    Inherited,
    /// A single already-established socket is on stdin (inetd-style).
    Stdio,
}

/// Fully-populated tunnel configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub role: Role,
    pub transport: Transport,
    /// Source address spec; absent in inherited/stdio transports.
    pub source: Option<String>,
    /// Destination address spec, always required.
    pub destination: String,
    /// Idle timeout in seconds, 0 meaning disabled. Applies to the TCP
    /// direction in server role and to the UDP direction in client role.
    pub timeout_secs: u64,
    /// Handshake token sent (client) or expected (server).
    pub handshake: [u8; HANDSHAKE_LEN],
}

impl TunnelConfig {
    pub fn new(role: Role, transport: Transport, destination: String) -> Self {
        TunnelConfig {
            role,
            transport,
            source: None,
            destination,
            timeout_secs: 0,
            handshake: DEFAULT_HANDSHAKE,
        }
    }

    /// Replaces the default handshake token, padding shorter tokens with
    /// NUL bytes the way the default token itself is padded.
    pub fn set_handshake(&mut self, token: &[u8]) -> Result<(), ConfigError> {
        if token.len() > HANDSHAKE_LEN {
            return Err(ConfigError::HandshakeTooLong(token.len()));
        }
        let mut padded = [0u8; HANDSHAKE_LEN];
        padded[..token.len()].copy_from_slice(token);
        self.handshake = padded;
        Ok(())
    }
}

/// Start-up misconfiguration. These all map to exit status 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing port in '{0}'!")]
    MissingPort(String),
    #[error("Missing address or port in '{0}'!")]
    MissingAddress(String),
    #[error("Invalid port in '{0}'!")]
    InvalidPort(String),
    #[error("Expected {expected} address argument(s), got {got}")]
    AddressCount { expected: usize, got: usize },
    #[error("UDP socket activation supports a single socket")]
    ActivationCount,
    #[error("Socket activation passed no descriptors")]
    ActivationEmpty,
    #[error("Socket activation fd {0} is not a valid {1} socket")]
    ActivationFdType(RawFd, &'static str),
    #[error("Standard input is not a valid {0} socket")]
    StdioFdType(&'static str),
    #[error("Handshake token is {0} bytes, the maximum is {HANDSHAKE_LEN}")]
    HandshakeTooLong(usize),
}
