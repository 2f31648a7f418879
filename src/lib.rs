//! Tunnel UDP datagrams over a TCP connection.
//!
//! The tunnel runs in one of two mirrored roles. A server listens for TCP
//! connections and relays the encapsulated packets to a UDP destination; a
//! client listens for UDP datagrams and encapsulates them onto a TCP
//! connection to a server.
//!
//! The TCP stream carries a fixed 32-byte handshake token (sent by the
//! client, verified by the server) followed by length-prefixed frames:
//! a 2-byte big-endian payload length and then the raw UDP payload.
//! The handshake identifies a tunnel peer; it is not a cryptographic
//! credential and provides no confidentiality or integrity.

pub mod activation;
pub mod addr;
pub mod config;
pub mod relay;
pub mod tcp;
pub mod udp;

pub use config::{ConfigError, Role, Transport, TunnelConfig};
pub use relay::{Session, SessionEnd};

/// Size of the per-session TCP reassembly buffer. Large enough to hold a
/// maximum-size frame (length prefix included) after compaction.
pub const TCP_BUFFER_SIZE: usize = 65536;

/// Largest UDP payload that fits in one frame next to its 2-byte prefix.
pub const MAX_UDP_PAYLOAD: usize = TCP_BUFFER_SIZE - 2;

/// Length of the handshake token exchanged at the start of a connection.
pub const HANDSHAKE_LEN: usize = 32;

/// Default handshake token. An opaque constant shared by both roles; the
/// server compares it byte for byte before accepting any frame.
pub const DEFAULT_HANDSHAKE: [u8; HANDSHAKE_LEN] =
    *b"udptunnel by md.\0\0\0\x01\x03\x06\x10\x15\x21\x28\x36\x45\x55\x66\x78\x91";
