//! Resumable parser for the tunnel's TCP stream.
//!
//! The stream is an optional 32-byte handshake token followed by frames
//! of a 2-byte big-endian length and that many payload bytes. Reads can
//! be fragmented at arbitrary boundaries, so the parser keeps unconsumed
//! bytes in a fixed reassembly buffer and resumes where it left off.

use bytes::Bytes;
use thiserror::Error;

use crate::{HANDSHAKE_LEN, TCP_BUFFER_SIZE};

const LENGTH_PREFIX: usize = 2;

/// The peer's first 32 bytes did not match the expected token.
#[derive(Debug, Error)]
#[error("Received a bad handshake")]
pub struct BadHandshake;

/// One parsed unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    /// The handshake token matched. Emitted at most once per stream.
    HandshakeVerified,
    /// A complete decapsulated UDP payload, possibly empty.
    Packet(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHandshake,
    ReadingLength,
    ReadingPacket,
}

/// Stream reassembly state machine.
///
/// Bytes are appended through [`free_space`](Self::free_space) and
/// [`commit`](Self::commit), then [`next_event`](Self::next_event) is
/// polled until it returns `None`. The buffer is compacted after every
/// completed frame, so `packet_start <= filled <= TCP_BUFFER_SIZE` holds
/// and a maximum-size frame always fits.
pub struct StreamFramer {
    buf: Box<[u8]>,
    /// Start of the in-progress frame.
    packet_start: usize,
    /// First unwritten byte.
    filled: usize,
    /// Bytes the current state needs before it can consume.
    expected: usize,
    state: State,
    handshake: [u8; HANDSHAKE_LEN],
}

impl StreamFramer {
    /// Parser for an already-authenticated stream (client role).
    pub fn new() -> Self {
        Self::build(State::ReadingLength, LENGTH_PREFIX, [0u8; HANDSHAKE_LEN])
    }

    /// Parser that verifies `handshake` before accepting frames
    /// (server role).
    pub fn with_handshake(handshake: [u8; HANDSHAKE_LEN]) -> Self {
        Self::build(State::ReadingHandshake, HANDSHAKE_LEN, handshake)
    }

    fn build(state: State, expected: usize, handshake: [u8; HANDSHAKE_LEN]) -> Self {
        StreamFramer {
            buf: vec![0u8; TCP_BUFFER_SIZE].into_boxed_slice(),
            packet_start: 0,
            filled: 0,
            expected,
            state,
            handshake,
        }
    }

    /// The writable tail of the reassembly buffer. Never empty: frames
    /// never outgrow the buffer, and compaction reclaims consumed bytes.
    pub fn free_space(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Records `n` bytes written into [`free_space`](Self::free_space).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    /// Consumes buffered bytes until one event is produced or more input
    /// is needed.
    pub fn next_event(&mut self) -> Result<Option<FramerEvent>, BadHandshake> {
        loop {
            if self.filled - self.packet_start < self.expected {
                return Ok(None);
            }

            match self.state {
                State::ReadingHandshake => {
                    let token = &self.buf[self.packet_start..self.packet_start + HANDSHAKE_LEN];
                    if token != &self.handshake[..] {
                        return Err(BadHandshake);
                    }
                    self.packet_start += HANDSHAKE_LEN;
                    self.state = State::ReadingLength;
                    self.expected = LENGTH_PREFIX;
                    // Reclaim the token's 32 bytes now, otherwise a
                    // maximum-size first frame could not fit.
                    self.compact();
                    return Ok(Some(FramerEvent::HandshakeVerified));
                }
                State::ReadingLength => {
                    let prefix = [self.buf[self.packet_start], self.buf[self.packet_start + 1]];
                    self.expected = u16::from_be_bytes(prefix) as usize;
                    self.packet_start += LENGTH_PREFIX;
                    self.state = State::ReadingPacket;
                }
                State::ReadingPacket => {
                    let payload = Bytes::copy_from_slice(
                        &self.buf[self.packet_start..self.packet_start + self.expected],
                    );
                    self.packet_start += self.expected;
                    self.state = State::ReadingLength;
                    self.expected = LENGTH_PREFIX;
                    self.compact();
                    return Ok(Some(FramerEvent::Packet(payload)));
                }
            }
        }
    }

    /// Moves the unconsumed tail down to the buffer origin.
    fn compact(&mut self) {
        if self.packet_start == 0 {
            return;
        }
        self.buf.copy_within(self.packet_start..self.filled, 0);
        self.filled -= self.packet_start;
        self.packet_start = 0;
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_HANDSHAKE, MAX_UDP_PAYLOAD};

    fn encode_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    /// Feeds `stream` in `chunk`-sized pieces and collects every event.
    fn feed_chunked(
        framer: &mut StreamFramer,
        stream: &[u8],
        chunk: usize,
    ) -> Result<Vec<FramerEvent>, BadHandshake> {
        let mut events = Vec::new();
        for piece in stream.chunks(chunk) {
            let mut piece = piece;
            while !piece.is_empty() {
                let space = framer.free_space();
                let n = space.len().min(piece.len());
                space[..n].copy_from_slice(&piece[..n]);
                framer.commit(n);
                piece = &piece[n..];
                while let Some(event) = framer.next_event()? {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    #[test]
    fn round_trip_survives_arbitrary_chunking() {
        let payloads: Vec<Vec<u8>> = vec![
            b"hello".to_vec(),
            vec![],
            vec![0xab; 1000],
            b"x".to_vec(),
            (0..=255).collect(),
        ];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&encode_frame(p));
        }

        for chunk in [1, 2, 3, 7, 64, 1499, stream.len()] {
            let mut framer = StreamFramer::new();
            let events = feed_chunked(&mut framer, &stream, chunk).unwrap();
            let got: Vec<&[u8]> = events
                .iter()
                .map(|e| match e {
                    FramerEvent::Packet(p) => p.as_ref(),
                    other => panic!("unexpected event {other:?}"),
                })
                .collect();
            assert_eq!(got, payloads.iter().map(|p| p.as_slice()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn good_handshake_split_across_reads() {
        let mut stream = DEFAULT_HANDSHAKE.to_vec();
        stream.extend_from_slice(&encode_frame(b"payload"));

        let mut framer = StreamFramer::with_handshake(DEFAULT_HANDSHAKE);
        let events = feed_chunked(&mut framer, &stream, 5).unwrap();
        assert_eq!(events[0], FramerEvent::HandshakeVerified);
        assert_eq!(events[1], FramerEvent::Packet(Bytes::from_static(b"payload")));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn single_flipped_token_byte_is_rejected() {
        let mut stream = DEFAULT_HANDSHAKE.to_vec();
        stream[31] ^= 0x01;
        stream.extend_from_slice(&encode_frame(b"ignored"));

        let mut framer = StreamFramer::with_handshake(DEFAULT_HANDSHAKE);
        assert!(feed_chunked(&mut framer, &stream, 4).is_err());
    }

    #[test]
    fn handshake_not_required_in_client_role() {
        let mut framer = StreamFramer::new();
        let events = feed_chunked(&mut framer, &encode_frame(b"data"), 3).unwrap();
        assert_eq!(events, vec![FramerEvent::Packet(Bytes::from_static(b"data"))]);
    }

    #[test]
    fn maximum_size_frame_parses() {
        let payload = vec![0x5a; MAX_UDP_PAYLOAD];
        let mut framer = StreamFramer::new();
        let events = feed_chunked(&mut framer, &encode_frame(&payload), 4096).unwrap();
        match &events[..] {
            [FramerEvent::Packet(p)] => {
                assert_eq!(p.len(), MAX_UDP_PAYLOAD);
                assert!(p.iter().all(|&b| b == 0x5a));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn maximum_size_frame_fits_right_after_handshake() {
        let payload = vec![7u8; MAX_UDP_PAYLOAD];
        let mut stream = DEFAULT_HANDSHAKE.to_vec();
        stream.extend_from_slice(&encode_frame(&payload));
        stream.extend_from_slice(&encode_frame(b"next"));

        let mut framer = StreamFramer::with_handshake(DEFAULT_HANDSHAKE);
        let events = feed_chunked(&mut framer, &stream, 8192).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], FramerEvent::HandshakeVerified);
        assert_eq!(events[1], FramerEvent::Packet(Bytes::from(payload)));
        assert_eq!(events[2], FramerEvent::Packet(Bytes::from_static(b"next")));
    }

    #[test]
    fn zero_length_frame_is_delivered() {
        let mut framer = StreamFramer::new();
        let events = feed_chunked(&mut framer, &encode_frame(&[]), 1).unwrap();
        assert_eq!(events, vec![FramerEvent::Packet(Bytes::new())]);
    }
}
