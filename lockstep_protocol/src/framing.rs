// Packet framing for the lockstep wire protocol.
//
// Client→relay packets:  int32 length | int32 frame | payload
// Relay→client packets:  int32 length | int32 fromClient | int32 frame | payload
//
// In both directions `length` counts the frame word plus the payload, i.e.
// `payload.len() + 4`. All integers are little-endian. The relay additionally
// sends an unframed 8-byte handshake header (`int32 protocolVersion, int32
// clientIndex`) as the very first bytes of every accepted connection.
//
// `FrameDecoder` is the relay-side incremental decoder. It is fed whatever a
// non-blocking read produced and hands back complete packets through a
// two-state machine: `Header` expects the fixed 8-byte record, `Data` expects
// exactly `length - 4` payload bytes. The decoder never consumes bytes past
// the end of the packet it is currently assembling, so several packets that
// arrived in one read are returned one by one in order.
//
// The blocking `read_relay_packet` / `write_client_packet` helpers are the
// client side of the same format and are used by `NetClient` and the tests.

use std::io::{self, Read, Write};

use crate::types::{ClientIndex, Frame};

/// Size of the `length | frame` record that precedes every client payload.
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted in one packet (16 MB). Protects against unbounded
/// allocation from a corrupt or hostile length word.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Consumed prefix size after which the receive buffer is compacted.
const COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The length word must at least cover the 4-byte frame number.
    #[error("declared packet length {0} is shorter than the frame word")]
    LengthTooShort(i32),

    #[error("declared payload length {length} exceeds maximum {max}")]
    PacketTooLarge { length: usize, max: usize },
}

/// One decoded client packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub frame: Frame,
    pub payload: Vec<u8>,
}

/// Decoder state: which record the decoder is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    Header,
    Data,
}

/// Incremental Header → Data decoder over a growable byte buffer with an
/// explicit consumed cursor.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    consumed: usize,
    state: DecodeState,
    expected: usize,
    frame: Frame,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            state: DecodeState::Header,
            expected: HEADER_LEN,
            frame: Frame::IMMEDIATE,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of bytes the next decode step needs.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Bytes received but not yet consumed by a decode step.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD && self.consumed * 2 >= self.buffer.len() {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete packet, if enough bytes are buffered.
    ///
    /// Returns `Ok(None)` when more input is needed. An error leaves the
    /// decoder unusable; the connection it belongs to must be dropped.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        loop {
            if self.buffered() < self.expected {
                return Ok(None);
            }

            let start = self.consumed;
            let end = start + self.expected;
            match self.state {
                DecodeState::Header => {
                    let length = read_i32(&self.buffer[start..end]);
                    let frame = read_i32(&self.buffer[start + 4..end]);
                    if length < 4 {
                        return Err(FrameError::LengthTooShort(length));
                    }
                    let data_len = (length - 4) as usize;
                    if data_len > MAX_PACKET_SIZE {
                        return Err(FrameError::PacketTooLarge {
                            length: data_len,
                            max: MAX_PACKET_SIZE,
                        });
                    }

                    self.consumed = end;
                    self.frame = Frame(frame);
                    self.state = DecodeState::Data;
                    self.expected = data_len;
                }
                DecodeState::Data => {
                    let payload = self.buffer[start..end].to_vec();
                    self.consumed = end;
                    self.state = DecodeState::Header;
                    self.expected = HEADER_LEN;
                    return Ok(Some(Packet {
                        frame: self.frame,
                        payload,
                    }));
                }
            }
        }
    }
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn packet_length(payload: &[u8]) -> i32 {
    (payload.len() + 4) as i32
}

/// Frame a payload the way a client sends it to the relay.
pub fn encode_client_packet(frame: Frame, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN);
    out.extend_from_slice(&packet_length(payload).to_le_bytes());
    out.extend_from_slice(&frame.0.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Frame a payload the way the relay forwards it, tagged with its sender.
pub fn encode_relay_packet(from: ClientIndex, frame: Frame, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN + 4);
    out.extend_from_slice(&packet_length(payload).to_le_bytes());
    out.extend_from_slice(&from.0.to_le_bytes());
    out.extend_from_slice(&frame.0.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// The unframed record sent to every accepted socket before anything else.
pub fn encode_handshake_header(protocol_version: i32, client: ClientIndex) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&protocol_version.to_le_bytes());
    out[4..].copy_from_slice(&client.0.to_le_bytes());
    out
}

/// A packet as received by a client from the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPacket {
    pub from: ClientIndex,
    pub frame: Frame,
    pub payload: Vec<u8>,
}

fn read_le_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read the handshake header: `(protocolVersion, assignedClientIndex)`.
pub fn read_handshake_header<R: Read>(reader: &mut R) -> io::Result<(i32, ClientIndex)> {
    let version = read_le_i32(reader)?;
    let client = read_le_i32(reader)?;
    Ok((version, ClientIndex(client)))
}

/// Read one relay→client packet (blocking).
///
/// Returns `UnexpectedEof` if the stream closes before or during a packet and
/// `InvalidData` for a length word that cannot describe a valid packet.
pub fn read_relay_packet<R: Read>(reader: &mut R) -> io::Result<RelayPacket> {
    let length = read_le_i32(reader)?;
    let from = read_le_i32(reader)?;
    if length < 4 || (length - 4) as usize > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid packet length {length}"),
        ));
    }
    let frame = read_le_i32(reader)?;
    let mut payload = vec![0u8; (length - 4) as usize];
    reader.read_exact(&mut payload)?;
    Ok(RelayPacket {
        from: ClientIndex(from),
        frame: Frame(frame),
        payload,
    })
}

/// Write one client→relay packet (blocking) and flush.
pub fn write_client_packet<W: Write>(writer: &mut W, frame: Frame, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "payload too large: {} bytes (max {MAX_PACKET_SIZE})",
                payload.len()
            ),
        ));
    }
    writer.write_all(&encode_client_packet(frame, payload))?;
    writer.flush()
}
