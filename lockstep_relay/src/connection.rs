// One accepted client socket.
//
// A `Connection` owns its non-blocking `TcpStream`, the incremental
// `FrameDecoder` holding any partially received packet, and an outbound byte
// queue. The server loop calls `receive()` when the poller reports the socket
// readable and `flush()` when it reports it writable; nothing here ever
// blocks.
//
// Failures are returned as values, not handled here: `receive()` reports the
// packets it completed alongside the error that ended the read, and the
// server turns any `ConnectionError` into a drop of this connection only.
//
// Read semantics:
// - `WouldBlock` ends the read cycle and is not an error.
// - A zero-byte read is an orderly close. Packets completed before it are
//   still delivered.
// - Any other socket error discards whatever was buffered.
//
// Outbound data that the kernel will not take yet stays queued. A client
// whose backlog grows past `MAX_OUTBOUND_BACKLOG` is too slow to keep up with
// the relay and is dropped.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Instant;

use lockstep_protocol::{ClientIndex, Frame, FrameDecoder, FrameError, Packet};

/// Unsent bytes allowed per connection before it is dropped.
pub const MAX_OUTBOUND_BACKLOG: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("remote closed the connection")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed packet: {0}")]
    Frame(#[from] FrameError),

    #[error("outbound backlog of {0} bytes exceeds limit")]
    SlowClient(usize),
}

/// Result of one read cycle.
#[derive(Debug, Default)]
pub struct Received {
    pub packets: Vec<Packet>,
    /// Set when the connection must be dropped after `packets` are routed.
    pub error: Option<ConnectionError>,
}

pub struct Connection {
    stream: TcpStream,
    pub addr: SocketAddr,
    pub index: ClientIndex,
    decoder: FrameDecoder,
    outbound: Vec<u8>,
    written: usize,

    /// True once the handshake response has been accepted.
    pub validated: bool,
    /// Frame of the last synchronized order relayed for this client. The
    /// disconnect marker is placed one frame after it.
    pub last_orders_frame: Frame,
    /// Frame of the last packet fully decoded from this client.
    pub last_processed_frame: Frame,
    pub joined_at: Instant,
}

impl Connection {
    /// Wrap an accepted stream, switching it to non-blocking mode.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        index: ClientIndex,
        now: Instant,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            addr,
            index,
            decoder: FrameDecoder::new(),
            outbound: Vec::new(),
            written: 0,
            validated: false,
            last_orders_frame: Frame::IMMEDIATE,
            last_processed_frame: Frame::IMMEDIATE,
            joined_at: now,
        })
    }

    pub fn socket(&self) -> &TcpStream {
        &self.stream
    }

    /// Read everything currently available and decode all complete packets.
    pub fn receive(&mut self) -> Received {
        let mut buf = [0u8; READ_CHUNK];
        let mut error = None;
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    error = Some(ConnectionError::Closed);
                    break;
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Received {
                        packets: Vec::new(),
                        error: Some(ConnectionError::Io(e)),
                    };
                }
            }
        }

        let mut packets = Vec::new();
        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => {
                    self.last_processed_frame = packet.frame;
                    packets.push(packet);
                }
                Ok(None) => break,
                Err(e) => {
                    error = Some(ConnectionError::Frame(e));
                    break;
                }
            }
        }
        Received { packets, error }
    }

    /// Queue bytes for sending and push as much as the socket accepts.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.outbound.extend_from_slice(bytes);
        self.flush()
    }

    /// Write queued bytes until the socket would block.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }

        if self.written == self.outbound.len() {
            self.outbound.clear();
            self.written = 0;
        } else if self.written > self.outbound.len() / 2 {
            self.outbound.drain(..self.written);
            self.written = 0;
        }

        let backlog = self.backlog();
        if backlog > MAX_OUTBOUND_BACKLOG {
            return Err(ConnectionError::SlowClient(backlog));
        }
        Ok(())
    }

    pub fn backlog(&self) -> usize {
        self.outbound.len() - self.written
    }

    pub fn wants_write(&self) -> bool {
        self.backlog() > 0
    }

    /// Best-effort final flush, then close both directions.
    pub fn close(mut self) {
        let _ = self.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
