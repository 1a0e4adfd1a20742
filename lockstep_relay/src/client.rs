// Blocking TCP client for the relay.
//
// Used by the integration tests and by any tool that wants to talk to a
// relay without writing its own framing. Architecture:
// - `connect()` performs the TCP connect and the handshake on the calling
//   thread: read the raw header (protocol version, assigned index), read the
//   `HandshakeRequest`, answer with a `HandshakeResponse`.
// - A background reader thread then calls `read_relay_packet()` in a loop
//   and pushes every `RelayPacket` into an `mpsc` channel.
// - The calling thread keeps the write half and sends synchronously; the
//   packets are small and the relay drains its sockets every loop.
// - `poll()` drains the inbox without blocking; `recv_timeout()` waits for
//   one packet.
//
// The client does not interpret anything it receives. Rejections arrive as
// ordinary `ServerError` / `AuthenticationError` server orders followed by
// the connection closing.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lockstep_protocol::order::{self, names};
use lockstep_protocol::{
    ClientIndex, Frame, HandshakeRequest, HandshakeResponse, RelayPacket, ServerOrder,
    parse_server_orders, read_handshake_header, read_relay_packet, write_client_packet,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP client for relay communication.
pub struct NetClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<RelayPacket>,
    _reader_thread: Option<JoinHandle<()>>,
    pub index: ClientIndex,
    pub protocol_version: i32,
    pub request: HandshakeRequest,
}

impl NetClient {
    /// Connect and answer the handshake with matching mod and version.
    pub fn connect(addr: &str, name: &str, password: Option<String>) -> Result<Self, String> {
        Self::connect_with(addr, |request| {
            let mut response = HandshakeResponse::answering(request, name);
            response.password = password;
            response
        })
    }

    /// Connect and answer the handshake with whatever `respond` builds from
    /// the relay's request.
    pub fn connect_with(
        addr: &str,
        respond: impl FnOnce(&HandshakeRequest) -> HandshakeResponse,
    ) -> Result<Self, String> {
        let stream = TcpStream::connect(addr).map_err(|e| format!("connect failed: {e}"))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
        stream.set_nodelay(true).ok();

        let reader_stream = stream
            .try_clone()
            .map_err(|e| format!("clone failed: {e}"))?;
        let mut reader = BufReader::new(reader_stream);
        let mut writer = BufWriter::new(stream);

        let (protocol_version, index) =
            read_handshake_header(&mut reader).map_err(|e| format!("read header failed: {e}"))?;
        let packet =
            read_relay_packet(&mut reader).map_err(|e| format!("read request failed: {e}"))?;
        let orders = parse_server_orders(&packet.payload)
            .map_err(|e| format!("parse request failed: {e}"))?;
        let request = orders
            .iter()
            .find(|o| o.name == names::HANDSHAKE_REQUEST)
            .ok_or_else(|| format!("expected a handshake request, got {orders:?}"))
            .and_then(|o| {
                HandshakeRequest::from_json(&o.data)
                    .map_err(|e| format!("parse request failed: {e}"))
            })?;

        let response = respond(&request)
            .to_json()
            .map_err(|e| format!("serialize response failed: {e}"))?;
        let order = ServerOrder::new(names::HANDSHAKE_RESPONSE, response).serialize();
        write_client_packet(&mut writer, Frame::IMMEDIATE, &order)
            .map_err(|e| format!("send response failed: {e}"))?;

        // The reader thread blocks indefinitely from here on.
        reader.get_ref().set_read_timeout(None).ok();

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
            index,
            protocol_version,
            request,
        })
    }

    /// Send an order payload for `frame`. Frame 0 is relayed immediately.
    pub fn send_orders(&mut self, frame: Frame, payload: &[u8]) -> Result<(), String> {
        write_client_packet(&mut self.writer, frame, payload)
            .map_err(|e| format!("send orders failed: {e}"))
    }

    pub fn send_server_order(&mut self, name: &str, data: &str) -> Result<(), String> {
        self.send_orders(Frame::IMMEDIATE, &ServerOrder::new(name, data).serialize())
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), String> {
        self.send_server_order(names::CHAT, text)
    }

    pub fn send_command(&mut self, command: &str) -> Result<(), String> {
        self.send_server_order(names::COMMAND, command)
    }

    /// Close both directions. The relay sees an orderly close.
    pub fn disconnect(&mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }

    /// Drain all queued packets (non-blocking).
    pub fn poll(&self) -> Vec<RelayPacket> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.inbox.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Wait up to `timeout` for the next packet. `None` on timeout or once
    /// the relay has closed the connection.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RelayPacket> {
        match self.inbox.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Wait for the next server order named `name`, skipping everything
    /// else. Returns the sender and order.
    pub fn wait_for_order(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Option<(RelayPacket, ServerOrder)> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let packet = self.recv_timeout(remaining)?;
            if !order::is_server_order(&packet.payload) {
                continue;
            }
            let Ok(orders) = parse_server_orders(&packet.payload) else {
                continue;
            };
            if let Some(found) = orders.into_iter().find(|o| o.name == name) {
                return Some((packet, found));
            }
        }
    }
}

/// Reader thread: read relay packets in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<RelayPacket>) {
    while let Ok(packet) = read_relay_packet(&mut reader) {
        if tx.send(packet).is_err() {
            break; // Receiver dropped
        }
    }
}
