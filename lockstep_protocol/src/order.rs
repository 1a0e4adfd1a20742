// Order payload codecs.
//
// The relay treats simulation orders as opaque bytes, validating only their
// framing. It does need to understand a handful of payload shapes:
//
// - `0xFE` server orders: a `(name, data)` string pair used for handshake,
//   chat, commands and every other server-authored control message. Several
//   may be packed back to back into one frame-0 payload.
// - `0x65` sync hashes: exactly 13 bytes, `tag | int32 hash | uint64 defeat
//   bitmask`. The relay reads the bitmask to track defeated clients.
// - `0xBF` disconnect markers and `0x10` acks, which the relay authors.
// - `0xFF` field orders, which the relay only ever writes (the unpause order
//   synthesized when resuming a replay).
//
// Strings use a 7-bit variable-length prefix (LEB128, low group first)
// followed by UTF-8 bytes.

use std::fmt;

/// First byte of every order payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OrderType {
    Ack = 0x10,
    SyncHash = 0x65,
    Disconnect = 0xBF,
    Handshake = 0xFE,
    Fields = 0xFF,
}

impl TryFrom<u8> for OrderType {
    type Error = OrderError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x10 => Ok(OrderType::Ack),
            0x65 => Ok(OrderType::SyncHash),
            0xBF => Ok(OrderType::Disconnect),
            0xFE => Ok(OrderType::Handshake),
            0xFF => Ok(OrderType::Fields),
            other => Err(OrderError::UnexpectedTag(other)),
        }
    }
}

/// Server order names understood by the relay and its clients.
pub mod names {
    pub const HANDSHAKE_REQUEST: &str = "HandshakeRequest";
    pub const HANDSHAKE_RESPONSE: &str = "HandshakeResponse";
    /// Data is the JSON-serialized lobby.
    pub const SYNC_INFO: &str = "SyncInfo";
    pub const START_GAME: &str = "StartGame";
    pub const MESSAGE: &str = "Message";
    pub const SERVER_ERROR: &str = "ServerError";
    pub const AUTHENTICATION_ERROR: &str = "AuthenticationError";
    pub const COMMAND: &str = "Command";
    pub const CHAT: &str = "Chat";
    pub const TEAM_CHAT: &str = "TeamChat";
    /// Data is the number of milliseconds to disable chat input for.
    pub const DISABLE_CHAT_ENTRY: &str = "DisableChatEntry";
}

/// Total length of a sync-hash order, tag included.
pub const SYNC_HASH_ORDER_LEN: usize = 13;

/// Field-presence flag: the order carries a target string.
pub const FIELD_TARGET_STRING: u8 = 0x04;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("malformed string length prefix at offset {0}")]
    BadStringLength(usize),

    #[error("order string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected order tag {0:#04x}")]
    UnexpectedTag(u8),
}

/// Cursor over an order payload.
pub struct OrderReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> OrderReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OrderError> {
        if self.bytes.len() - self.pos < n {
            return Err(OrderError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, OrderError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, OrderError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, OrderError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_string(&mut self) -> Result<String, OrderError> {
        let start = self.pos;
        let mut length: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            length |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(OrderError::BadStringLength(start));
            }
        }
        let bytes = self.take(length as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| OrderError::InvalidUtf8)
    }
}

/// Append a 7-bit length-prefixed UTF-8 string.
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    let mut length = s.len();
    while length >= 0x80 {
        out.push((length as u8) | 0x80);
        length >>= 7;
    }
    out.push(length as u8);
    out.extend_from_slice(s.as_bytes());
}

/// A `(name, data)` control message carried under the `0xFE` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOrder {
    pub name: String,
    pub data: String,
}

impl ServerOrder {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + self.data.len() + 3);
        out.push(OrderType::Handshake as u8);
        write_string(&mut out, &self.name);
        write_string(&mut out, &self.data);
        out
    }

    /// Read one server order, tag included.
    pub fn read(reader: &mut OrderReader<'_>) -> Result<Self, OrderError> {
        let tag = reader.read_u8()?;
        if tag != OrderType::Handshake as u8 {
            return Err(OrderError::UnexpectedTag(tag));
        }
        let name = reader.read_string()?;
        let data = reader.read_string()?;
        Ok(Self { name, data })
    }
}

impl fmt::Display for ServerOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.data)
    }
}

/// Parse every server order packed into a frame-0 payload.
pub fn parse_server_orders(payload: &[u8]) -> Result<Vec<ServerOrder>, OrderError> {
    let mut reader = OrderReader::new(payload);
    let mut orders = Vec::new();
    while !reader.is_empty() {
        orders.push(ServerOrder::read(&mut reader)?);
    }
    Ok(orders)
}

/// True when the payload starts with the server-order tag.
pub fn is_server_order(payload: &[u8]) -> bool {
    payload.first() == Some(&(OrderType::Handshake as u8))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncHash {
    pub hash: i32,
    pub defeat_state: u64,
}

impl SyncHash {
    /// Decode a sync-hash payload. Anything that is not exactly 13 bytes with
    /// the `0x65` tag is rejected.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != SYNC_HASH_ORDER_LEN || !is_sync_hash(payload) {
            return None;
        }
        let mut reader = OrderReader::new(&payload[1..]);
        let hash = reader.read_i32().ok()?;
        let defeat_state = reader.read_u64().ok()?;
        Some(Self { hash, defeat_state })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SYNC_HASH_ORDER_LEN);
        out.push(OrderType::SyncHash as u8);
        out.extend_from_slice(&self.hash.to_le_bytes());
        out.extend_from_slice(&self.defeat_state.to_le_bytes());
        out
    }
}

pub fn is_sync_hash(payload: &[u8]) -> bool {
    payload.first() == Some(&(OrderType::SyncHash as u8))
}

pub fn is_disconnect(payload: &[u8]) -> bool {
    payload.first() == Some(&(OrderType::Disconnect as u8))
}

/// Disconnect marker broadcast when a client drops mid-game.
pub fn disconnect_order() -> Vec<u8> {
    vec![OrderType::Disconnect as u8]
}

/// Ack payload telling a client how many of its queued orders were relayed.
pub fn encode_ack(count: u8) -> Vec<u8> {
    vec![OrderType::Ack as u8, count]
}

/// Decode an ack payload into its count.
pub fn parse_ack(payload: &[u8]) -> Option<u8> {
    match payload {
        [tag, count] if *tag == OrderType::Ack as u8 => Some(*count),
        _ => None,
    }
}

/// A field order carrying only a name and optional target string.
pub fn encode_fields_order(name: &str, target: Option<&str>) -> Vec<u8> {
    let mut out = vec![OrderType::Fields as u8];
    write_string(&mut out, name);
    match target {
        Some(target) => {
            out.push(FIELD_TARGET_STRING);
            write_string(&mut out, target);
        }
        None => out.push(0),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_from_tag() {
        assert_eq!(OrderType::try_from(0x65), Ok(OrderType::SyncHash));
        assert_eq!(OrderType::try_from(0xFE), Ok(OrderType::Handshake));
        assert_eq!(OrderType::try_from(0x01), Err(OrderError::UnexpectedTag(0x01)));
    }

    #[test]
    fn string_prefix_is_seven_bit() {
        let mut out = Vec::new();
        write_string(&mut out, "hi");
        assert_eq!(out, vec![2, b'h', b'i']);

        let long = "x".repeat(300);
        let mut out = Vec::new();
        write_string(&mut out, &long);
        // 300 = 0b10_0101100 -> 0xAC 0x02
        assert_eq!(&out[..2], &[0xAC, 0x02]);
        assert_eq!(OrderReader::new(&out).read_string().unwrap(), long);
    }

    #[test]
    fn server_order_roundtrip() {
        let order = ServerOrder::new("Chat", "gl hf");
        let bytes = order.serialize();
        assert_eq!(bytes[0], 0xFE);
        assert!(is_server_order(&bytes));
        let parsed = ServerOrder::read(&mut OrderReader::new(&bytes)).unwrap();
        assert_eq!(parsed, order);
    }

    #[test]
    fn parse_packed_server_orders() {
        let mut payload = ServerOrder::new("Command", "ready").serialize();
        payload.extend(ServerOrder::new("Chat", "ok").serialize());
        let orders = parse_server_orders(&payload).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].name, "Command");
        assert_eq!(orders[1].data, "ok");
    }

    #[test]
    fn truncated_server_order_is_error() {
        let bytes = ServerOrder::new("Chat", "hello").serialize();
        let err = parse_server_orders(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, OrderError::Truncated { .. }));
    }

    #[test]
    fn non_server_tag_in_packed_orders_is_error() {
        let mut payload = ServerOrder::new("Chat", "x").serialize();
        payload.push(0x65);
        assert_eq!(
            parse_server_orders(&payload),
            Err(OrderError::UnexpectedTag(0x65))
        );
    }

    #[test]
    fn invalid_utf8_is_error() {
        let payload = vec![0xFE, 1, 0xFF, 0];
        assert_eq!(parse_server_orders(&payload), Err(OrderError::InvalidUtf8));
    }

    #[test]
    fn sync_hash_is_thirteen_bytes() {
        let sync = SyncHash {
            hash: -17,
            defeat_state: 0b101,
        };
        let bytes = sync.serialize();
        assert_eq!(bytes.len(), SYNC_HASH_ORDER_LEN);
        assert_eq!(SyncHash::parse(&bytes), Some(sync));
        assert_eq!(SyncHash::parse(&bytes[..12]), None);
    }

    #[test]
    fn ack_and_disconnect_payloads() {
        assert_eq!(encode_ack(3), vec![0x10, 3]);
        assert_eq!(parse_ack(&encode_ack(3)), Some(3));
        assert_eq!(parse_ack(&[0x10]), None);
        assert!(is_disconnect(&disconnect_order()));
        assert!(!is_disconnect(&[]));
    }

    #[test]
    fn fields_order_with_target() {
        let bytes = encode_fields_order("PauseGame", Some("UnPause"));
        let mut reader = OrderReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0xFF);
        assert_eq!(reader.read_string().unwrap(), "PauseGame");
        assert_eq!(reader.read_u8().unwrap(), FIELD_TARGET_STRING);
        assert_eq!(reader.read_string().unwrap(), "UnPause");
        assert!(reader.is_empty());
    }
}
