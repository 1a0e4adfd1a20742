// lockstep_protocol: wire protocol for the lockstep order relay.
//
// This crate defines the packet framing, order payload codecs, handshake
// blobs and lobby records shared by the relay (`lockstep_relay`) and its
// clients. It has no networking of its own beyond blocking `Read`/`Write`
// helpers.
//
// Module overview:
// - `types.rs`:     Core ID types, `ClientIndex`, `Frame`.
// - `framing.rs`:   Little-endian length-prefixed packets. Incremental
//                   `FrameDecoder` for the relay, encoders for both
//                   directions, blocking client helpers.
// - `order.rs`:     Order tags, the 7-bit length-prefixed string codec,
//                   `ServerOrder` (`0xFE`), sync hash, ack, disconnect and
//                   field-order payloads.
// - `handshake.rs`: `HandshakeRequest` / `HandshakeResponse` JSON blobs and
//                   protocol version constants.
// - `lobby.rs`:     `LobbyInfo` roster, slots and global settings, synced to
//                   clients as JSON in the `SyncInfo` server order.
//
// Design decisions:
// - **Simulation orders are opaque.** The relay validates framing and reads
//   only the first tag byte of a payload (plus sync-hash bodies for defeat
//   tracking). Everything else is forwarded byte for byte.
// - **Exact length accounting.** The length word counts the frame word plus
//   the payload in both directions; the relay-side `fromClient` word is not
//   included.
// - **No async runtime.** The relay drives the decoder from its own
//   non-blocking loop; clients use plain blocking streams.

pub mod framing;
pub mod handshake;
pub mod lobby;
pub mod order;
pub mod types;

pub use framing::{
    DecodeState, FrameDecoder, FrameError, HEADER_LEN, MAX_PACKET_SIZE, Packet, RelayPacket,
    encode_client_packet, encode_handshake_header, encode_relay_packet, read_handshake_header,
    read_relay_packet, write_client_packet,
};
pub use handshake::{
    HANDSHAKE_PROTOCOL_VERSION, HandshakeClient, HandshakeRequest, HandshakeResponse,
    ORDERS_PROTOCOL_VERSION,
};
pub use lobby::{ClientState, GlobalSettings, LobbyClient, LobbyInfo, LobbySlot};
pub use order::{OrderError, OrderType, ServerOrder, SyncHash, parse_server_orders};
pub use types::{ClientIndex, Frame};
