// lockstep_relay: lockstep order-synchronization relay server.
//
// The relay is a thin order broker for lockstep games: it admits clients
// through a versioned handshake, keeps the lobby roster, and during a game
// buffers every client's synchronized orders and flushes them to everyone
// else on a fixed net-frame cadence, acknowledging each flush to the sender.
// It never runs the simulation; order payloads are opaque bytes apart from
// their first tag byte.
//
// Module overview:
// - `server.rs`:       `Server` (single-threaded poll loop, handshake,
//                      routing, drops, game lifecycle), `start_relay` and
//                      `RelayHandle`.
// - `connection.rs`:   One non-blocking client socket: frame decoder,
//                      outbound queue, per-client frame bookkeeping.
// - `poller.rs`:       `poll(2)` readiness wrapper (sleep fallback off unix).
// - `order_buffer.rs`: Per-client order queues flushed on every net frame
//                      through the `OrderDispatcher` trait.
// - `scheduler.rs`:    Net-frame cadence with jank rebasing.
// - `in_flight.rs`:    Which clients have reported each frame.
// - `commands.rs`:     `InterpretCommand` handler chain for lobby and
//                      vote-kick commands.
// - `flood.rs`:        Chat flood control.
// - `vote_kick.rs`:    Vote-kick state machine.
// - `heartbeat.rs`:    Master-server advertisement on a worker thread.
// - `replay.rs`:       Replay recording and resume-from-replay loading.
// - `settings.rs`:     `ServerSettings` (JSON file + defaults).
// - `client.rs`:       Blocking `NetClient` used by tests and tools.
// - `error.rs`:        `RelayError`.
//
// Dependencies: `lockstep_protocol` (framing, orders, handshake and lobby
// records). The relay can run as a standalone binary (`main.rs`) or be
// embedded in a game process via the library API (`start_relay`).

pub mod client;
pub mod commands;
pub mod connection;
pub mod error;
pub mod flood;
pub mod heartbeat;
pub mod in_flight;
pub mod order_buffer;
pub mod poller;
pub mod replay;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod vote_kick;

pub use error::RelayError;
pub use server::{RelayHandle, Server, ServerState, spawn_relay, start_relay};
pub use settings::ServerSettings;
