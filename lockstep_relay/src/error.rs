// Relay-level error type.
//
// Per-connection failures never surface here: they are `ConnectionError`s
// (see `connection.rs`) that end in a drop of that one connection. What
// remains are the hard failures the embedding process has to see (bind,
// settings) and the few internal invariant violations that callers can act
// on (index exhaustion refuses a single accept; an unknown order-buffer
// client is a routing bug for that packet).

use std::io;

use lockstep_protocol::ClientIndex;

use crate::settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("all {0} client indices are in use")]
    PlayerIndexExhausted(usize),

    #[error("client {0} was never registered with the order buffer")]
    UnknownClient(ClientIndex),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
