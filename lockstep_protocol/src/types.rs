// Core ID types for the lockstep protocol.
//
// These are lightweight newtypes used by the framing layer, the order codecs,
// the lobby records, and the relay's connection bookkeeping. Both are carried
// on the wire as little-endian `int32`, so the inner type is `i32` even though
// valid values are never negative (the replay format reserves `-1` as a
// metadata marker).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned client index. Stable for the lifetime of a connection and
/// reused only after the owning connection has been dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIndex(pub i32);

impl fmt::Display for ClientIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation frame number. Frame 0 marks an immediate (out-of-band) order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Frame(pub i32);

impl Frame {
    pub const IMMEDIATE: Frame = Frame(0);

    /// True for frame 0: chat, handshake and server commands that are not
    /// part of the deterministic order stream.
    pub fn is_immediate(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Frame {
        Frame(self.0 + 1)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
