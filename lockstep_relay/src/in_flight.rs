// In-flight frame table.
//
// Tracks, per synchronized frame, which connected clients have sent their own
// packet for it. Once the set covers every currently connected client the
// frame is fully relayed and its entry is removed. A client that drops is
// removed from every set, but entries are only re-checked on the next
// acknowledgement, so a drop alone never completes a frame. That
// acknowledgement sweeps every entry, not just its own frame, so frames the
// survivors had already covered do not linger.

use std::collections::{BTreeMap, BTreeSet};

use lockstep_protocol::{ClientIndex, Frame};

#[derive(Debug, Default)]
pub struct InFlightFrames {
    frames: BTreeMap<Frame, BTreeSet<ClientIndex>>,
}

impl InFlightFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `frame` as acknowledged by `client`, then remove every entry
    /// whose set covers `connected`. Returns true if `frame` itself
    /// completed.
    pub fn acknowledge(
        &mut self,
        frame: Frame,
        client: ClientIndex,
        connected: &BTreeSet<ClientIndex>,
    ) -> bool {
        self.frames.entry(frame).or_default().insert(client);
        self.frames.retain(|_, acked| !connected.is_subset(acked));
        !self.frames.contains_key(&frame)
    }

    pub fn forget_client(&mut self, client: ClientIndex) {
        for acked in self.frames.values_mut() {
            acked.remove(&client);
        }
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
