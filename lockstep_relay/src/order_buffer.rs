// Per-client order queues between network ticks.
//
// Synchronized orders are not relayed the moment they arrive. The server
// buffers each client's packets here and the net scheduler flushes all
// queues at once on every tick. A flush tells the sender how many of its
// orders went out (one count per client, since the transport is reliable and
// ordered) and forwards the whole queue, in enqueue order, to everyone else.
//
// The buffer does not know about sockets. `flush` drives an
// `OrderDispatcher`, which the server implements by writing to connections
// and the tests implement by recording calls. Clients are visited in index
// order so a flush is deterministic.

use std::collections::BTreeMap;

use lockstep_protocol::ClientIndex;

use crate::error::RelayError;

/// Receiver of a flush.
pub trait OrderDispatcher {
    /// `count` queued entries from `client` were relayed.
    fn acknowledge(&mut self, client: ClientIndex, count: usize);

    /// Deliver `entries` from `from` to every client except `from`.
    fn forward(&mut self, from: ClientIndex, entries: &[Vec<u8>]);
}

#[derive(Debug, Default)]
pub struct OrderBuffer {
    queues: BTreeMap<ClientIndex, Vec<Vec<u8>>>,
}

impl OrderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self, client: ClientIndex) {
        self.queues.entry(client).or_default();
    }

    /// Forget a client and hand back whatever it still had queued, in
    /// enqueue order. The entries are not acknowledged.
    pub fn take_client(&mut self, client: ClientIndex) -> Vec<Vec<u8>> {
        self.queues.remove(&client).unwrap_or_default()
    }

    pub fn contains(&self, client: ClientIndex) -> bool {
        self.queues.contains_key(&client)
    }

    /// Append one serialized entry to `client`'s queue.
    pub fn buffer_orders(&mut self, client: ClientIndex, entry: Vec<u8>) -> Result<(), RelayError> {
        let queue = self
            .queues
            .get_mut(&client)
            .ok_or(RelayError::UnknownClient(client))?;
        queue.push(entry);
        Ok(())
    }

    pub fn queue_len(&self, client: ClientIndex) -> usize {
        self.queues.get(&client).map_or(0, Vec::len)
    }

    /// Acknowledge and forward every non-empty queue, then clear it.
    pub fn flush(&mut self, dispatcher: &mut impl OrderDispatcher) {
        for (&client, queue) in &mut self.queues {
            if queue.is_empty() {
                continue;
            }
            dispatcher.acknowledge(client, queue.len());
            dispatcher.forward(client, queue);
            queue.clear();
        }
    }
}
