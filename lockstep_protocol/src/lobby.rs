// Lobby session records.
//
// `LobbyInfo` is the roster the relay keeps in step with its connection set:
// every validated connection has exactly one `LobbyClient` with the same
// index. It is pushed to clients as JSON in a `SyncInfo` server order after
// every change. Slots are kept in map order so "first empty slot" is
// deterministic.

use serde::{Deserialize, Serialize};

use crate::types::ClientIndex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    #[default]
    NotReady,
    Invalid,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyClient {
    pub index: ClientIndex,
    pub name: String,
    /// Occupied slot id, or `None` for a spectator.
    pub slot: Option<String>,
    pub state: ClientState,
    pub team: i32,
    pub faction: String,
    pub color: Option<String>,
    pub spawn_point: i32,
    pub is_admin: bool,
    /// Bot type for AI players; humans have `None`.
    #[serde(default)]
    pub bot: Option<String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Set from sync-hash defeat bitmasks once the game is running.
    #[serde(default)]
    pub defeated: bool,
}

impl LobbyClient {
    /// A client record with lobby defaults, not yet placed in a slot.
    pub fn new(index: ClientIndex, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            slot: None,
            state: ClientState::Invalid,
            team: 0,
            faction: "Random".into(),
            color: None,
            spawn_point: 0,
            is_admin: false,
            bot: None,
            ip_address: String::new(),
            fingerprint: None,
            defeated: false,
        }
    }

    pub fn is_observer(&self) -> bool {
        self.slot.is_none()
    }

    pub fn is_bot(&self) -> bool {
        self.bot.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySlot {
    pub id: String,
    pub player_reference: String,
    pub closed: bool,
    pub allow_bots: bool,
    pub required: bool,
    #[serde(default)]
    pub lock_team: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub server_name: String,
    pub map: String,
    pub random_seed: i32,
    pub allow_spectators: bool,
    pub dedicated: bool,
    pub game_uid: String,
    /// Simulation step in milliseconds.
    pub timestep: u32,
    /// Simulation ticks per network frame.
    pub net_frame_interval: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            map: String::new(),
            random_seed: 0,
            allow_spectators: true,
            dedicated: false,
            game_uid: String::new(),
            timestep: 40,
            net_frame_interval: 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub clients: Vec<LobbyClient>,
    pub slots: Vec<LobbySlot>,
    pub global: GlobalSettings,
}

impl LobbyInfo {
    pub fn client_with_index(&self, index: ClientIndex) -> Option<&LobbyClient> {
        self.clients.iter().find(|c| c.index == index)
    }

    pub fn client_with_index_mut(&mut self, index: ClientIndex) -> Option<&mut LobbyClient> {
        self.clients.iter_mut().find(|c| c.index == index)
    }

    pub fn client_in_slot(&self, slot: &str) -> Option<&LobbyClient> {
        self.clients
            .iter()
            .find(|c| c.slot.as_deref() == Some(slot))
    }

    pub fn slot(&self, id: &str) -> Option<&LobbySlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// First slot, in map order, that is open and unoccupied.
    pub fn first_empty_slot(&self) -> Option<String> {
        self.slots
            .iter()
            .find(|s| !s.closed && self.client_in_slot(&s.id).is_none())
            .map(|s| s.id.clone())
    }

    /// Add a client, keeping the roster ordered by index.
    pub fn add_client(&mut self, client: LobbyClient) {
        let pos = self
            .clients
            .iter()
            .position(|c| c.index > client.index)
            .unwrap_or(self.clients.len());
        self.clients.insert(pos, client);
    }

    pub fn remove_client(&mut self, index: ClientIndex) -> Option<LobbyClient> {
        let pos = self.clients.iter().position(|c| c.index == index)?;
        Some(self.clients.remove(pos))
    }

    pub fn non_bot_clients(&self) -> impl Iterator<Item = &LobbyClient> {
        self.clients.iter().filter(|c| !c.is_bot())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
