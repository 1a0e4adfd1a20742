// TCP server and main event loop for the relay.
//
// Architecture: one thread, non-blocking sockets, readiness polling.
//
// - **`step()`** polls the listener and every connection once (bounded by
//   the poll timeout and the next net-frame deadline), accepts pending
//   connections, flushes writable sockets, reads and routes every complete
//   packet, applies deferred drops, then runs the periodic work (order
//   flush, vote timer, master-server heartbeat).
// - **`run()`** calls `step()` until the embedding process clears its
//   `keep_running` flag or the server shuts itself down.
// - **`start_relay()`** binds and runs a `Server` on a background thread,
//   returning a `RelayHandle` for stopping it and the bound address.
//
// Connection lifecycle:
// 1. Accept: the lowest free index is assigned and the raw handshake header
//    plus a `HandshakeRequest` server order are written. Nothing is added to
//    the lobby yet.
// 2. Validation: the only order accepted from an unvalidated connection is a
//    `HandshakeResponse`. On success a lobby client is created (first open
//    slot, first client becomes admin) and the lobby is re-synced.
// 3. Game: frame-0 payloads are interpreted (server orders) or broadcast
//    immediately. Synchronized payloads are buffered and flushed on every
//    net frame; the sender gets an ack, everyone else the orders.
// 4. Drop: any per-connection failure queues a drop. Drops are applied
//    between phases of `step()` so one bad socket never interrupts routing
//    for the others. A client dropped mid-game has its still-buffered orders
//    forwarded, then is announced to the rest with a disconnect marker one
//    frame after its last orders.
//
// All writes go through `Connection::send`, which queues what the kernel
// will not take. The only blocking call in the loop is the poll itself.

use std::collections::{BTreeSet, HashSet};
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lockstep_protocol::order::{self, names};
use lockstep_protocol::{
    ClientIndex, ClientState, Frame, GlobalSettings, HANDSHAKE_PROTOCOL_VERSION,
    HandshakeRequest, HandshakeResponse, LobbyClient, LobbyInfo, LobbySlot,
    ORDERS_PROTOCOL_VERSION, Packet, ServerOrder, SyncHash, encode_handshake_header,
    encode_relay_packet, parse_server_orders,
};
use tracing::{debug, error, info, warn};

use crate::commands::{self, InterpretCommand};
use crate::connection::Connection;
use crate::error::RelayError;
use crate::flood::{FloodTracker, FloodVerdict, remaining_seconds};
use crate::heartbeat::{HeartbeatEvent, ListingInfo, MasterServerHeartbeat};
use crate::in_flight::InFlightFrames;
use crate::order_buffer::{OrderBuffer, OrderDispatcher};
use crate::poller::{self, PollEntry};
use crate::replay::{Replay, ReplayMetadata, ReplayPlayer, ReplayRecorder};
use crate::scheduler::NetScheduler;
use crate::settings::{MAX_CLIENTS, ServerSettings};
use crate::vote_kick::{VoteKickTracker, VoteOutcome, VoteRejection};

/// Sender index used for every order the relay itself authors.
const SERVER_CLIENT: ClientIndex = ClientIndex(0);

/// Acks carry their count in a single byte.
const MAX_ACK_COUNT: usize = u8::MAX as usize;

const MAX_NAME_LEN: usize = 16;
const DEFAULT_NAME: &str = "Newbie";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    WaitingPlayers,
    GameStarted,
    ShuttingDown,
}

/// Collects one order-buffer flush so it can be written out after the
/// buffer borrow ends.
#[derive(Default)]
struct DispatchBatch {
    acks: Vec<(ClientIndex, usize)>,
    forwards: Vec<(ClientIndex, Vec<u8>)>,
}

impl OrderDispatcher for DispatchBatch {
    fn acknowledge(&mut self, client: ClientIndex, count: usize) {
        self.acks.push((client, count));
    }

    fn forward(&mut self, from: ClientIndex, entries: &[Vec<u8>]) {
        self.forwards.push((from, entries.concat()));
    }
}

pub struct Server {
    settings: ServerSettings,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connections: Vec<Connection>,
    pub(crate) lobby: LobbyInfo,
    state: ServerState,

    order_buffer: OrderBuffer,
    scheduler: Option<NetScheduler>,
    in_flight: InFlightFrames,
    flood: FloodTracker,
    pub(crate) vote_kick: VoteKickTracker,
    heartbeat: Option<MasterServerHeartbeat>,
    command_handlers: Vec<Box<dyn InterpretCommand>>,

    recorder: Option<ReplayRecorder>,
    resume: Option<Replay>,
    game_start_time: u64,
    /// Roster at game start, written into the replay trailer.
    replay_players: Vec<ReplayPlayer>,

    /// IP addresses kicked with a temporary ban, cleared on restart.
    temp_bans: HashSet<String>,
    pending_drops: Vec<(ClientIndex, String)>,
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Trim, cap and default a client-chosen name.
pub(crate) fn sanitize_name(name: &str) -> String {
    let trimmed: String = name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    if trimmed.is_empty() {
        DEFAULT_NAME.into()
    } else {
        trimmed
    }
}

fn queue_drop(pending: &mut Vec<(ClientIndex, String)>, index: ClientIndex, reason: String) {
    if !pending.iter().any(|(i, _)| *i == index) {
        pending.push((index, reason));
    }
}

fn build_lobby(settings: &ServerSettings) -> LobbyInfo {
    let slots = settings
        .map
        .slots
        .iter()
        .take(settings.effective_max_players())
        .map(|slot| LobbySlot {
            id: slot.id.clone(),
            player_reference: slot.id.clone(),
            closed: false,
            allow_bots: slot.allow_bots,
            required: slot.required,
            lock_team: slot.lock_team,
        })
        .collect();
    LobbyInfo {
        clients: Vec::new(),
        slots,
        global: GlobalSettings {
            server_name: settings.name.clone(),
            map: settings.map.uid.clone(),
            random_seed: 0,
            allow_spectators: settings.allow_spectators,
            dedicated: settings.dedicated,
            game_uid: String::new(),
            timestep: settings.timestep_ms,
            net_frame_interval: settings.net_frame_interval,
        },
    }
}

impl Server {
    /// Bind the listening socket. Nothing is accepted until `step` runs.
    pub fn bind(settings: ServerSettings) -> Result<Self, RelayError> {
        let addr = settings.bind_address();
        let listener =
            TcpListener::bind(&addr).map_err(|source| RelayError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, name = %settings.name, dedicated = settings.dedicated, "relay listening");

        let heartbeat = settings.advertise_online.then(|| {
            MasterServerHeartbeat::new(
                settings.master_server_url.clone(),
                settings.master_ping_interval(),
            )
        });

        Ok(Self {
            lobby: build_lobby(&settings),
            listener: Some(listener),
            local_addr,
            connections: Vec::new(),
            state: ServerState::WaitingPlayers,
            order_buffer: OrderBuffer::new(),
            scheduler: None,
            in_flight: InFlightFrames::new(),
            flood: FloodTracker::new(settings.flood_limits()),
            vote_kick: VoteKickTracker::new(
                settings.vote_kick_timer(),
                settings.vote_kick_no_repeat(),
            ),
            heartbeat,
            command_handlers: commands::default_handlers(),
            recorder: None,
            resume: None,
            game_start_time: 0,
            replay_players: Vec::new(),
            temp_bans: HashSet::new(),
            pending_drops: Vec::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn lobby(&self) -> &LobbyInfo {
        &self.lobby
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Replay whose orders are re-sent to everyone when the game starts.
    pub fn resume_from(&mut self, replay: Replay) {
        info!(resume_frame = ?replay.resume_frame(), "game will resume from replay");
        self.resume = Some(replay);
    }

    /// Run until `keep_running` is cleared or the server shuts itself down.
    pub fn run(&mut self, keep_running: &AtomicBool) -> Result<(), RelayError> {
        let timeout = self.settings.poll_timeout();
        let mut result = Ok(());
        while keep_running.load(Ordering::SeqCst) && self.state != ServerState::ShuttingDown {
            if let Err(e) = self.step(timeout) {
                error!(error = %e, "relay loop failed");
                result = Err(e);
                break;
            }
        }
        self.shutdown();
        result
    }

    /// One loop iteration: wait for readiness (at most `timeout`), service
    /// every ready socket, then run periodic work.
    pub fn step(&mut self, timeout: Duration) -> Result<(), RelayError> {
        let now = Instant::now();
        let timeout = match &self.scheduler {
            Some(scheduler) => timeout.min(scheduler.time_until_next(now)),
            None => timeout,
        };

        let mut entries: Vec<PollEntry> = Vec::with_capacity(self.connections.len() + 1);
        if let Some(listener) = &self.listener {
            entries.push(poller::entry_for(listener, false));
        }
        let listener_entries = entries.len();
        let polled: Vec<ClientIndex> = self.connections.iter().map(|c| c.index).collect();
        entries.extend(
            self.connections
                .iter()
                .map(|c| poller::entry_for(c.socket(), c.wants_write())),
        );

        poller::poll_sockets(&mut entries, timeout)?;

        if listener_entries == 1 && entries[0].readable {
            self.accept_connections();
        }

        for (entry, &index) in entries[listener_entries..].iter().zip(&polled) {
            if entry.writable {
                if let Some(conn) = self.connections.iter_mut().find(|c| c.index == index) {
                    if let Err(e) = conn.flush() {
                        queue_drop(&mut self.pending_drops, index, e.to_string());
                    }
                }
            }
            if entry.readable {
                self.receive_from(index);
            }
        }
        self.process_drops();

        self.tick(Instant::now());
        self.process_drops();
        Ok(())
    }

    fn receive_from(&mut self, index: ClientIndex) {
        let Some(conn) = self.connections.iter_mut().find(|c| c.index == index) else {
            return;
        };
        let received = conn.receive();
        for packet in received.packets {
            if self.is_dropping(index) {
                break;
            }
            self.route_packet(index, packet);
        }
        if let Some(e) = received.error {
            queue_drop(&mut self.pending_drops, index, e.to_string());
        }
    }

    // --- Accept and handshake ---

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn next_free_index(&self) -> Result<ClientIndex, RelayError> {
        (0..MAX_CLIENTS as i32)
            .map(ClientIndex)
            .find(|i| !self.connections.iter().any(|c| c.index == *i))
            .ok_or(RelayError::PlayerIndexExhausted(MAX_CLIENTS))
    }

    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.state != ServerState::WaitingPlayers {
            info!(%addr, "rejected connection: game already started");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
        let index = match self.next_free_index() {
            Ok(index) => index,
            Err(e) => {
                warn!(%addr, error = %e, "rejected connection");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        };
        let mut conn = match Connection::new(stream, addr, index, Instant::now()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%addr, error = %e, "failed to configure accepted socket");
                return;
            }
        };

        let auth_token = self
            .settings
            .require_authentication
            .then(|| format!("{:016x}", rand::random::<u64>()));
        let request = HandshakeRequest {
            mod_id: self.settings.mod_id.clone(),
            version: self.settings.mod_version.clone(),
            auth_token,
        };
        let json = match request.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize handshake request");
                conn.close();
                return;
            }
        };

        let mut bytes = encode_handshake_header(HANDSHAKE_PROTOCOL_VERSION, index).to_vec();
        bytes.extend(encode_relay_packet(
            SERVER_CLIENT,
            Frame::IMMEDIATE,
            &ServerOrder::new(names::HANDSHAKE_REQUEST, json).serialize(),
        ));
        if let Err(e) = conn.send(&bytes) {
            warn!(%addr, error = %e, "failed to send handshake");
            conn.close();
            return;
        }
        info!(client = %index, %addr, "accepted connection");
        self.connections.push(conn);
    }

    /// Reject a connecting client with an error order, then drop it.
    fn reject(&mut self, index: ClientIndex, order_name: &str, reason: &str) {
        info!(client = %index, reason, "rejected handshake");
        self.send_order_to(index, order_name, reason);
        queue_drop(&mut self.pending_drops, index, reason.into());
    }

    fn validate_client(&mut self, index: ClientIndex, data: &str) {
        let Some(conn) = self.connections.iter().find(|c| c.index == index) else {
            return;
        };
        let ip = conn.addr.ip().to_string();

        if self.state != ServerState::WaitingPlayers {
            self.reject(index, names::SERVER_ERROR, "The game has already started.");
            return;
        }
        let handshake = match HandshakeResponse::from_json(data) {
            Ok(handshake) => handshake,
            Err(e) => {
                queue_drop(
                    &mut self.pending_drops,
                    index,
                    format!("malformed handshake response: {e}"),
                );
                return;
            }
        };

        if let Some(password) = self.settings.password.as_deref().filter(|p| !p.is_empty()) {
            match handshake.password.as_deref() {
                Some(given) if given == password => {}
                None | Some("") => {
                    self.reject(index, names::AUTHENTICATION_ERROR, "Server requires a password.");
                    return;
                }
                Some(_) => {
                    self.reject(index, names::AUTHENTICATION_ERROR, "Incorrect password.");
                    return;
                }
            }
        }
        if handshake.mod_id != self.settings.mod_id {
            self.reject(index, names::SERVER_ERROR, "Server is running an incompatible mod.");
            return;
        }
        if handshake.version != self.settings.mod_version {
            self.reject(index, names::SERVER_ERROR, "Server is running an incompatible version.");
            return;
        }
        if handshake.orders_protocol != ORDERS_PROTOCOL_VERSION {
            self.reject(index, names::SERVER_ERROR, "Server is running an incompatible protocol.");
            return;
        }
        if self.settings.ban.contains(&ip) {
            self.reject(index, names::SERVER_ERROR, "You have been banned from the server.");
            return;
        }
        if self.temp_bans.contains(&ip) {
            self.reject(
                index,
                names::SERVER_ERROR,
                "You have been temporarily banned from the server.",
            );
            return;
        }
        let fingerprint = handshake.fingerprint.filter(|f| !f.is_empty());
        if self.settings.require_authentication && fingerprint.is_none() {
            self.reject(
                index,
                names::AUTHENTICATION_ERROR,
                "Server requires players to have an online profile.",
            );
            return;
        }

        let mut client = LobbyClient::new(index, sanitize_name(&handshake.client.name));
        client.state = ClientState::NotReady;
        client.ip_address = ip;
        client.fingerprint = fingerprint;
        client.color = handshake.client.preferred_color;
        client.is_admin = !self.lobby.clients.iter().any(|c| c.is_admin);
        client.slot = self.lobby.first_empty_slot();
        if let Some(slot) = client.slot.as_deref().and_then(|id| self.settings.map.slot(id)) {
            client.team = slot.team;
            if let Some(faction) = &slot.faction {
                client.faction = faction.clone();
            }
        }
        if client.is_observer() && !self.lobby.global.allow_spectators {
            self.reject(index, names::SERVER_ERROR, "The game is full.");
            return;
        }

        let name = client.name.clone();
        let is_admin = client.is_admin;
        info!(client = %index, name = %name, slot = ?client.slot, admin = is_admin, "client joined");
        self.lobby.add_client(client);
        if let Some(conn) = self.connections.iter_mut().find(|c| c.index == index) {
            conn.validated = true;
        }

        let join_cooldown = self.flood.limits().join_cooldown;
        if !is_admin && !join_cooldown.is_zero() {
            self.send_order_to(
                index,
                names::DISABLE_CHAT_ENTRY,
                &join_cooldown.as_millis().to_string(),
            );
        }
        self.sync_lobby_info();
        self.send_message(&format!("{name} has joined the game."));
        if let Some(motd) = self.settings.motd.clone().filter(|m| !m.is_empty()) {
            self.send_order_to(index, names::MESSAGE, &motd);
        }
    }

    // --- Routing ---

    fn is_validated(&self, index: ClientIndex) -> bool {
        self.connections
            .iter()
            .any(|c| c.index == index && c.validated)
    }

    fn is_dropping(&self, index: ClientIndex) -> bool {
        self.pending_drops.iter().any(|(i, _)| *i == index)
    }

    fn route_packet(&mut self, from: ClientIndex, packet: Packet) {
        if packet.frame.is_immediate() {
            self.route_immediate(from, &packet.payload);
        } else {
            self.route_synchronized(from, packet);
        }
    }

    fn route_immediate(&mut self, from: ClientIndex, payload: &[u8]) {
        if order::is_server_order(payload) {
            match parse_server_orders(payload) {
                Ok(orders) => {
                    for order in orders {
                        if self.is_dropping(from) {
                            break;
                        }
                        self.interpret_server_order(from, order);
                    }
                }
                Err(e) => queue_drop(
                    &mut self.pending_drops,
                    from,
                    format!("malformed server order: {e}"),
                ),
            }
        } else if self.is_validated(from) {
            self.broadcast_from(from, Frame::IMMEDIATE, payload);
        } else {
            queue_drop(
                &mut self.pending_drops,
                from,
                "sent orders before completing the handshake".into(),
            );
        }
    }

    fn route_synchronized(&mut self, from: ClientIndex, packet: Packet) {
        if !self.is_validated(from) {
            queue_drop(
                &mut self.pending_drops,
                from,
                "sent orders before completing the handshake".into(),
            );
            return;
        }
        if self.state != ServerState::GameStarted {
            debug!(client = %from, frame = %packet.frame, "discarding synchronized orders outside a game");
            return;
        }

        if order::is_sync_hash(&packet.payload) {
            match SyncHash::parse(&packet.payload) {
                Some(sync) => self.update_defeat_state(sync.defeat_state),
                None => warn!(
                    client = %from,
                    len = packet.payload.len(),
                    "malformed sync hash"
                ),
            }
            self.broadcast_from(from, packet.frame, &packet.payload);
        } else {
            if let Some(conn) = self.connections.iter_mut().find(|c| c.index == from) {
                conn.last_orders_frame = packet.frame;
            }
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.record(from, packet.frame, &packet.payload);
            }
            let entry = encode_relay_packet(from, packet.frame, &packet.payload);
            if let Err(e) = self.order_buffer.buffer_orders(from, entry) {
                warn!(client = %from, error = %e, "dropped synchronized orders");
            }
        }

        let connected: BTreeSet<ClientIndex> = self
            .connections
            .iter()
            .filter(|c| c.validated)
            .map(|c| c.index)
            .collect();
        if self.in_flight.acknowledge(packet.frame, from, &connected) {
            debug!(frame = %packet.frame, "frame complete");
        }
    }

    fn update_defeat_state(&mut self, defeat_state: u64) {
        for client in &mut self.lobby.clients {
            let Ok(bit) = u32::try_from(client.index.0) else {
                continue;
            };
            if bit < 64 && defeat_state & (1u64 << bit) != 0 && !client.defeated {
                info!(client = %client.index, name = %client.name, "client defeated");
                client.defeated = true;
            }
        }
    }

    fn interpret_server_order(&mut self, from: ClientIndex, order: ServerOrder) {
        if !self.is_validated(from) {
            if order.name == names::HANDSHAKE_RESPONSE {
                self.validate_client(from, &order.data);
            } else {
                queue_drop(
                    &mut self.pending_drops,
                    from,
                    format!("expected a handshake response, got {}", order.name),
                );
            }
            return;
        }

        match order.name.as_str() {
            names::COMMAND => self.interpret_command(from, &order.data),
            names::CHAT | names::TEAM_CHAT => self.relay_chat(from, &order),
            names::HANDSHAKE_RESPONSE => {
                debug!(client = %from, "ignoring repeated handshake response");
            }
            other => debug!(client = %from, order = other, "ignoring unknown server order"),
        }
    }

    fn relay_chat(&mut self, from: ClientIndex, order: &ServerOrder) {
        let is_admin = self
            .lobby
            .client_with_index(from)
            .is_some_and(|c| c.is_admin);
        let joined_at = self
            .connections
            .iter()
            .find(|c| c.index == from)
            .map(|c| c.joined_at);

        if let Some(joined_at) = joined_at.filter(|_| !is_admin) {
            match self.flood.check(from, joined_at, Instant::now()) {
                FloodVerdict::Blocked { remaining } => {
                    let seconds = remaining_seconds(remaining);
                    debug!(client = %from, seconds, "chat blocked by flood control");
                    self.send_order_to(
                        from,
                        names::MESSAGE,
                        &format!("Chat is disabled. Please try again in {seconds} seconds."),
                    );
                    return;
                }
                FloodVerdict::Allowed {
                    disable_chat_for: Some(cooldown),
                } => {
                    self.send_order_to(
                        from,
                        names::DISABLE_CHAT_ENTRY,
                        &cooldown.as_millis().to_string(),
                    );
                }
                FloodVerdict::Allowed {
                    disable_chat_for: None,
                } => {}
            }
        }
        self.broadcast_from(from, Frame::IMMEDIATE, &order.serialize());
    }

    fn interpret_command(&mut self, from: ClientIndex, command: &str) {
        let name = command.split_whitespace().next().unwrap_or_default();
        if self.state == ServerState::GameStarted && name != commands::VOTE_KICK {
            self.send_order_to(
                from,
                names::MESSAGE,
                &format!("Cannot change state when game started. ({command})"),
            );
            return;
        }
        let ready = self.lobby.client_with_index(from).is_some_and(|c| c.is_ready());
        if self.state == ServerState::WaitingPlayers
            && ready
            && name != commands::READY
            && name != commands::START_GAME
        {
            self.send_order_to(
                from,
                names::MESSAGE,
                "Cannot change state when marked as ready.",
            );
            return;
        }

        let handlers = mem::take(&mut self.command_handlers);
        let handled = handlers
            .iter()
            .any(|handler| handler.interpret_command(self, from, command));
        self.command_handlers = handlers;

        if !handled {
            info!(client = %from, command, "unknown server command");
            self.send_order_to(
                from,
                names::MESSAGE,
                &format!("Unknown server command: {command}"),
            );
        }
    }

    // --- Sending ---

    /// Send one server order to one connection, validated or not.
    pub(crate) fn send_order_to(&mut self, to: ClientIndex, name: &str, data: &str) {
        let bytes = encode_relay_packet(
            SERVER_CLIENT,
            Frame::IMMEDIATE,
            &ServerOrder::new(name, data).serialize(),
        );
        if let Some(conn) = self.connections.iter_mut().find(|c| c.index == to) {
            if let Err(e) = conn.send(&bytes) {
                queue_drop(&mut self.pending_drops, to, e.to_string());
            }
        }
    }

    /// Broadcast a chat-visible notice from the server.
    pub(crate) fn send_message(&mut self, text: &str) {
        info!("{text}");
        self.dispatch_server_orders(&ServerOrder::new(names::MESSAGE, text).serialize());
    }

    /// Send a server-authored frame-0 payload to every validated client.
    fn dispatch_server_orders(&mut self, payload: &[u8]) {
        let bytes = encode_relay_packet(SERVER_CLIENT, Frame::IMMEDIATE, payload);
        for conn in self.connections.iter_mut().filter(|c| c.validated) {
            if let Err(e) = conn.send(&bytes) {
                queue_drop(&mut self.pending_drops, conn.index, e.to_string());
            }
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(SERVER_CLIENT, Frame::IMMEDIATE, payload);
        }
    }

    /// Relay a payload from `from` to every other validated client.
    fn broadcast_from(&mut self, from: ClientIndex, frame: Frame, payload: &[u8]) {
        self.send_to_others(from, &encode_relay_packet(from, frame, payload));
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(from, frame, payload);
        }
    }

    pub(crate) fn sync_lobby_info(&mut self) {
        match self.lobby.to_json() {
            Ok(json) => {
                self.dispatch_server_orders(&ServerOrder::new(names::SYNC_INFO, json).serialize());
            }
            Err(e) => error!(error = %e, "failed to serialize lobby"),
        }
    }

    // --- Periodic work ---

    fn tick(&mut self, now: Instant) {
        let due = self
            .scheduler
            .as_mut()
            .is_some_and(|scheduler| scheduler.poll(now));
        if due && self.state == ServerState::GameStarted {
            self.flush_orders();
        }

        if let Some(outcome) = self.vote_kick.tick(now) {
            self.handle_vote_outcome(SERVER_CLIENT, outcome);
        }

        self.service_heartbeat(now, false);
    }

    fn flush_orders(&mut self) {
        let mut batch = DispatchBatch::default();
        self.order_buffer.flush(&mut batch);

        for (client, count) in batch.acks {
            let Some(conn) = self.connections.iter_mut().find(|c| c.index == client) else {
                continue;
            };
            let frame = conn.last_orders_frame;
            let mut remaining = count;
            while remaining > 0 {
                let n = remaining.min(MAX_ACK_COUNT);
                remaining -= n;
                let ack = encode_relay_packet(SERVER_CLIENT, frame, &order::encode_ack(n as u8));
                if let Err(e) = conn.send(&ack) {
                    queue_drop(&mut self.pending_drops, client, e.to_string());
                    break;
                }
            }
        }

        for (from, bytes) in batch.forwards {
            self.send_to_others(from, &bytes);
        }
    }

    /// Write already framed relay packets to every validated client except
    /// `from`. Nothing is recorded.
    fn send_to_others(&mut self, from: ClientIndex, bytes: &[u8]) {
        for conn in self
            .connections
            .iter_mut()
            .filter(|c| c.validated && c.index != from)
        {
            if let Err(e) = conn.send(bytes) {
                queue_drop(&mut self.pending_drops, conn.index, e.to_string());
            }
        }
    }

    fn listing_info(&self) -> ListingInfo {
        ListingInfo {
            name: self.settings.name.clone(),
            port: self.local_addr.port(),
            state: match self.state {
                ServerState::WaitingPlayers => 1,
                _ => 2,
            },
            players: self
                .lobby
                .non_bot_clients()
                .filter(|c| !c.is_observer())
                .count(),
            max_players: self.lobby.slots.len(),
            mod_id: self.settings.mod_id.clone(),
            version: self.settings.mod_version.clone(),
            map: self.settings.map.uid.clone(),
            protected: self.settings.password.as_deref().is_some_and(|p| !p.is_empty()),
        }
    }

    fn service_heartbeat(&mut self, now: Instant, force: bool) {
        if self.heartbeat.is_none() {
            return;
        }
        let info = self.listing_info();
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };
        let events = heartbeat.drain();
        if force {
            heartbeat.force(&info, now);
        } else {
            heartbeat.tick(&info, now);
        }

        for event in events {
            match event {
                HeartbeatEvent::Failed(_) => {
                    self.send_message("Master server communication failed.");
                }
                HeartbeatEvent::Recovered => {
                    self.send_message("Master server communication established.");
                }
            }
        }
    }

    // --- Votes ---

    pub(crate) fn handle_vote_outcome(&mut self, voter: ClientIndex, outcome: VoteOutcome) {
        let name_of = |server: &Self, index: ClientIndex| {
            server
                .lobby
                .client_with_index(index)
                .map_or_else(|| format!("Player {index}"), |c| c.name.clone())
        };
        match outcome {
            VoteOutcome::Rejected(rejection) => {
                let text = match rejection {
                    VoteRejection::GameNotStarted => {
                        "Vote kick is only available once the game has started.".to_string()
                    }
                    VoteRejection::SelfKick => "You cannot vote to kick yourself.".into(),
                    VoteRejection::KickeeIsAdmin => "You cannot vote to kick the host.".into(),
                    VoteRejection::NotEligible => "You are not eligible to vote.".into(),
                    VoteRejection::OtherVoteInProgress(kickee) => format!(
                        "A vote to kick {} is already in progress.",
                        name_of(self, kickee)
                    ),
                    VoteRejection::NoVoteInProgress => {
                        "There is no vote in progress to vote against.".into()
                    }
                    VoteRejection::OnCooldown(remaining) => format!(
                        "You must wait {} seconds before starting another vote.",
                        remaining_seconds(remaining)
                    ),
                };
                self.send_order_to(voter, names::MESSAGE, &text);
            }
            VoteOutcome::Started => {
                if let Some(kickee) = self.vote_kick.active_kickee() {
                    let text = format!(
                        "{} started a vote to kick {}.",
                        name_of(self, voter),
                        name_of(self, kickee)
                    );
                    self.send_message(&text);
                }
            }
            VoteOutcome::Recorded => {
                self.send_order_to(voter, names::MESSAGE, "Your vote has been recorded.");
            }
            VoteOutcome::Passed(kickee) | VoteOutcome::InstantKick(kickee) => {
                let text = format!("{} has been kicked by vote.", name_of(self, kickee));
                self.send_message(&text);
                self.temp_ban(kickee);
                queue_drop(&mut self.pending_drops, kickee, "kicked by vote".into());
            }
            VoteOutcome::Failed(kickee) => {
                let text = format!("The vote to kick {} has failed.", name_of(self, kickee));
                self.send_message(&text);
            }
            VoteOutcome::TimedOut(kickee) => {
                let text = format!("The vote to kick {} has timed out.", name_of(self, kickee));
                self.send_message(&text);
            }
            VoteOutcome::Cancelled(kickee) => {
                info!(client = %kickee, "vote kick cancelled: kickee left");
            }
        }
    }

    pub(crate) fn temp_ban(&mut self, index: ClientIndex) {
        if let Some(conn) = self.connections.iter().find(|c| c.index == index) {
            self.temp_bans.insert(conn.addr.ip().to_string());
        }
    }

    pub(crate) fn kick(&mut self, index: ClientIndex, reason: &str) {
        queue_drop(&mut self.pending_drops, index, reason.into());
    }

    pub(crate) fn game_started(&self) -> bool {
        self.state == ServerState::GameStarted
    }

    pub(crate) fn is_dedicated(&self) -> bool {
        self.settings.dedicated
    }

    // --- Game lifecycle ---

    pub(crate) fn start_game(&mut self) {
        if self.state != ServerState::WaitingPlayers {
            return;
        }
        let unvalidated: Vec<ClientIndex> = self
            .connections
            .iter()
            .filter(|c| !c.validated)
            .map(|c| c.index)
            .collect();
        for index in unvalidated {
            queue_drop(
                &mut self.pending_drops,
                index,
                "game started before the handshake completed".into(),
            );
        }
        self.process_drops();

        let now = Instant::now();
        self.state = ServerState::GameStarted;
        self.lobby.global.random_seed = rand::random();
        self.lobby.global.game_uid = format!("{:032x}", rand::random::<u128>());
        for client in &mut self.lobby.clients {
            client.defeated = false;
        }

        self.order_buffer = OrderBuffer::new();
        for conn in &self.connections {
            self.order_buffer.add_client(conn.index);
        }
        self.in_flight.clear();
        self.vote_kick.reset();
        self.scheduler = Some(NetScheduler::new(
            self.settings.net_frame_step(),
            self.settings.jank_threshold(),
            now,
        ));

        self.game_start_time = unix_time();
        self.replay_players = self
            .lobby
            .clients
            .iter()
            .map(|c| ReplayPlayer {
                index: c.index,
                name: c.name.clone(),
                team: c.team,
                slot: c.slot.clone(),
            })
            .collect();
        if let Some(dir) = self.settings.replay_dir.clone() {
            match ReplayRecorder::create(&dir, self.game_start_time) {
                Ok(recorder) => self.recorder = Some(recorder),
                Err(e) => warn!(error = %e, dir = %dir.display(), "replay recording disabled"),
            }
        }

        info!(
            players = self.connections.len(),
            seed = self.lobby.global.random_seed,
            "game started"
        );
        self.sync_lobby_info();
        self.dispatch_server_orders(&ServerOrder::new(names::START_GAME, "").serialize());
        self.service_heartbeat(now, true);

        if let Some(replay) = self.resume.take() {
            self.dispatch_resume(replay);
        }
    }

    fn dispatch_resume(&mut self, replay: Replay) {
        let resume_frame = replay.resume_frame();
        for chunk in replay.into_chunks() {
            for (client, frame, payload) in chunk.relay_packets() {
                let bytes = encode_relay_packet(client, frame, payload);
                for conn in self.connections.iter_mut().filter(|c| c.validated) {
                    if let Err(e) = conn.send(&bytes) {
                        queue_drop(&mut self.pending_drops, conn.index, e.to_string());
                    }
                }
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.record(client, frame, payload);
                }
            }
        }
        if let Some(frame) = resume_frame {
            info!(%frame, "resumed game from replay");
            for conn in &mut self.connections {
                conn.last_orders_frame = frame;
            }
        }
    }

    fn finish_recording(&mut self) {
        let Some(recorder) = self.recorder.take() else {
            return;
        };
        let metadata = ReplayMetadata {
            mod_id: self.settings.mod_id.clone(),
            version: self.settings.mod_version.clone(),
            map: self.settings.map.uid.clone(),
            start_time: self.game_start_time,
            players: mem::take(&mut self.replay_players),
        };
        recorder.finish(&metadata);
    }

    /// The last player left a running game.
    fn end_game(&mut self) {
        info!("game ended: all players left");
        self.finish_recording();
        self.scheduler = None;
        self.order_buffer = OrderBuffer::new();
        self.in_flight.clear();
        self.vote_kick.reset();

        if self.settings.dedicated {
            self.temp_bans.clear();
            self.lobby = build_lobby(&self.settings);
            self.state = ServerState::WaitingPlayers;
            info!("dedicated server waiting for players");
        } else {
            self.listener = None;
            self.state = ServerState::ShuttingDown;
        }
    }

    // --- Drops ---

    fn process_drops(&mut self) {
        while !self.pending_drops.is_empty() {
            let (index, reason) = self.pending_drops.remove(0);
            self.drop_client(index, &reason);
        }
    }

    fn drop_client(&mut self, index: ClientIndex, reason: &str) {
        let Some(pos) = self.connections.iter().position(|c| c.index == index) else {
            return;
        };
        let conn = self.connections.remove(pos);
        let was_validated = conn.validated;
        let last_orders_frame = conn.last_orders_frame;
        info!(client = %index, addr = %conn.addr, reason, "dropping connection");
        conn.close();

        let unsent = self.order_buffer.take_client(index);
        self.in_flight.forget_client(index);
        self.flood.remove(index);
        if let Some(outcome) = self.vote_kick.client_dropped(index) {
            self.handle_vote_outcome(index, outcome);
        }
        if !was_validated {
            return;
        }

        let dropped = self.lobby.remove_client(index);
        let name = dropped
            .as_ref()
            .map_or_else(|| format!("Player {index}"), |c| c.name.clone());
        let was_admin = dropped.is_some_and(|c| c.is_admin);
        self.send_message(&format!("{name} has disconnected."));

        if self.state == ServerState::GameStarted {
            // Orders read before the drop go out ahead of the marker, so the
            // marker never overtakes frames the others have not seen.
            for entry in &unsent {
                self.send_to_others(index, entry);
            }
            if self.connections.iter().any(|c| c.validated) {
                self.broadcast_from(index, last_orders_frame.next(), &order::disconnect_order());
            }
        }

        if was_admin && !self.settings.dedicated && self.state == ServerState::WaitingPlayers {
            self.shutdown_with_notice("The host has left the game.");
            return;
        }
        if was_admin && self.settings.dedicated {
            let next_admin = self
                .lobby
                .clients
                .iter_mut()
                .filter(|c| !c.is_bot())
                .min_by_key(|c| c.index);
            if let Some(client) = next_admin {
                client.is_admin = true;
                let text = format!("{} is now the admin.", client.name);
                self.send_message(&text);
            }
        }
        self.sync_lobby_info();

        let any_left = self.connections.iter().any(|c| c.validated);

        if !any_left && self.state == ServerState::GameStarted {
            self.end_game();
        }
    }

    fn shutdown_with_notice(&mut self, notice: &str) {
        self.send_message(notice);
        self.shutdown();
    }

    /// Stop listening, close every connection and cancel background work.
    pub fn shutdown(&mut self) {
        if self.listener.is_some() || !self.connections.is_empty() {
            info!("relay shutting down");
        }
        self.state = ServerState::ShuttingDown;
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.shutdown();
        }
        self.finish_recording();
        self.listener = None;
        for conn in self.connections.drain(..) {
            conn.close();
        }
        self.pending_drops.clear();
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Result<(), RelayError>>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Err(e) = self.join() {
            warn!(error = %e, "relay stopped with an error");
        }
    }

    /// Wait for the relay to exit on its own.
    pub fn join(mut self) -> Result<(), RelayError> {
        match self.thread.take().map(thread::JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!("relay thread panicked");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Run an already bound server on a background thread.
pub fn spawn_relay(mut server: Server) -> (RelayHandle, SocketAddr) {
    let addr = server.local_addr();
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();
    let thread = thread::spawn(move || server.run(&keep_running_clone));
    (
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    )
}

/// Bind and start the relay on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used to
/// let the OS pick a free port).
pub fn start_relay(settings: ServerSettings) -> Result<(RelayHandle, SocketAddr), RelayError> {
    Ok(spawn_relay(Server::bind(settings)?))
}
