// Integration smoke test for the relay server.
//
// Starts relays on localhost and drives them with `NetClient`s through the
// full lifecycle: handshake and lobby sync, chat, game start, synchronized
// order relay with acks, immediate sync hashes, disconnect markers, replay
// recording and resuming a recorded game (including one the relay wrote
// itself). Also covers the main rejection paths (incompatible client,
// connecting after the game started), orders still buffered when a client
// drops, and the dedicated-server admin handoff.
//
// Clients are plain TCP sockets using the protocol crate's framing; no game
// code is involved.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use lockstep_protocol::order::{self, names};
use lockstep_protocol::{
    ClientIndex, Frame, HandshakeResponse, LobbyInfo, RelayPacket, SyncHash,
};
use lockstep_relay::client::NetClient;
use lockstep_relay::replay::{Replay, ReplayMode, ReplayRecorder};
use lockstep_relay::{Server, ServerSettings, spawn_relay, start_relay};

const TIMEOUT: Duration = Duration::from_secs(5);

fn settings() -> ServerSettings {
    ServerSettings {
        listen_address: "127.0.0.1".into(),
        port: 0, // OS picks a free port
        flood_limit_join_cooldown_ms: 0,
        ..ServerSettings::default()
    }
}

fn connect(addr: SocketAddr, name: &str) -> NetClient {
    let client = NetClient::connect(&addr.to_string(), name, None).unwrap();
    // Wait until the relay has admitted us.
    client
        .wait_for_order(names::SYNC_INFO, TIMEOUT)
        .unwrap_or_else(|| panic!("{name} never received the lobby"));
    client
}

/// Wait for the first packet matching `pred`, discarding everything before.
fn wait_for(client: &NetClient, what: &str, pred: impl Fn(&RelayPacket) -> bool) -> RelayPacket {
    let deadline = Instant::now() + TIMEOUT;
    while let Some(packet) = client.recv_timeout(deadline.saturating_duration_since(Instant::now()))
    {
        if pred(&packet) {
            return packet;
        }
    }
    panic!("timed out waiting for {what}");
}

/// Wait for a server order named `name` whose data starts with `prefix`.
fn wait_for_text(client: &NetClient, name: &str, prefix: &str) -> String {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (_, order) = client
            .wait_for_order(name, remaining)
            .unwrap_or_else(|| panic!("timed out waiting for {name} {prefix:?}"));
        if order.data.starts_with(prefix) {
            return order.data;
        }
    }
}

fn replay_files(dir: &std::path::Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "lsr"))
        .collect()
}

#[test]
fn full_game_lifecycle() {
    let replay_dir = tempfile::tempdir().unwrap();
    let (handle, addr) = start_relay(ServerSettings {
        replay_dir: Some(replay_dir.path().to_path_buf()),
        ..settings()
    })
    .unwrap();

    // 1. First client: index 0, first slot, admin, alone in the lobby.
    let mut alice = NetClient::connect(&addr.to_string(), "Alice", None).unwrap();
    assert_eq!(alice.index, ClientIndex(0));
    let (_, sync) = alice.wait_for_order(names::SYNC_INFO, TIMEOUT).unwrap();
    let lobby = LobbyInfo::from_json(&sync.data).unwrap();
    assert_eq!(lobby.clients.len(), 1);
    assert_eq!(lobby.clients[0].index, ClientIndex(0));
    assert_eq!(lobby.clients[0].slot.as_deref(), Some("Multi0"));
    assert!(lobby.clients[0].is_admin);

    // 2. Second client joins; Alice hears about it.
    let mut bob = connect(addr, "Bob");
    assert_eq!(bob.index, ClientIndex(1));
    wait_for_text(&alice, names::MESSAGE, "Bob has joined the game.");

    // 3. Chat is relayed with the sender's index.
    bob.send_chat("hello").unwrap();
    let (packet, chat) = alice.wait_for_order(names::CHAT, TIMEOUT).unwrap();
    assert_eq!(packet.from, ClientIndex(1));
    assert_eq!(chat.data, "hello");

    // 4. Host starts the game.
    alice.send_command("startgame").unwrap();
    alice.wait_for_order(names::START_GAME, TIMEOUT).unwrap();
    bob.wait_for_order(names::START_GAME, TIMEOUT).unwrap();

    // 5. Synchronized orders reach everyone else; the sender gets an ack.
    let orders = vec![0x20, 1, 2, 3];
    alice.send_orders(Frame(1), &orders).unwrap();
    let relayed = wait_for(&bob, "Alice's orders", |p| {
        p.from == ClientIndex(0) && !p.frame.is_immediate()
    });
    assert_eq!(relayed.frame, Frame(1));
    assert_eq!(relayed.payload, orders);

    let ack = wait_for(&alice, "ack", |p| order::parse_ack(&p.payload).is_some());
    assert_eq!(ack.frame, Frame(1));
    assert_eq!(order::parse_ack(&ack.payload), Some(1));
    std::thread::sleep(Duration::from_millis(300));
    assert!(alice.poll().iter().all(|p| p.payload != orders));

    // 6. Sync hashes are relayed at once, not buffered.
    let hash = SyncHash {
        hash: 0x1234,
        defeat_state: 0,
    }
    .serialize();
    bob.send_orders(Frame(1), &hash).unwrap();
    let relayed = wait_for(&alice, "sync hash", |p| order::is_sync_hash(&p.payload));
    assert_eq!(relayed.from, ClientIndex(1));
    assert_eq!(relayed.frame, Frame(1));

    // 7. A dropped client is announced one frame after its last orders.
    bob.send_orders(Frame(2), &[0x20, 9]).unwrap();
    wait_for(&alice, "Bob's orders", |p| {
        p.from == ClientIndex(1) && p.frame == Frame(2)
    });
    bob.disconnect();
    let marker = wait_for(&alice, "disconnect marker", |p| order::is_disconnect(&p.payload));
    assert_eq!(marker.from, ClientIndex(1));
    assert_eq!(marker.frame, Frame(3));

    // 8. The last player leaving ends a non-dedicated game.
    alice.disconnect();
    handle.join().unwrap();

    let files = replay_files(replay_dir.path());
    assert_eq!(files.len(), 1);
    let replay = Replay::open(&files[0], ReplayMode::Viewer).unwrap();
    let metadata = replay.metadata.as_ref().expect("replay metadata");
    let players: Vec<&str> = metadata.players.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(players, vec!["Alice", "Bob"]);
    assert!(replay.clients.contains(&ClientIndex(1)));
    assert!(replay.disconnected.contains(&ClientIndex(1)));
}

#[test]
fn orders_buffered_at_drop_reach_others_before_the_marker() {
    let (handle, addr) = start_relay(ServerSettings {
        // One flush a minute: Bob's orders are still buffered when he drops.
        net_frame_interval: 1500,
        ..settings()
    })
    .unwrap();
    let mut alice = connect(addr, "Alice");
    let mut bob = connect(addr, "Bob");
    alice.send_command("startgame").unwrap();
    alice.wait_for_order(names::START_GAME, TIMEOUT).unwrap();
    bob.wait_for_order(names::START_GAME, TIMEOUT).unwrap();

    bob.send_orders(Frame(1), &[0x20, 1]).unwrap();
    bob.send_orders(Frame(2), &[0x20, 2]).unwrap();
    bob.disconnect();

    let mut from_bob = Vec::new();
    loop {
        let packet = wait_for(&alice, "Bob's packets", |p| p.from == ClientIndex(1));
        let done = order::is_disconnect(&packet.payload);
        from_bob.push((packet.frame, packet.payload));
        if done {
            break;
        }
    }
    assert_eq!(
        from_bob,
        vec![
            (Frame(1), vec![0x20, 1]),
            (Frame(2), vec![0x20, 2]),
            (Frame(3), order::disconnect_order()),
        ]
    );

    handle.stop();
}

#[test]
fn incompatible_client_is_rejected() {
    let (handle, addr) = start_relay(settings()).unwrap();

    let client = NetClient::connect_with(&addr.to_string(), |request| {
        let mut response = HandshakeResponse::answering(request, "Old");
        response.version = "ancient".into();
        response
    })
    .unwrap();
    let (_, error) = client
        .wait_for_order(names::SERVER_ERROR, TIMEOUT)
        .expect("server error");
    assert_eq!(error.data, "Server is running an incompatible version.");
    // Then the relay closes the connection.
    assert!(client.recv_timeout(TIMEOUT).is_none());

    handle.stop();
}

#[test]
fn running_game_refuses_joins_and_lobby_commands() {
    let (handle, addr) = start_relay(settings()).unwrap();
    let mut alice = connect(addr, "Alice");
    alice.send_command("startgame").unwrap();
    alice.wait_for_order(names::START_GAME, TIMEOUT).unwrap();

    assert!(NetClient::connect(&addr.to_string(), "Late", None).is_err());

    alice.send_command("slot Multi1").unwrap();
    let text = wait_for_text(&alice, names::MESSAGE, "Cannot change state");
    assert_eq!(text, "Cannot change state when game started. (slot Multi1)");

    handle.stop();
}

#[test]
fn dedicated_server_hands_admin_to_next_client() {
    let (handle, addr) = start_relay(ServerSettings {
        dedicated: true,
        ..settings()
    })
    .unwrap();
    let mut alice = connect(addr, "Alice");
    let bob = connect(addr, "Bob");

    alice.disconnect();
    wait_for_text(&bob, names::MESSAGE, "Bob is now the admin.");
    let (_, sync) = bob.wait_for_order(names::SYNC_INFO, TIMEOUT).unwrap();
    let lobby = LobbyInfo::from_json(&sync.data).unwrap();
    assert_eq!(lobby.clients.len(), 1);
    assert!(lobby.clients[0].is_admin);

    handle.stop();
}

#[test]
fn chat_is_blocked_during_join_cooldown() {
    let (handle, addr) = start_relay(ServerSettings {
        flood_limit_join_cooldown_ms: 60_000,
        ..settings()
    })
    .unwrap();
    let _alice = connect(addr, "Alice");

    let mut bob = NetClient::connect(&addr.to_string(), "Bob", None).unwrap();
    let (_, disable) = bob
        .wait_for_order(names::DISABLE_CHAT_ENTRY, TIMEOUT)
        .expect("chat disabled on join");
    assert_eq!(disable.data, "60000");

    bob.send_chat("too soon").unwrap();
    wait_for_text(&bob, names::MESSAGE, "Chat is disabled.");

    handle.stop();
}

#[test]
fn resumed_game_replays_orders_and_unpauses() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = ReplayRecorder::create(dir.path(), 0).unwrap();
    recorder.record(ClientIndex(0), Frame(1), &[0x20, 0xA]);
    recorder.record(ClientIndex(1), Frame(1), &[0x20, 0xB]);
    recorder.record(ClientIndex(0), Frame(2), &[0x20, 0xC]);
    let path = recorder
        .finish(&Default::default())
        .expect("replay written");

    let mut server = Server::bind(settings()).unwrap();
    server.resume_from(Replay::open(&path, ReplayMode::Resume).unwrap());
    let (handle, addr) = spawn_relay(server);

    let mut alice = connect(addr, "Alice");
    alice.send_command("startgame").unwrap();
    alice.wait_for_order(names::START_GAME, TIMEOUT).unwrap();

    // The unfinished last frame is discarded; frame 1 is re-sent as
    // recorded, then every surviving client unpauses at frame 2.
    let from_b = wait_for(&alice, "recorded orders", |p| p.from == ClientIndex(1));
    assert_eq!(from_b.frame, Frame(1));
    assert_eq!(from_b.payload, vec![0x20, 0xB]);
    let unpause = wait_for(&alice, "unpause", |p| p.payload.first() == Some(&0xFF));
    assert_eq!(unpause.frame, Frame(2));

    // New orders continue after the resume frame.
    alice.send_orders(Frame(3), &[0x20, 0xD]).unwrap();
    let ack = wait_for(&alice, "ack", |p| order::parse_ack(&p.payload).is_some());
    assert_eq!(ack.frame, Frame(3));

    handle.stop();
}

#[test]
fn resuming_a_recorded_game_skips_its_server_orders() {
    let replay_dir = tempfile::tempdir().unwrap();
    let (handle, addr) = start_relay(ServerSettings {
        replay_dir: Some(replay_dir.path().to_path_buf()),
        ..settings()
    })
    .unwrap();
    let mut alice = connect(addr, "Alice");
    alice.send_command("startgame").unwrap();
    alice.wait_for_order(names::START_GAME, TIMEOUT).unwrap();
    alice.send_chat("recorded chat").unwrap();
    for frame in [1, 2] {
        alice.send_orders(Frame(frame), &[0x20, frame as u8]).unwrap();
        wait_for(&alice, "ack", |p| order::parse_ack(&p.payload).is_some());
    }
    alice.disconnect();
    handle.join().unwrap();

    let files = replay_files(replay_dir.path());
    assert_eq!(files.len(), 1);
    let mut server = Server::bind(settings()).unwrap();
    server.resume_from(Replay::open(&files[0], ReplayMode::Resume).unwrap());
    let (handle, addr) = spawn_relay(server);

    let mut carol = connect(addr, "Carol");
    carol.send_command("startgame").unwrap();
    carol.wait_for_order(names::START_GAME, TIMEOUT).unwrap();

    // Between the live StartGame and the unpause only the recorded frame 1
    // orders arrive; the old game's lobby sync, start and notices do not.
    let mut server_orders = Vec::new();
    let mut replayed = Vec::new();
    loop {
        let packet = wait_for(&carol, "unpause", |_| true);
        if packet.payload.first() == Some(&0xFF) {
            assert_eq!(packet.frame, Frame(2));
            break;
        }
        if order::is_server_order(&packet.payload) {
            for server_order in lockstep_protocol::parse_server_orders(&packet.payload).unwrap() {
                server_orders.push(server_order.name);
            }
        } else {
            replayed.push((packet.frame, packet.payload));
        }
    }
    assert!(server_orders.is_empty(), "replayed server orders: {server_orders:?}");
    assert_eq!(replayed, vec![(Frame(1), vec![0x20, 1])]);

    handle.stop();
}
