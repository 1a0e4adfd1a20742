// Lobby and in-game commands sent as `Command` server orders.
//
// The server keeps an ordered list of `InterpretCommand` handlers and offers
// every command to each in turn; the first one that returns `true` has
// claimed it, and a command nobody claims is answered with an "unknown
// command" notice. Handlers are stateless and get the whole `Server` to work
// with, so they can edit the lobby, reply to the sender, broadcast and start
// the game.
//
// Gating that applies to every command (game already running, sender marked
// ready) lives in `Server::interpret_command`, not here.
//
// A command is a name followed by free-form arguments: `slot Multi1`,
// `kick 3 tempban`, `vote_kick 2 true`.

use std::time::Instant;

use lockstep_protocol::order::names;
use lockstep_protocol::{ClientIndex, ClientState};
use tracing::info;

use crate::server::{Server, sanitize_name};
use crate::vote_kick::{VoteContext, Voter};

pub const READY: &str = "ready";
pub const START_GAME: &str = "startgame";
pub const VOTE_KICK: &str = "vote_kick";

pub trait InterpretCommand: Send {
    /// Handle `command` from client `from`. Returns `false` if this handler
    /// does not recognize the command name.
    fn interpret_command(&self, server: &mut Server, from: ClientIndex, command: &str) -> bool;
}

pub fn default_handlers() -> Vec<Box<dyn InterpretCommand>> {
    vec![Box::new(LobbyCommands), Box::new(VoteKickCommand)]
}

/// Split a command into its name and the (trimmed) rest.
fn split(command: &str) -> (&str, &str) {
    let command = command.trim();
    match command.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (command, ""),
    }
}

fn reply(server: &mut Server, to: ClientIndex, text: &str) {
    server.send_order_to(to, names::MESSAGE, text);
}

fn is_admin(server: &Server, index: ClientIndex) -> bool {
    server
        .lobby
        .client_with_index(index)
        .is_some_and(|c| c.is_admin)
}

/// Seating, readiness, naming and admin moderation.
pub struct LobbyCommands;

impl InterpretCommand for LobbyCommands {
    fn interpret_command(&self, server: &mut Server, from: ClientIndex, command: &str) -> bool {
        let (name, args) = split(command);
        match name {
            READY => toggle_ready(server, from),
            START_GAME => start_game(server, from),
            "slot" => take_slot(server, from, args),
            "spectate" => spectate(server, from),
            "name" => rename(server, from, args),
            "team" => set_team(server, from, args),
            "allow_spectators" => allow_spectators(server, from, args),
            "kick" => kick(server, from, args),
            _ => return false,
        }
        true
    }
}

fn toggle_ready(server: &mut Server, from: ClientIndex) {
    let Some(client) = server.lobby.client_with_index_mut(from) else {
        return;
    };
    client.state = if client.is_ready() {
        ClientState::NotReady
    } else {
        ClientState::Ready
    };
    server.sync_lobby_info();

    if server.lobby.non_bot_clients().all(|c| c.is_ready()) {
        info!("all clients ready");
        server.start_game();
    }
}

fn start_game(server: &mut Server, from: ClientIndex) {
    if !is_admin(server, from) {
        reply(server, from, "Only the host can start the game.");
        return;
    }
    let lobby = &server.lobby;
    let missing_required = lobby
        .slots
        .iter()
        .any(|s| s.required && lobby.client_in_slot(&s.id).is_none());
    if missing_required {
        reply(
            server,
            from,
            "Unable to start the game until required slots are full.",
        );
        return;
    }
    server.start_game();
}

fn take_slot(server: &mut Server, from: ClientIndex, slot_id: &str) {
    let (closed, occupant) = match server.lobby.slot(slot_id) {
        Some(slot) => (
            slot.closed,
            server.lobby.client_in_slot(slot_id).map(|c| c.index),
        ),
        None => {
            reply(server, from, &format!("Invalid slot: {slot_id}"));
            return;
        }
    };
    if closed {
        reply(server, from, "That slot is closed.");
        return;
    }
    match occupant {
        Some(index) if index == from => return,
        Some(_) => {
            reply(server, from, "That slot is already taken.");
            return;
        }
        None => {}
    }

    let team = server.settings().map.slot(slot_id).map_or(0, |s| s.team);
    if let Some(client) = server.lobby.client_with_index_mut(from) {
        client.slot = Some(slot_id.to_string());
        client.team = team;
        client.state = ClientState::NotReady;
    }
    server.sync_lobby_info();
}

fn spectate(server: &mut Server, from: ClientIndex) {
    if !server.lobby.global.allow_spectators && !is_admin(server, from) {
        reply(server, from, "Spectators are not allowed in this game.");
        return;
    }
    if let Some(client) = server.lobby.client_with_index_mut(from) {
        client.slot = None;
        client.team = 0;
        client.state = ClientState::NotReady;
    }
    server.sync_lobby_info();
}

fn rename(server: &mut Server, from: ClientIndex, args: &str) {
    if args.is_empty() {
        reply(server, from, "Usage: name <new name>");
        return;
    }
    let new_name = sanitize_name(args);
    let Some(client) = server.lobby.client_with_index_mut(from) else {
        return;
    };
    if client.name == new_name {
        return;
    }
    let old_name = std::mem::replace(&mut client.name, new_name.clone());
    server.send_message(&format!("{old_name} is now known as {new_name}."));
    server.sync_lobby_info();
}

fn set_team(server: &mut Server, from: ClientIndex, args: &str) {
    let Ok(team) = args.parse::<i32>() else {
        reply(server, from, &format!("Invalid team: {args}"));
        return;
    };
    let locked = server
        .lobby
        .client_with_index(from)
        .and_then(|c| c.slot.as_deref())
        .and_then(|id| server.lobby.slot(id))
        .is_some_and(|s| s.lock_team);
    if locked {
        reply(server, from, "Your team is locked by the map.");
        return;
    }
    if let Some(client) = server.lobby.client_with_index_mut(from) {
        client.team = team;
    }
    server.sync_lobby_info();
}

fn allow_spectators(server: &mut Server, from: ClientIndex, args: &str) {
    if !is_admin(server, from) {
        reply(server, from, "Only the host can change that setting.");
        return;
    }
    let Ok(allow) = args.parse::<bool>() else {
        reply(server, from, "Usage: allow_spectators <true|false>");
        return;
    };
    server.lobby.global.allow_spectators = allow;
    server.sync_lobby_info();
}

fn kick(server: &mut Server, from: ClientIndex, args: &str) {
    if !is_admin(server, from) {
        reply(server, from, "Only the host can kick players.");
        return;
    }
    let mut parts = args.split_whitespace();
    let Some(target) = parts.next().and_then(|s| s.parse::<i32>().ok()).map(ClientIndex) else {
        reply(server, from, "Usage: kick <client index> [tempban]");
        return;
    };
    let temp_ban = matches!(parts.next(), Some("tempban" | "true"));
    if target == from {
        reply(server, from, "You cannot kick yourself.");
        return;
    }
    let Some(kicked) = server.lobby.client_with_index(target).map(|c| c.name.clone()) else {
        reply(server, from, &format!("No client with index {target}."));
        return;
    };
    let admin = server
        .lobby
        .client_with_index(from)
        .map(|c| c.name.clone())
        .unwrap_or_default();

    server.send_message(&format!("{admin} kicked {kicked} from the server."));
    if temp_ban {
        server.temp_ban(target);
    }
    server.kick(target, "kicked by admin");
}

/// `vote_kick <client index> <true|false>`, the only command accepted while
/// a game is running.
pub struct VoteKickCommand;

impl InterpretCommand for VoteKickCommand {
    fn interpret_command(&self, server: &mut Server, from: ClientIndex, command: &str) -> bool {
        let (name, args) = split(command);
        if name != VOTE_KICK {
            return false;
        }

        let mut parts = args.split_whitespace();
        let kickee = parts.next().and_then(|s| s.parse::<i32>().ok()).map(ClientIndex);
        let in_favor = parts.next().and_then(|s| s.parse::<bool>().ok());
        let (Some(kickee), Some(in_favor)) = (kickee, in_favor) else {
            reply(server, from, "Usage: vote_kick <client index> <true|false>");
            return true;
        };
        let Some(kickee_is_admin) = server.lobby.client_with_index(kickee).map(|c| c.is_admin)
        else {
            reply(server, from, &format!("No client with index {kickee}."));
            return true;
        };

        let voters: Vec<Voter> = server
            .lobby
            .non_bot_clients()
            .map(|c| Voter {
                index: c.index,
                has_power: c.is_admin || (!c.defeated && !c.is_observer()),
            })
            .collect();
        let ctx = VoteContext {
            game_started: server.game_started(),
            dedicated: server.is_dedicated(),
            kickee_is_admin,
            voters: &voters,
        };
        let outcome = server
            .vote_kick
            .vote(&ctx, from, kickee, in_favor, Instant::now());
        server.handle_vote_outcome(from, outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::LobbyClient;

    use super::*;
    use crate::server::ServerState;
    use crate::settings::ServerSettings;

    /// A bound server with `names` already seated; no sockets involved.
    fn server_with(names: &[&str]) -> Server {
        let mut server = Server::bind(ServerSettings {
            listen_address: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        })
        .unwrap();
        for (i, name) in names.iter().enumerate() {
            let mut client = LobbyClient::new(ClientIndex(i as i32), *name);
            client.state = ClientState::NotReady;
            client.is_admin = i == 0;
            client.slot = server.lobby.first_empty_slot();
            server.lobby.add_client(client);
        }
        server
    }

    fn run(server: &mut Server, from: i32, command: &str) -> bool {
        let handlers = default_handlers();
        handlers
            .iter()
            .any(|h| h.interpret_command(server, ClientIndex(from), command))
    }

    #[test]
    fn split_separates_name_and_args() {
        assert_eq!(split("slot Multi1"), ("slot", "Multi1"));
        assert_eq!(split("  ready "), ("ready", ""));
        assert_eq!(split("kick 3   tempban"), ("kick", "3   tempban"));
    }

    #[test]
    fn unknown_commands_are_not_claimed() {
        let mut server = server_with(&["Host"]);
        assert!(!run(&mut server, 0, "dance"));
        assert!(!run(&mut server, 0, ""));
    }

    #[test]
    fn ready_toggles_and_everyone_ready_starts() {
        let mut server = server_with(&["Host", "Guest"]);
        assert!(run(&mut server, 0, "ready"));
        assert!(server.lobby().clients[0].is_ready());
        assert!(run(&mut server, 0, "ready"));
        assert!(!server.lobby().clients[0].is_ready());

        run(&mut server, 0, "ready");
        assert_eq!(server.state(), ServerState::WaitingPlayers);
        run(&mut server, 1, "ready");
        assert_eq!(server.state(), ServerState::GameStarted);
    }

    #[test]
    fn only_admin_starts_game() {
        let mut server = server_with(&["Host", "Guest"]);
        run(&mut server, 1, "startgame");
        assert_eq!(server.state(), ServerState::WaitingPlayers);
        run(&mut server, 0, "startgame");
        assert_eq!(server.state(), ServerState::GameStarted);
    }

    #[test]
    fn required_slot_blocks_start() {
        let mut server = server_with(&["Host"]);
        server.lobby.slots[1].required = true;
        run(&mut server, 0, "startgame");
        assert_eq!(server.state(), ServerState::WaitingPlayers);
    }

    #[test]
    fn slot_change_respects_occupancy() {
        let mut server = server_with(&["Host", "Guest"]);
        run(&mut server, 1, "slot Multi0");
        assert_eq!(server.lobby().clients[1].slot.as_deref(), Some("Multi1"));

        run(&mut server, 1, "slot Multi3");
        assert_eq!(server.lobby().clients[1].slot.as_deref(), Some("Multi3"));

        run(&mut server, 1, "slot Nowhere");
        assert_eq!(server.lobby().clients[1].slot.as_deref(), Some("Multi3"));
    }

    #[test]
    fn spectate_honours_allow_spectators() {
        let mut server = server_with(&["Host", "Guest"]);
        run(&mut server, 0, "allow_spectators false");
        assert!(!server.lobby().global.allow_spectators);

        run(&mut server, 1, "spectate");
        assert!(!server.lobby().clients[1].is_observer());

        run(&mut server, 0, "allow_spectators true");
        run(&mut server, 1, "spectate");
        assert!(server.lobby().clients[1].is_observer());
    }

    #[test]
    fn rename_and_team() {
        let mut server = server_with(&["Host"]);
        run(&mut server, 0, "name   Captain  ");
        assert_eq!(server.lobby().clients[0].name, "Captain");

        run(&mut server, 0, "team 2");
        assert_eq!(server.lobby().clients[0].team, 2);
        run(&mut server, 0, "team blue");
        assert_eq!(server.lobby().clients[0].team, 2);

        server.lobby.slots[0].lock_team = true;
        run(&mut server, 0, "team 3");
        assert_eq!(server.lobby().clients[0].team, 2);
    }

    #[test]
    fn non_admin_cannot_change_settings() {
        let mut server = server_with(&["Host", "Guest"]);
        run(&mut server, 1, "allow_spectators false");
        assert!(server.lobby().global.allow_spectators);
    }

    #[test]
    fn vote_kick_needs_a_running_game() {
        let mut server = server_with(&["Host", "A", "B"]);
        assert!(run(&mut server, 0, "vote_kick 2 true"));
        assert_eq!(server.vote_kick.active_kickee(), None);
    }

    #[test]
    fn vote_kick_majority_passes() {
        let mut server = server_with(&["Host", "A", "B"]);
        server.start_game();
        assert_eq!(server.state(), ServerState::GameStarted);

        run(&mut server, 0, "vote_kick 2 true");
        assert_eq!(server.vote_kick.active_kickee(), Some(ClientIndex(2)));
        run(&mut server, 1, "vote_kick 2 true");
        assert_eq!(server.vote_kick.active_kickee(), None);
    }

    #[test]
    fn vote_kick_malformed_is_still_claimed() {
        let mut server = server_with(&["Host"]);
        assert!(run(&mut server, 0, "vote_kick"));
        assert!(run(&mut server, 0, "vote_kick 9 true"));
    }
}
