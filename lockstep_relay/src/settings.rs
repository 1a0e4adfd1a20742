// Server settings.
//
// `ServerSettings` is the single configuration struct for a relay instance.
// It deserializes from JSON with `#[serde(default)]`, so a settings file only
// needs the fields it wants to change; the `relay` binary layers CLI
// overrides on top (see `main.rs`). Durations are stored as milliseconds or
// seconds in the file and exposed as `Duration` through helper methods.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flood::FloodLimits;

/// Size of the client index space. Index assignment never goes past this.
pub const MAX_CLIENTS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One player slot of the map being hosted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSlot {
    pub id: String,
    pub allow_bots: bool,
    pub required: bool,
    pub lock_team: bool,
    pub team: i32,
    pub faction: Option<String>,
}

impl Default for MapSlot {
    fn default() -> Self {
        Self {
            id: String::new(),
            allow_bots: true,
            required: false,
            lock_team: false,
            team: 0,
            faction: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapDefinition {
    pub uid: String,
    pub title: String,
    pub slots: Vec<MapSlot>,
}

impl Default for MapDefinition {
    fn default() -> Self {
        Self {
            uid: "default-map".into(),
            title: "Default Map".into(),
            slots: (0..4)
                .map(|i| MapSlot {
                    id: format!("Multi{i}"),
                    ..MapSlot::default()
                })
                .collect(),
        }
    }
}

impl MapDefinition {
    pub fn slot(&self, id: &str) -> Option<&MapSlot> {
        self.slots.iter().find(|s| s.id == id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub listen_address: String,
    pub port: u16,
    pub password: Option<String>,
    pub dedicated: bool,

    /// Advertise this server on the master server.
    pub advertise_online: bool,
    pub master_server_url: String,
    pub master_ping_interval_secs: u64,

    pub max_players: usize,
    pub mod_id: String,
    pub mod_version: String,
    pub map: MapDefinition,
    pub allow_spectators: bool,

    /// Reject clients that do not present a player fingerprint.
    pub require_authentication: bool,
    /// Permanently banned IP addresses.
    pub ban: Vec<String>,
    pub motd: Option<String>,

    pub flood_limit_interval_ms: u64,
    pub flood_limit_message_count: usize,
    pub flood_limit_cooldown_ms: u64,
    pub flood_limit_join_cooldown_ms: u64,

    pub vote_kick_timer_ms: u64,
    /// How long an initiator of a failed vote must wait before starting
    /// another one.
    pub vote_kick_no_repeat_ms: u64,

    pub timestep_ms: u32,
    pub net_frame_interval: u32,
    pub jank_threshold_ms: u64,
    pub poll_timeout_ms: u64,

    /// Directory for recorded replays. Recording is off when unset.
    pub replay_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Lockstep Server".into(),
            listen_address: "0.0.0.0".into(),
            port: 1234,
            password: None,
            dedicated: false,
            advertise_online: false,
            master_server_url: "http://master.example.net".into(),
            master_ping_interval_secs: 60,
            max_players: 8,
            mod_id: "ra".into(),
            mod_version: "dev".into(),
            map: MapDefinition::default(),
            allow_spectators: true,
            require_authentication: false,
            ban: Vec::new(),
            motd: None,
            flood_limit_interval_ms: 5000,
            flood_limit_message_count: 5,
            flood_limit_cooldown_ms: 15000,
            flood_limit_join_cooldown_ms: 5000,
            vote_kick_timer_ms: 30000,
            vote_kick_no_repeat_ms: 180_000,
            timestep_ms: 40,
            net_frame_interval: 3,
            jank_threshold_ms: 250,
            poll_timeout_ms: 100,
            replay_dir: None,
        }
    }
}

impl ServerSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Configured player cap, clamped to the client index space.
    pub fn effective_max_players(&self) -> usize {
        self.max_players.clamp(1, MAX_CLIENTS)
    }

    pub fn flood_limits(&self) -> FloodLimits {
        FloodLimits {
            interval: Duration::from_millis(self.flood_limit_interval_ms),
            message_count: self.flood_limit_message_count,
            cooldown: Duration::from_millis(self.flood_limit_cooldown_ms),
            join_cooldown: Duration::from_millis(self.flood_limit_join_cooldown_ms),
        }
    }

    /// Wall-clock duration of one network frame.
    pub fn net_frame_step(&self) -> Duration {
        Duration::from_millis(u64::from(self.timestep_ms) * u64::from(self.net_frame_interval.max(1)))
    }

    pub fn jank_threshold(&self) -> Duration {
        Duration::from_millis(self.jank_threshold_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn vote_kick_timer(&self) -> Duration {
        Duration::from_millis(self.vote_kick_timer_ms)
    }

    pub fn vote_kick_no_repeat(&self) -> Duration {
        Duration::from_millis(self.vote_kick_no_repeat_ms)
    }

    pub fn master_ping_interval(&self) -> Duration {
        Duration::from_secs(self.master_ping_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "Test Server", "port": 4321, "dedicated": true}}"#).unwrap();

        let settings = ServerSettings::load(file.path()).unwrap();
        assert_eq!(settings.name, "Test Server");
        assert_eq!(settings.port, 4321);
        assert!(settings.dedicated);
        assert_eq!(settings.flood_limit_message_count, 5);
        assert_eq!(settings.map.slots.len(), 4);
        assert_eq!(settings.map.slots[0].id, "Multi0");
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerSettings::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = ServerSettings::load(file.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }

    #[test]
    fn max_players_is_clamped() {
        let settings = ServerSettings {
            max_players: 500,
            ..ServerSettings::default()
        };
        assert_eq!(settings.effective_max_players(), MAX_CLIENTS);
    }

    #[test]
    fn net_frame_step_is_timestep_times_interval() {
        let settings = ServerSettings::default();
        assert_eq!(settings.net_frame_step(), Duration::from_millis(120));
    }
}
