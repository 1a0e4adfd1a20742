// Master-server heartbeat.
//
// A public server periodically tells the master server it exists. The HTTP
// call runs on a short-lived background thread so the relay loop never waits
// on the network; its result comes back through an `mpsc` channel that the
// loop drains at the top of every iteration. That channel is the only state
// shared across threads.
//
// Only status transitions are reported back to the lobby: the first failure
// after a success (or at startup), and the first success after a failure.
// Repeated failures are logged but not re-announced.
//
// `shutdown()` sets a cancel flag that in-flight requests check before
// delivering their result, so nothing reaches a stopped server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the master server is told about this game.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingInfo {
    pub name: String,
    pub port: u16,
    /// 1 while waiting for players, 2 once the game has started.
    pub state: u8,
    pub players: usize,
    pub max_players: usize,
    pub mod_id: String,
    pub version: String,
    pub map: String,
    pub protected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Failed(String),
    Recovered,
}

pub struct MasterServerHeartbeat {
    url: String,
    interval: Duration,
    agent: ureq::Agent,
    last_ping: Option<Instant>,
    in_flight: bool,
    last_ok: Option<bool>,
    tx: Sender<Result<(), String>>,
    rx: Receiver<Result<(), String>>,
    cancelled: Arc<AtomicBool>,
}

impl MasterServerHeartbeat {
    pub fn new(url: impl Into<String>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            url: url.into(),
            interval,
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            last_ping: None,
            in_flight: false,
            last_ok: None,
            tx,
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ping if the interval has elapsed and no request is outstanding.
    pub fn tick(&mut self, info: &ListingInfo, now: Instant) {
        let due = self
            .last_ping
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.force(info, now);
        }
    }

    /// Ping now, unless a request is already outstanding.
    pub fn force(&mut self, info: &ListingInfo, now: Instant) {
        if self.in_flight || self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.in_flight = true;
        self.last_ping = Some(now);

        let agent = self.agent.clone();
        let url = format!("{}/ping", self.url.trim_end_matches('/'));
        let info = info.clone();
        let tx = self.tx.clone();
        let cancelled = self.cancelled.clone();
        thread::spawn(move || {
            let result = agent
                .get(&url)
                .query("port", &info.port.to_string())
                .query("name", &info.name)
                .query("state", &info.state.to_string())
                .query("players", &info.players.to_string())
                .query("mods", &format!("{}@{}", info.mod_id, info.version))
                .query("map", &info.map)
                .query("maxplayers", &info.max_players.to_string())
                .query("protected", if info.protected { "1" } else { "0" })
                .call()
                .map(|_| ())
                .map_err(|e| e.to_string());
            if !cancelled.load(Ordering::SeqCst) {
                let _ = tx.send(result);
            }
        });
    }

    /// Collect finished requests. Returns status transitions only.
    pub fn drain(&mut self) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            self.in_flight = false;
            match result {
                Ok(()) => {
                    debug!("master server heartbeat ok");
                    if self.last_ok == Some(false) {
                        events.push(HeartbeatEvent::Recovered);
                    }
                    self.last_ok = Some(true);
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, "master server heartbeat failed");
                    if self.last_ok != Some(false) {
                        events.push(HeartbeatEvent::Failed(e));
                    }
                    self.last_ok = Some(false);
                }
            }
        }
        events
    }

    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for MasterServerHeartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}
