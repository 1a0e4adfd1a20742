// CLI entry point for the lockstep relay.
//
// Starts a standalone relay that game clients connect to. Settings come from
// an optional JSON file (see `settings.rs`) with command-line overrides on
// top. Logging goes to stderr through `tracing-subscriber`; set `RUST_LOG`
// to change the filter (default `info`).
//
// The process runs until the relay shuts itself down (a non-dedicated game
// ends or its host leaves) or it is killed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lockstep_relay::replay::{Replay, ReplayMode};
use lockstep_relay::{RelayError, Server, ServerSettings, spawn_relay};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Lockstep order relay server")]
struct Args {
    /// JSON settings file. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<String>,

    /// Server name shown in the lobby and master-server listing.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Keep running and return to the lobby after every game.
    #[arg(long)]
    dedicated: bool,

    #[arg(long)]
    max_players: Option<usize>,

    /// Record replays into this directory.
    #[arg(long)]
    replay_dir: Option<PathBuf>,

    /// Resume the game recorded in this replay once the lobby starts.
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> Result<ServerSettings, RelayError> {
        let mut settings = match &self.config {
            Some(path) => ServerSettings::load(path)?,
            None => ServerSettings::default(),
        };
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(listen) = &self.listen {
            settings.listen_address = listen.clone();
        }
        if let Some(name) = &self.name {
            settings.name = name.clone();
        }
        if self.password.is_some() {
            settings.password = self.password.clone();
        }
        if self.dedicated {
            settings.dedicated = true;
        }
        if let Some(max_players) = self.max_players {
            settings.max_players = max_players;
        }
        if self.replay_dir.is_some() {
            settings.replay_dir = self.replay_dir.clone();
        }
        Ok(settings)
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::bind(args.settings()?)?;
    if let Some(path) = &args.resume {
        server.resume_from(Replay::open(path, ReplayMode::Resume)?);
    }

    let (handle, addr) = spawn_relay(server);
    info!(%addr, "relay started");
    handle.join()?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}
