// Loopback demo peer: runs either side of a lockstep session with a toy
// deterministic simulation, mostly useful for poking at the protocol with
// real sockets. `lockstep-net host <addr>` / `lockstep-net join <addr> <name>`.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use lockstep_net::command::{Command, CommandQueue, KIND_APPLICATION_BASE};
use lockstep_net::fields;
use lockstep_net::settings::{AiKind, GameSettings, PlayerSettings, SyncConfig};
use lockstep_net::simulation::SyncedSimulation;
use lockstep_net::sync::SyncHash;
use lockstep_net::transport;
use lockstep_net::{ClientEvent, ClientPeer, HostCoordinator, HostEvent, Time};

#[derive(Debug, Deserialize, Clone)]
struct Config {
    #[serde(default)]
    tracing: TracingConfig,
    #[serde(default)]
    sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct TracingConfig {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default = "default_level")]
    level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            level: default_level(),
        }
    }
}

fn default_format() -> String {
    "compact".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn load_config() -> Config {
    match fs::read_to_string("lockstep.toml") {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to parse lockstep.toml: {e}");
                eprintln!("Using default configuration");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

/// Toy deterministic simulation: the state is one accumulator folded over
/// every applied command. Divergence of any kind shows up in the hash.
struct CounterSimulation {
    time: Time,
    queue: CommandQueue,
    state: u64,
}

impl CounterSimulation {
    fn new() -> Self {
        Self {
            time: 0,
            queue: CommandQueue::new(),
            state: 0,
        }
    }

    fn apply(&mut self, command: &Command) {
        self.state = self
            .state
            .wrapping_mul(31)
            .wrapping_add(u64::from(command.due_time))
            .wrapping_add(u64::from(command.sender));
        for b in &command.payload {
            self.state = self.state.wrapping_mul(31).wrapping_add(u64::from(*b));
        }
    }
}

impl SyncedSimulation for CounterSimulation {
    fn enqueue_command(&mut self, command: Command) {
        self.queue.push(command);
    }

    fn gametime(&self) -> Time {
        self.time
    }

    fn advance_to(&mut self, time: Time) {
        if time <= self.time {
            return;
        }
        while let Some(cmd) = self.queue.pop_due(time) {
            self.time = cmd.due_time.max(self.time);
            self.apply(&cmd);
        }
        self.time = time;
    }

    fn sync_hash(&self) -> SyncHash {
        let mut state = Vec::with_capacity(12);
        state.extend_from_slice(&self.time.to_le_bytes());
        state.extend_from_slice(&self.state.to_le_bytes());
        SyncHash::of_state(&state)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();

    let log_level = match config.tracing.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level '{}', using INFO", config.tracing.level);
            tracing::Level::INFO
        }
    };
    match config.tracing.format.to_lowercase().as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .with_target(false)
                .pretty()
                .init();
        }
        "json" => {
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_max_level(log_level)
                .with_target(false)
                .init();
        }
    }

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("host") => {
            let addr = args.get(2).map(String::as_str).unwrap_or("0.0.0.0:7777");
            run_host(addr, config.sync).await
        }
        Some("join") => {
            let Some(addr) = args.get(2) else {
                bail!("usage: lockstep-net join <addr> [name]");
            };
            let name = args.get(3).cloned().unwrap_or_else(|| "guest".to_string());
            run_join(addr, name, config.sync).await
        }
        _ => bail!("usage: lockstep-net host [addr] | lockstep-net join <addr> [name]"),
    }
}

async fn run_host(addr: &str, sync: SyncConfig) -> Result<()> {
    let settings = GameSettings {
        map_name: "loopback".to_string(),
        random_seed: 4,
        default_speed: 1000,
        players: vec![
            PlayerSettings::human("host", 0, 1),
            PlayerSettings::human("guest1", 1, 2),
            PlayerSettings::human("guest2", 2, 2),
        ],
    };

    let (dir_tx, dir_rx) = mpsc::unbounded_channel();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(Mutex::new(HostCoordinator::new(
        sync,
        settings,
        0,
        CounterSimulation::new(),
        dir_tx,
        ev_tx,
    )));

    // Nobody is sitting at a demo host; abandoned slots always get the
    // passive AI.
    let decider = coordinator.clone();
    tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
            info!(event = ?event, "host event");
            if let HostEvent::DecisionRequired { slot, .. } = event {
                decider.lock().await.resolve_decision(slot, AiKind::Empty);
            }
        }
    });

    let listener = TcpListener::bind(addr).await?;
    transport::serve_host(listener, coordinator, dir_rx).await
}

async fn run_join(addr: &str, name: String, sync: SyncConfig) -> Result<()> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(Mutex::new(ClientPeer::new(
        sync,
        name,
        CounterSimulation::new(),
        out_tx,
        ev_tx,
    )));

    tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
            match event {
                ClientEvent::Disconnected { reason, arg } => warn!(
                    { fields::REASON } = reason.tag(),
                    arg = %arg,
                    "session over"
                ),
                other => info!(event = ?other, "client event"),
            }
        }
    });

    // Bot input so the session carries traffic.
    let input = peer.clone();
    tokio::spawn(async move {
        let mut n: u8 = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let mut p = input.lock().await;
            if !p.is_connected() {
                break;
            }
            p.submit_command(KIND_APPLICATION_BASE, vec![n]);
            n = n.wrapping_add(1);
        }
    });

    let stream = TcpStream::connect(addr).await?;
    transport::run_client(stream, peer, out_rx).await
}
