use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::{PlayerSlot, Time};
use crate::error::ProtocolError;
use crate::fields;

/// What kind of computer player takes over a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AiKind {
    /// Normal-strength AI, used when the departing player had already won.
    Normal,
    /// Passive AI that issues no orders, used for lost or resigned slots.
    Empty,
}

impl AiKind {
    pub fn to_wire(self) -> u8 {
        match self {
            AiKind::Normal => 0,
            AiKind::Empty => 1,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(AiKind::Normal),
            1 => Ok(AiKind::Empty),
            other => Err(ProtocolError::OutOfRange {
                field: "ai_kind",
                value: other as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerResult {
    Undefined,
    Won,
    Lost,
    Resigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSettings {
    pub name: String,
    pub slot: PlayerSlot,
    pub team: u8,
    /// None for a human-controlled slot.
    pub ai: Option<AiKind>,
    pub result: PlayerResult,
}

impl PlayerSettings {
    pub fn human(name: impl Into<String>, slot: PlayerSlot, team: u8) -> Self {
        Self {
            name: name.into(),
            slot,
            team,
            ai: None,
            result: PlayerResult::Undefined,
        }
    }
}

/// Immutable session snapshot exchanged at start. Later changes arrive as
/// ordinary commands, not through this structure; the engine only touches
/// the per-player result used by failure recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSettings {
    pub map_name: String,
    pub random_seed: u32,
    pub default_speed: u16,
    pub players: Vec<PlayerSettings>,
}

impl GameSettings {
    pub fn player(&self, slot: PlayerSlot) -> Option<&PlayerSettings> {
        self.players.iter().find(|p| p.slot == slot)
    }

    pub fn player_mut(&mut self, slot: PlayerSlot) -> Option<&mut PlayerSettings> {
        self.players.iter_mut().find(|p| p.slot == slot)
    }
}

/// Tunables of the synchronization policy. The original engine hard-coded
/// these; here they are configuration with conservative defaults, loadable
/// from a toml file.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// How often clients report their local time, in real milliseconds.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u32,
    /// A peer is hung once it lags the committed time by more than this
    /// many report intervals (scaled by the current speed).
    #[serde(default = "default_hang_multiplier")]
    pub hang_multiplier: u32,
    /// Logical gap between scheduled sync checkpoints.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: Time,
    /// How far ahead of the committed time a checkpoint is placed.
    #[serde(default = "default_checkpoint_lead_ms")]
    pub checkpoint_lead_ms: Time,
    /// In a 2-participant session the faster desired speed is pulled to
    /// within this delta of the slower one before taking the median.
    #[serde(default = "default_speed_clamp_delta")]
    pub speed_clamp_delta: u16,
    /// Interval between keepalive pings to each peer, real milliseconds.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
            hang_multiplier: default_hang_multiplier(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            checkpoint_lead_ms: default_checkpoint_lead_ms(),
            speed_clamp_delta: default_speed_clamp_delta(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

fn default_report_interval_ms() -> u32 {
    100
}

fn default_hang_multiplier() -> u32 {
    10
}

fn default_checkpoint_interval_ms() -> Time {
    2000
}

fn default_checkpoint_lead_ms() -> Time {
    500
}

fn default_speed_clamp_delta() -> u16 {
    1000
}

fn default_ping_interval_ms() -> u32 {
    1000
}

impl SyncConfig {
    /// Loads the config from a toml file, falling back to defaults when the
    /// file is absent or unparsable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        { fields::ERROR } = %e,
                        config_path = %path.display(),
                        "Failed to parse sync config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
