//! Lockstep network-synchronization engine.
//!
//! One authoritative host, any number of mirrored clients and (for playback)
//! a replay source all feed identical simulations with the same timestamped
//! command stream. The host owns the committed network time, stamps every
//! player command with its due time, schedules periodic full-state checksum
//! comparisons and recovers from peer failure without corrupting the
//! remaining session.

pub mod client;
pub mod command;
pub mod error;
pub mod fields;
pub mod host;
pub mod nettime;
pub mod protocol;
pub mod replay;
pub mod settings;
pub mod simulation;
pub mod sync;
pub mod transport;

pub use client::{ClientEvent, ClientPeer};
pub use command::{Command, CommandQueue, ConnId, PlayerSlot, Time};
pub use error::{DisconnectReason, PeerError, ProtocolError};
pub use host::{HostCoordinator, HostEvent, NetDirective};
pub use nettime::NetworkTime;
pub use protocol::{Packet, PROTOCOL_VERSION};
pub use replay::{ReplayError, ReplayReader, ReplayRecord, ReplayWriter};
pub use settings::{AiKind, GameSettings, PlayerResult, PlayerSettings, SyncConfig};
pub use simulation::SyncedSimulation;
pub use sync::{SyncHash, SyncReport, SyncVerifier};
