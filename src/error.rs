use thiserror::Error;

use crate::command::{PlayerSlot, Time};

/// Errors raised while decoding or validating wire frames. Every variant is
/// fatal to the connection that produced it; a malformed peer is never
/// allowed to keep talking, because trusting broken input risks silent
/// divergence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated while reading {field}")]
    Truncated { field: &'static str },
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("incompatible protocol version {got} (expected {expected})")]
    VersionMismatch { got: u8, expected: u8 },
    #[error("out-of-range value {value} for {field}")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("{len} trailing byte(s) after payload")]
    TrailingBytes { len: usize },
    #[error("payload of {len} bytes exceeds the frame limit")]
    Oversized { len: usize },
    #[error("string field {field} is not valid utf-8")]
    BadString { field: &'static str },
}

/// Disconnect-worthy conditions detected above the codec: wrong sender,
/// time discipline violations, stray sync reports. Each maps onto a wire
/// [`DisconnectReason`] at the single translation point in the host.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("command attributed to sender {claimed}, connection controls {authorized:?}")]
    WrongSender {
        claimed: PlayerSlot,
        authorized: Option<PlayerSlot>,
    },
    #[error("client sent a command with a preassigned due time {due_time}")]
    PreassignedDueTime { due_time: Time },
    #[error("reported time {reported} ran backwards (previously {previous})")]
    TimeRanBackwards { reported: Time, previous: Time },
    #[error("reported time {reported} is ahead of committed time {committed}")]
    AheadOfCommit { reported: Time, committed: Time },
    #[error("sync report for time {reported} does not match outstanding checkpoint {expected:?}")]
    StraySyncReport {
        reported: Time,
        expected: Option<Time>,
    },
    #[error("broadcast command arrived without a due time")]
    UnstampedCommand,
    #[error("opcode 0x{opcode:02x} is not valid for this side of the connection")]
    UnexpectedPacket { opcode: u8 },
    #[error("message not allowed before handshake")]
    NotWelcomed,
}

impl PeerError {
    pub fn reason(&self) -> DisconnectReason {
        match self {
            PeerError::Protocol(ProtocolError::VersionMismatch { .. }) => {
                DisconnectReason::IncompatibleVersion
            }
            PeerError::Protocol(_) | PeerError::NotWelcomed => DisconnectReason::ProtocolViolation,
            PeerError::WrongSender { .. } | PeerError::PreassignedDueTime { .. } => {
                DisconnectReason::WrongSender
            }
            PeerError::TimeRanBackwards { .. } | PeerError::AheadOfCommit { .. } => {
                DisconnectReason::TimeViolation
            }
            PeerError::StraySyncReport { .. }
            | PeerError::UnstampedCommand
            | PeerError::UnexpectedPacket { .. } => DisconnectReason::ProtocolViolation,
        }
    }
}

type ReasonCode = u8;
const REASON_SHUTDOWN: ReasonCode = 0;
const REASON_INCOMPATIBLE_VERSION: ReasonCode = 1;
const REASON_PROTOCOL_VIOLATION: ReasonCode = 2;
const REASON_WRONG_SENDER: ReasonCode = 3;
const REASON_TIME_VIOLATION: ReasonCode = 4;
const REASON_DESYNCED: ReasonCode = 5;
const REASON_CONNECTION_LOST: ReasonCode = 6;
const REASON_KICKED: ReasonCode = 7;

/// Wire reason codes carried by the DISCONNECT message. The free-text
/// argument next to the code holds diagnostic detail; localization of the
/// user-facing message happens at the UI boundary, keyed by [`Self::tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Shutdown,
    IncompatibleVersion,
    ProtocolViolation,
    WrongSender,
    TimeViolation,
    Desynced,
    ConnectionLost,
    Kicked,
}

impl DisconnectReason {
    pub fn to_wire(self) -> ReasonCode {
        match self {
            DisconnectReason::Shutdown => REASON_SHUTDOWN,
            DisconnectReason::IncompatibleVersion => REASON_INCOMPATIBLE_VERSION,
            DisconnectReason::ProtocolViolation => REASON_PROTOCOL_VIOLATION,
            DisconnectReason::WrongSender => REASON_WRONG_SENDER,
            DisconnectReason::TimeViolation => REASON_TIME_VIOLATION,
            DisconnectReason::Desynced => REASON_DESYNCED,
            DisconnectReason::ConnectionLost => REASON_CONNECTION_LOST,
            DisconnectReason::Kicked => REASON_KICKED,
        }
    }

    pub fn from_wire(code: ReasonCode) -> Result<Self, ProtocolError> {
        match code {
            REASON_SHUTDOWN => Ok(DisconnectReason::Shutdown),
            REASON_INCOMPATIBLE_VERSION => Ok(DisconnectReason::IncompatibleVersion),
            REASON_PROTOCOL_VIOLATION => Ok(DisconnectReason::ProtocolViolation),
            REASON_WRONG_SENDER => Ok(DisconnectReason::WrongSender),
            REASON_TIME_VIOLATION => Ok(DisconnectReason::TimeViolation),
            REASON_DESYNCED => Ok(DisconnectReason::Desynced),
            REASON_CONNECTION_LOST => Ok(DisconnectReason::ConnectionLost),
            REASON_KICKED => Ok(DisconnectReason::Kicked),
            other => Err(ProtocolError::OutOfRange {
                field: "disconnect_reason",
                value: other as u32,
            }),
        }
    }

    /// Stable tag used as localization key and in logs.
    pub fn tag(self) -> &'static str {
        match self {
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::IncompatibleVersion => "incompatible_version",
            DisconnectReason::ProtocolViolation => "protocol_violation",
            DisconnectReason::WrongSender => "wrong_sender",
            DisconnectReason::TimeViolation => "time_violation",
            DisconnectReason::Desynced => "desynced",
            DisconnectReason::ConnectionLost => "connection_lost",
            DisconnectReason::Kicked => "kicked",
        }
    }
}
