// Structured logging field definitions
// This module centralizes all field names used in tracing logs

#![allow(dead_code)]

// Connection fields
pub const ADDR: &str = "addr";
pub const CONN_ID: &str = "conn_id";
pub const PEER_NAME: &str = "peer_name";
pub const PACKET_SIZE: &str = "packet_size";
pub const OPCODE: &str = "opcode";

// Participant fields
pub const SLOT: &str = "slot";
pub const SENDER: &str = "sender";
pub const RTT_MS: &str = "rtt_ms";

// Time fields
pub const COMMITTED_TIME: &str = "committed_time";
pub const LOCAL_TIME: &str = "local_time";
pub const NETWORK_TIME: &str = "network_time";
pub const REPORTED_TIME: &str = "reported_time";
pub const DUE_TIME: &str = "due_time";

// Speed fields
pub const SPEED: &str = "speed";
pub const DESIRED_SPEED: &str = "desired_speed";
pub const EFFECTIVE_SPEED: &str = "effective_speed";

// Sync verification fields
pub const CHECKPOINT: &str = "checkpoint";
pub const HASH: &str = "hash";
pub const EXPECTED_HASH: &str = "expected_hash";
pub const REPORTS_PENDING: &str = "reports_pending";

// Command fields
pub const COMMAND_KIND: &str = "command_kind";
pub const QUEUE_SIZE: &str = "queue_size";

// Outcome fields
pub const ERROR: &str = "error";
pub const REASON: &str = "reason";
pub const AI_KIND: &str = "ai_kind";
