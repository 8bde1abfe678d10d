use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::command::{Command, PlayerSlot, Time};
use crate::error::{DisconnectReason, ProtocolError};
use crate::sync::{SyncHash, SYNC_HASH_LEN};

/// Bumped on every incompatible wire change. Exchanged in HELLO before any
/// other traffic; a mismatch is a fatal disconnect, never a downgrade.
pub const PROTOCOL_VERSION: u8 = 1;

pub type Opcode = u8;
pub const HELLO: Opcode = 0x01;
pub const WELCOME: Opcode = 0x02;
pub const PING: Opcode = 0x03;
pub const PONG: Opcode = 0x04;
pub const TIME: Opcode = 0x05;
pub const DESIREDSPEED: Opcode = 0x06;
pub const SETSPEED: Opcode = 0x07;
pub const WAIT: Opcode = 0x08;
pub const PLAYERCOMMAND: Opcode = 0x09;
pub const SYNCREQUEST: Opcode = 0x0a;
pub const SYNCREPORT: Opcode = 0x0b;
pub const DISCONNECT: Opcode = 0x0c;

pub fn opcode_name(op: Opcode) -> &'static str {
    match op {
        HELLO => "HELLO",
        WELCOME => "WELCOME",
        PING => "PING",
        PONG => "PONG",
        TIME => "TIME",
        DESIREDSPEED => "DESIREDSPEED",
        SETSPEED => "SETSPEED",
        WAIT => "WAIT",
        PLAYERCOMMAND => "PLAYERCOMMAND",
        SYNCREQUEST => "SYNCREQUEST",
        SYNCREPORT => "SYNCREPORT",
        DISCONNECT => "DISCONNECT",
        _ => "UNKNOWN",
    }
}

/// Fixed frame header: payload length (opcode byte included) and opcode.
/// Little-endian on the wire via bincode's default integer layout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FrameHeader {
    pub length: u16,
    pub opcode: Opcode,
}

pub const FRAME_HEADER_LEN: usize = 3;
/// Largest payload the u16 length field can describe, opcode included.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - 1;
/// Room left for a command payload inside one PLAYERCOMMAND frame, after
/// the due time, sender, kind and payload-length fields. Commands are
/// checked against this at admission: a command the wire cannot carry must
/// never reach any simulation.
pub const MAX_COMMAND_PAYLOAD: usize = MAX_PAYLOAD_LEN - 8;

/// One wire message, dispatched exactly once at the protocol boundary.
///
/// PLAYERCOMMAND is the only opcode travelling both ways: a client sends it
/// with `due_time == 0` and the host re-broadcasts it stamped with
/// `committed_time + 1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Hello { version: u8, name: String },
    Welcome { slot: PlayerSlot },
    Ping { seq: u32 },
    Pong { seq: u32 },
    Time { time: Time },
    DesiredSpeed { speed: u16 },
    SetSpeed { speed: u16 },
    Wait,
    PlayerCommand { command: Command },
    SyncRequest { time: Time },
    SyncReport { time: Time, hash: SyncHash },
    Disconnect { reason: DisconnectReason, arg: String },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Hello { .. } => HELLO,
            Packet::Welcome { .. } => WELCOME,
            Packet::Ping { .. } => PING,
            Packet::Pong { .. } => PONG,
            Packet::Time { .. } => TIME,
            Packet::DesiredSpeed { .. } => DESIREDSPEED,
            Packet::SetSpeed { .. } => SETSPEED,
            Packet::Wait => WAIT,
            Packet::PlayerCommand { .. } => PLAYERCOMMAND,
            Packet::SyncRequest { .. } => SYNCREQUEST,
            Packet::SyncReport { .. } => SYNCREPORT,
            Packet::Disconnect { .. } => DISCONNECT,
        }
    }

    /// Serializes this packet into a complete frame (header plus payload).
    pub fn encode_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = BytesMut::new();
        match self {
            Packet::Hello { version, name } => {
                payload.put_u8(*version);
                put_string(&mut payload, name);
            }
            Packet::Welcome { slot } => payload.put_u8(*slot),
            Packet::Ping { seq } => payload.put_u32_le(*seq),
            Packet::Pong { seq } => payload.put_u32_le(*seq),
            Packet::Time { time } => payload.put_u32_le(*time),
            Packet::DesiredSpeed { speed } => payload.put_u16_le(*speed),
            Packet::SetSpeed { speed } => payload.put_u16_le(*speed),
            Packet::Wait => {}
            Packet::PlayerCommand { command } => {
                payload.put_u32_le(command.due_time);
                payload.put_u8(command.sender);
                payload.put_u8(command.kind);
                put_blob(&mut payload, &command.payload)?;
            }
            Packet::SyncRequest { time } => payload.put_u32_le(*time),
            Packet::SyncReport { time, hash } => {
                payload.put_u32_le(*time);
                payload.put_slice(&hash.0);
            }
            Packet::Disconnect { reason, arg } => {
                payload.put_u8(reason.to_wire());
                put_string(&mut payload, arg);
            }
        }

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversized { len: payload.len() });
        }

        let header = FrameHeader {
            length: payload.len() as u16 + 1,
            opcode: self.opcode(),
        };
        // The header has a fixed layout; serialization cannot fail for it.
        let mut frame = bincode::serialize(&header).unwrap_or_default();
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes one payload for `opcode`. Unknown opcodes, truncation and
    /// trailing garbage are all fatal protocol errors.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Packet, ProtocolError> {
        let mut r = Reader::new(payload);
        let packet = match opcode {
            HELLO => Packet::Hello {
                version: r.get_u8("version")?,
                name: r.get_string("name")?,
            },
            WELCOME => Packet::Welcome {
                slot: r.get_u8("slot")?,
            },
            PING => Packet::Ping {
                seq: r.get_u32("seq")?,
            },
            PONG => Packet::Pong {
                seq: r.get_u32("seq")?,
            },
            TIME => Packet::Time {
                time: r.get_u32("time")?,
            },
            DESIREDSPEED => Packet::DesiredSpeed {
                speed: r.get_u16("speed")?,
            },
            SETSPEED => Packet::SetSpeed {
                speed: r.get_u16("speed")?,
            },
            WAIT => Packet::Wait,
            PLAYERCOMMAND => Packet::PlayerCommand {
                command: Command {
                    due_time: r.get_u32("due_time")?,
                    sender: r.get_u8("sender")?,
                    kind: r.get_u8("kind")?,
                    payload: r.get_blob("payload")?,
                },
            },
            SYNCREQUEST => Packet::SyncRequest {
                time: r.get_u32("time")?,
            },
            SYNCREPORT => {
                let time = r.get_u32("time")?;
                let raw = r.get_bytes(SYNC_HASH_LEN, "hash")?;
                let mut hash = [0u8; SYNC_HASH_LEN];
                hash.copy_from_slice(raw);
                Packet::SyncReport {
                    time,
                    hash: SyncHash(hash),
                }
            }
            DISCONNECT => Packet::Disconnect {
                reason: DisconnectReason::from_wire(r.get_u8("reason")?)?,
                arg: r.get_string("arg")?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        r.finish()?;
        Ok(packet)
    }
}

/// Splits one frame off the front of `data`. Returns `None` when the buffer
/// does not yet hold a complete frame; the transport then reads more bytes.
pub fn parse_frame(data: &[u8]) -> Result<Option<(Packet, usize)>, ProtocolError> {
    if data.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let header: FrameHeader = bincode::deserialize(&data[..FRAME_HEADER_LEN])
        .map_err(|_| ProtocolError::Truncated { field: "header" })?;
    if header.length == 0 {
        return Err(ProtocolError::Truncated { field: "opcode" });
    }
    let payload_len = header.length as usize - 1;
    let total = FRAME_HEADER_LEN + payload_len;
    if data.len() < total {
        return Ok(None);
    }
    let packet = Packet::decode(header.opcode, &data[FRAME_HEADER_LEN..total])?;
    Ok(Some((packet, total)))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, b: &[u8]) -> Result<(), ProtocolError> {
    if b.len() > u16::MAX as usize {
        return Err(ProtocolError::Oversized { len: b.len() });
    }
    buf.put_u16_le(b.len() as u16);
    buf.put_slice(b);
    Ok(())
}

/// Checked cursor over one payload. Every getter reports which field was
/// being read when the frame ran short.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn get_bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated { field });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.get_bytes(1, field)?[0])
    }

    fn get_u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        let b = self.get_bytes(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        let b = self.get_bytes(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_blob(&mut self, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u16(field)? as usize;
        Ok(self.get_bytes(len, field)?.to_vec())
    }

    fn get_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.get_blob(field)?;
        String::from_utf8(raw).map_err(|_| ProtocolError::BadString { field })
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes {
                len: self.buf.len(),
            })
        }
    }
}
