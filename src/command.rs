use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

/// Logical simulation time in milliseconds.
pub type Time = u32;
/// Player slot index inside the settings snapshot.
pub type PlayerSlot = u8;
/// Arena index assigned by the transport to one connection.
pub type ConnId = u32;

/// Commands with this kind are reserved for the engine itself: the payload
/// is `[slot, ai_code]` and every peer replaces the named player with an AI
/// when the command comes due. Application kinds start above it.
pub const KIND_REPLACE_PLAYER: u8 = 0x00;
/// First command kind available to the embedding application.
pub const KIND_APPLICATION_BASE: u8 = 0x10;

/// A single unit of simulation input: a player action tagged with the
/// logical time at which every peer must execute it.
///
/// A client-originated command travels with `due_time == 0` until the host
/// stamps it with `committed_time + 1`; only stamped commands ever reach a
/// simulation. Each command is consumed exactly once and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub due_time: Time,
    pub sender: PlayerSlot,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Command {
    /// A freshly captured local input, not yet stamped by the authority.
    pub fn local(sender: PlayerSlot, kind: u8, payload: Vec<u8>) -> Self {
        Self {
            due_time: 0,
            sender,
            kind,
            payload,
        }
    }

    pub fn is_stamped(&self) -> bool {
        self.due_time != 0
    }
}

struct QueuedCommand {
    seq: u64,
    command: Command,
}

// Min-heap order: earliest due time first, insertion order as tie-breaker.
// Insertion order equals the authority's send order, which together with
// the due time fully determines application order on every peer.
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.command.due_time, other.seq).cmp(&(self.command.due_time, self.seq))
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.command.due_time == other.command.due_time && self.seq == other.seq
    }
}

impl Eq for QueuedCommand {}

/// Holds stamped commands until their due time is reached. The queue owns
/// its commands; popping transfers ownership to the simulation, so every
/// command is applied at most once.
#[derive(Default)]
pub struct CommandQueue {
    heap: BinaryHeap<QueuedCommand>,
    next_seq: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        debug_assert!(command.is_stamped(), "queued command must carry a due time");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedCommand { seq, command });
    }

    /// Due time of the next command, if any.
    pub fn peek_due(&self) -> Option<Time> {
        self.heap.peek().map(|q| q.command.due_time)
    }

    /// Pops the next command whose due time has been reached by `now`.
    pub fn pop_due(&mut self, now: Time) -> Option<Command> {
        match self.heap.peek() {
            Some(q) if q.command.due_time <= now => Some(self.heap.pop().unwrap().command),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
