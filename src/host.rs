use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{Command, ConnId, PlayerSlot, Time, KIND_REPLACE_PLAYER};
use crate::error::{DisconnectReason, PeerError, ProtocolError};
use crate::fields;
use crate::nettime::NetworkTime;
use crate::protocol::{Packet, MAX_COMMAND_PAYLOAD, PROTOCOL_VERSION};
use crate::settings::{AiKind, GameSettings, PlayerResult, SyncConfig};
use crate::simulation::SyncedSimulation;
use crate::sync::{SyncReport, SyncVerifier};

/// Instructions for the network layer, produced under the coordinator lock
/// and executed outside it.
#[derive(Debug, Clone, PartialEq)]
pub enum NetDirective {
    Send { conn: ConnId, packet: Packet },
    Drop { conn: ConnId },
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A peer with an undefined game result left; the session is paused
    /// until the application calls [`HostCoordinator::resolve_decision`].
    DecisionRequired { slot: PlayerSlot, name: String },
    PlayerReplaced { slot: PlayerSlot, ai: AiKind },
    PeerDesynced { conn: ConnId, slot: Option<PlayerSlot> },
    PeerDisconnected { conn: ConnId, reason: DisconnectReason },
}

/// Host-side bookkeeping for one connected socket.
#[derive(Debug)]
pub struct ClientEntry {
    pub slot: Option<PlayerSlot>,
    pub name: String,
    pub last_reported_time: Time,
    pub desired_speed: u16,
    /// Session clock at which this peer was detected hung.
    pub hung_since: Option<u64>,
    pub rtt_ms: Option<u32>,
    last_ping: Option<(u32, u64)>,
    ping_elapsed_ms: u32,
}

impl ClientEntry {
    fn new(default_speed: u16) -> Self {
        Self {
            slot: None,
            name: String::new(),
            last_reported_time: 0,
            desired_speed: default_speed,
            hung_since: None,
            rtt_ms: None,
            last_ping: None,
            ping_elapsed_ms: 0,
        }
    }
}

/// The authoritative peer. Owns the committed network time, stamps and
/// broadcasts player commands, negotiates speed, detects hung peers,
/// schedules sync verification and recovers from peer failure.
///
/// The coordinator holds no lock itself; the embedding wraps it in one
/// coarse mutex scoped to network housekeeping. Everything it tells the
/// network layer goes through the [`NetDirective`] channel, so no method
/// ever blocks on socket I/O.
pub struct HostCoordinator<S: SyncedSimulation> {
    config: SyncConfig,
    settings: GameSettings,
    local_slot: PlayerSlot,
    clients: HashMap<ConnId, ClientEntry>,
    sim: S,
    nettime: NetworkTime,
    committed: Time,
    verifier: SyncVerifier,
    /// Session wall clock in milliseconds, advanced by `think`.
    clock_ms: u64,
    waiting: bool,
    paused: bool,
    local_desired_speed: u16,
    current_speed: u16,
    prepause_speed: u16,
    next_ping_seq: u32,
    out: mpsc::UnboundedSender<NetDirective>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl<S: SyncedSimulation> HostCoordinator<S> {
    pub fn new(
        config: SyncConfig,
        settings: GameSettings,
        local_slot: PlayerSlot,
        sim: S,
        out: mpsc::UnboundedSender<NetDirective>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        let speed = settings.default_speed;
        Self {
            config,
            settings,
            local_slot,
            clients: HashMap::new(),
            sim,
            nettime: NetworkTime::new(0),
            committed: 0,
            verifier: SyncVerifier::new(),
            clock_ms: 0,
            waiting: false,
            paused: false,
            local_desired_speed: speed,
            current_speed: speed,
            prepause_speed: speed,
            next_ping_seq: 0,
            out,
            events,
        }
    }

    pub fn committed_time(&self) -> Time {
        self.committed
    }

    pub fn current_speed(&self) -> u16 {
        self.current_speed
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a sync epoch is currently awaiting reports.
    pub fn verifier_outstanding(&self) -> bool {
        self.verifier.outstanding()
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn client(&self, conn: ConnId) -> Option<&ClientEntry> {
        self.clients.get(&conn)
    }

    pub fn connected_peers(&self) -> usize {
        self.clients.len()
    }

    /// Registers a freshly accepted connection. The peer stays mute until
    /// its HELLO passes the version check.
    pub fn accept(&mut self, conn: ConnId) {
        info!({ fields::CONN_ID } = conn, "connection accepted");
        self.clients
            .insert(conn, ClientEntry::new(self.settings.default_speed));
    }

    /// Single translation point between errors and disconnects: any
    /// violation raised while handling a frame turns into a DISCONNECT with
    /// a reason code, and nothing but "this peer is gone" ever reaches the
    /// simulation side.
    pub fn handle_frame(&mut self, conn: ConnId, packet: Packet) {
        if let Err(err) = self.handle_packet(conn, packet) {
            warn!(
                { fields::CONN_ID } = conn,
                { fields::ERROR } = %err,
                { fields::REASON } = err.reason().tag(),
                "peer violation, disconnecting"
            );
            let reason = err.reason();
            self.disconnect_inner(conn, reason, err.to_string(), true);
        }
    }

    fn handle_packet(&mut self, conn: ConnId, packet: Packet) -> Result<(), PeerError> {
        if !self.clients.contains_key(&conn) {
            // Already torn down; frames may still be in flight.
            return Ok(());
        }
        match packet {
            Packet::Hello { version, name } => self.handle_hello(conn, version, name),
            Packet::Time { time } => self.handle_time(conn, time),
            Packet::DesiredSpeed { speed } => self.handle_desired_speed(conn, speed),
            Packet::PlayerCommand { command } => self.handle_player_command(conn, command),
            Packet::SyncReport { time, hash } => self.handle_sync_report(conn, time, hash),
            Packet::Ping { seq } => {
                self.send_to(conn, Packet::Pong { seq });
                Ok(())
            }
            Packet::Pong { seq } => self.handle_pong(conn, seq),
            Packet::Disconnect { reason, arg } => {
                info!(
                    { fields::CONN_ID } = conn,
                    { fields::REASON } = reason.tag(),
                    arg = %arg,
                    "peer left voluntarily"
                );
                self.disconnect_inner(conn, reason, arg, false);
                Ok(())
            }
            other => Err(PeerError::UnexpectedPacket {
                opcode: other.opcode(),
            }),
        }
    }

    fn handle_hello(
        &mut self,
        conn: ConnId,
        version: u8,
        name: String,
    ) -> Result<(), PeerError> {
        if version != PROTOCOL_VERSION {
            return Err(PeerError::Protocol(ProtocolError::VersionMismatch {
                got: version,
                expected: PROTOCOL_VERSION,
            }));
        }
        let entry = self.clients.get_mut(&conn).expect("checked above");
        if entry.slot.is_some() {
            warn!({ fields::CONN_ID } = conn, "duplicate HELLO ignored");
            return Ok(());
        }
        entry.name = name;

        let taken: Vec<PlayerSlot> = self.clients.values().filter_map(|c| c.slot).collect();
        let slot = self
            .settings
            .players
            .iter()
            .filter(|p| p.ai.is_none() && p.slot != self.local_slot)
            .map(|p| p.slot)
            .find(|s| !taken.contains(s));

        let Some(slot) = slot else {
            self.disconnect_inner(
                conn,
                DisconnectReason::Kicked,
                "no free player slot".to_string(),
                true,
            );
            return Ok(());
        };

        let entry = self.clients.get_mut(&conn).expect("checked above");
        entry.slot = Some(slot);
        entry.last_reported_time = self.committed;
        info!(
            { fields::CONN_ID } = conn,
            { fields::SLOT } = slot,
            { fields::PEER_NAME } = %entry.name,
            "peer joined"
        );
        self.send_to(conn, Packet::Welcome { slot });
        self.send_to(
            conn,
            Packet::Time {
                time: self.committed,
            },
        );
        self.send_to(
            conn,
            Packet::SetSpeed {
                speed: self.current_speed,
            },
        );
        Ok(())
    }

    fn handle_time(&mut self, conn: ConnId, time: Time) -> Result<(), PeerError> {
        let committed = self.committed;
        let entry = self.clients.get_mut(&conn).expect("checked above");
        if entry.slot.is_none() {
            return Err(PeerError::NotWelcomed);
        }
        if time < entry.last_reported_time {
            return Err(PeerError::TimeRanBackwards {
                reported: time,
                previous: entry.last_reported_time,
            });
        }
        if time > committed {
            return Err(PeerError::AheadOfCommit {
                reported: time,
                committed,
            });
        }
        entry.last_reported_time = time;
        Ok(())
    }

    fn handle_desired_speed(&mut self, conn: ConnId, speed: u16) -> Result<(), PeerError> {
        let entry = self.clients.get_mut(&conn).expect("checked above");
        if entry.slot.is_none() {
            return Err(PeerError::NotWelcomed);
        }
        debug!(
            { fields::CONN_ID } = conn,
            { fields::DESIRED_SPEED } = speed,
            "desired speed updated"
        );
        entry.desired_speed = speed;
        self.apply_speed_change();
        Ok(())
    }

    fn handle_player_command(&mut self, conn: ConnId, command: Command) -> Result<(), PeerError> {
        let entry = self.clients.get(&conn).expect("checked above");
        let Some(slot) = entry.slot else {
            return Err(PeerError::NotWelcomed);
        };
        if command.is_stamped() {
            return Err(PeerError::PreassignedDueTime {
                due_time: command.due_time,
            });
        }
        if command.sender != slot {
            return Err(PeerError::WrongSender {
                claimed: command.sender,
                authorized: Some(slot),
            });
        }
        self.distribute_command(command);
        Ok(())
    }

    /// Stamps a command with `committed_time + 1` and hands it to every
    /// participant, this peer's own simulation included. The broadcast is
    /// queued before any later TIME push on the same channels, so ordered
    /// delivery guarantees each client holds the command before its local
    /// clock can reach the due time.
    fn distribute_command(&mut self, mut command: Command) {
        // Admission already bounds the payload; a command the wire cannot
        // carry must never get this far.
        debug_assert!(command.payload.len() <= MAX_COMMAND_PAYLOAD);
        command.due_time = self.committed + 1;
        debug!(
            { fields::DUE_TIME } = command.due_time,
            { fields::SENDER } = command.sender,
            { fields::COMMAND_KIND } = command.kind,
            "command stamped and distributed"
        );
        self.broadcast(Packet::PlayerCommand {
            command: command.clone(),
        });
        self.sim.enqueue_command(command);
    }

    /// Local input from the player sitting at the host. A payload too large
    /// for one PLAYERCOMMAND frame is rejected here, before it reaches any
    /// simulation: executing a command locally that the broadcast could not
    /// deliver would diverge the host from every client.
    pub fn submit_local_command(
        &mut self,
        sender: PlayerSlot,
        kind: u8,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if payload.len() > MAX_COMMAND_PAYLOAD {
            return Err(ProtocolError::Oversized { len: payload.len() });
        }
        self.distribute_command(Command::local(sender, kind, payload));
        Ok(())
    }

    fn handle_sync_report(
        &mut self,
        conn: ConnId,
        time: Time,
        hash: crate::sync::SyncHash,
    ) -> Result<(), PeerError> {
        let entry = self.clients.get(&conn).expect("checked above");
        if entry.slot.is_none() {
            return Err(PeerError::NotWelcomed);
        }
        if !self.verifier.peer_report(conn, SyncReport { time, hash }) {
            return Err(PeerError::StraySyncReport {
                reported: time,
                expected: self.verifier.checkpoint(),
            });
        }
        self.complete_sync_if_ready();
        Ok(())
    }

    fn handle_pong(&mut self, conn: ConnId, seq: u32) -> Result<(), PeerError> {
        let clock = self.clock_ms;
        let entry = self.clients.get_mut(&conn).expect("checked above");
        if let Some((expected, sent_at)) = entry.last_ping {
            if expected == seq {
                let sample = (clock - sent_at) as u32;
                // Smooth over the previous estimate.
                entry.rtt_ms = Some(match entry.rtt_ms {
                    Some(prev) => (prev * 3 + sample) / 4,
                    None => sample,
                });
                entry.last_ping = None;
            }
        }
        Ok(())
    }

    /// One housekeeping tick: advances the committed time, runs hang
    /// detection, schedules sync checks, advances the host's own
    /// simulation and keeps the keepalive pings flowing.
    pub fn think(&mut self, delta_ms: u32) {
        self.clock_ms += u64::from(delta_ms);

        if !self.waiting && !self.paused && self.current_speed > 0 && delta_ms > 0 {
            let step =
                (u64::from(self.current_speed) * u64::from(delta_ms) / 1000) as Time;
            if step > 0 {
                self.committed = self.committed.saturating_add(step);
                self.broadcast(Packet::Time {
                    time: self.committed,
                });
            }
        }

        self.check_hangs();

        if !self.waiting
            && !self.paused
            && self
                .verifier
                .should_rearm(self.committed, self.config.checkpoint_interval_ms)
        {
            self.schedule_sync_check();
        }

        self.advance_own_simulation(delta_ms);
        self.send_pings(delta_ms);
    }

    /// Hang policy: a peer lagging the committed time by more than
    /// `hang_multiplier` report intervals (scaled by the current speed) is
    /// hung; one hung peer pauses the whole session until every peer has
    /// reported the committed time again.
    fn check_hangs(&mut self) {
        if self.paused {
            return;
        }
        if !self.waiting {
            if self.current_speed == 0 {
                return;
            }
            let threshold = (u64::from(self.config.hang_multiplier)
                * u64::from(self.config.report_interval_ms)
                * u64::from(self.current_speed)
                / 1000) as Time;
            let clock = self.clock_ms;
            let committed = self.committed;
            let mut any_hung = false;
            for (conn, entry) in self.clients.iter_mut() {
                if entry.slot.is_none() {
                    continue;
                }
                let lag = committed.saturating_sub(entry.last_reported_time);
                if lag > threshold && entry.hung_since.is_none() {
                    warn!(
                        { fields::CONN_ID } = conn,
                        { fields::REPORTED_TIME } = entry.last_reported_time,
                        { fields::COMMITTED_TIME } = committed,
                        "peer hung"
                    );
                    entry.hung_since = Some(clock);
                }
                any_hung |= entry.hung_since.is_some();
            }
            if any_hung {
                self.waiting = true;
                self.prepause_speed = self.current_speed;
                self.current_speed = 0;
                info!(
                    { fields::COMMITTED_TIME } = committed,
                    "session waiting for hung peers"
                );
                self.broadcast(Packet::Wait);
                // Park the host exactly at the committed time, like every
                // client does on WAIT, so all simulations freeze at the
                // same logical instant.
                self.nettime.receive(self.committed);
                self.nettime.fastforward();
            }
        } else {
            let committed = self.committed;
            let mut all_caught_up = true;
            for entry in self.clients.values_mut() {
                if entry.slot.is_none() {
                    continue;
                }
                if entry.last_reported_time >= committed {
                    entry.hung_since = None;
                } else {
                    all_caught_up = false;
                }
            }
            if all_caught_up {
                self.waiting = false;
                self.current_speed = self.prepause_speed;
                info!(
                    { fields::SPEED } = self.current_speed,
                    "all peers caught up, session resuming"
                );
                self.broadcast(Packet::SetSpeed {
                    speed: self.current_speed,
                });
                if !self.verifier.outstanding() {
                    self.schedule_sync_check();
                }
            }
        }
    }

    /// Opens a sync epoch: picks a checkpoint ahead of the committed time,
    /// commits at least up to it so every peer is guaranteed to reach it,
    /// and instructs all peers (this one included) to report.
    pub fn schedule_sync_check(&mut self) {
        let checkpoint = self.committed + self.config.checkpoint_lead_ms;
        let expected: Vec<ConnId> = self
            .clients
            .iter()
            .filter(|(_, e)| e.slot.is_some())
            .map(|(c, _)| *c)
            .collect();
        self.verifier.request(checkpoint, expected);
        self.committed = self.committed.max(checkpoint);
        self.broadcast(Packet::SyncRequest { time: checkpoint });
        self.broadcast(Packet::Time {
            time: self.committed,
        });
    }

    fn advance_own_simulation(&mut self, delta_ms: u32) {
        self.nettime.receive(self.committed);
        self.nettime.think(self.current_speed, delta_ms);
        let local = self.nettime.local_time();

        if let Some(checkpoint) = self.verifier.checkpoint() {
            if !self.verifier.host_reported() && local >= checkpoint {
                self.sim.advance_to(checkpoint);
                let hash = self.sim.sync_hash();
                self.verifier.host_report(hash);
                self.complete_sync_if_ready();
            }
        }
        self.sim.advance_to(local);
    }

    fn send_pings(&mut self, delta_ms: u32) {
        let interval = self.config.ping_interval_ms;
        let clock = self.clock_ms;
        let mut pings = Vec::new();
        for (conn, entry) in self.clients.iter_mut() {
            entry.ping_elapsed_ms += delta_ms;
            if entry.ping_elapsed_ms >= interval && entry.last_ping.is_none() {
                entry.ping_elapsed_ms = 0;
                let seq = self.next_ping_seq;
                self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
                entry.last_ping = Some((seq, clock));
                pings.push((*conn, seq));
            }
        }
        for (conn, seq) in pings {
            self.send_to(conn, Packet::Ping { seq });
        }
    }

    fn complete_sync_if_ready(&mut self) {
        let Some(diverged) = self.verifier.try_compare() else {
            return;
        };
        if diverged.is_empty() {
            return;
        }
        // Safety pause first, then cut only the diverging peers; the rest
        // of the session stays intact and resumes afterwards.
        self.pause_speed();
        for conn in diverged {
            let slot = self.clients.get(&conn).and_then(|e| e.slot);
            self.emit(HostEvent::PeerDesynced { conn, slot });
            self.disconnect_inner(
                conn,
                DisconnectReason::Desynced,
                "sync report mismatch".to_string(),
                true,
            );
        }
        if !self.paused && !self.waiting {
            self.resume_speed();
        }
    }

    fn pause_speed(&mut self) {
        if self.current_speed > 0 {
            self.prepause_speed = self.current_speed;
            self.current_speed = 0;
            self.broadcast(Packet::SetSpeed { speed: 0 });
        }
    }

    fn resume_speed(&mut self) {
        self.current_speed = self.prepause_speed;
        self.broadcast(Packet::SetSpeed {
            speed: self.current_speed,
        });
    }

    /// Disconnects a peer on the host's initiative.
    pub fn disconnect(&mut self, conn: ConnId, reason: DisconnectReason, arg: impl Into<String>) {
        self.disconnect_inner(conn, reason, arg.into(), true);
    }

    /// Transport-detected connection loss; same cleanup path as an explicit
    /// disconnect, minus the farewell frame.
    pub fn peer_gone(&mut self, conn: ConnId) {
        self.disconnect_inner(
            conn,
            DisconnectReason::ConnectionLost,
            String::new(),
            false,
        );
    }

    /// Removes a peer. Client table, sync bookkeeping and failure recovery
    /// all update inside this one call, under the caller's coarse lock, so
    /// a disconnect is anytime-safe and never leaves half-updated state.
    fn disconnect_inner(
        &mut self,
        conn: ConnId,
        reason: DisconnectReason,
        arg: String,
        notify: bool,
    ) {
        let Some(entry) = self.clients.remove(&conn) else {
            return;
        };
        info!(
            { fields::CONN_ID } = conn,
            { fields::REASON } = reason.tag(),
            { fields::PEER_NAME } = %entry.name,
            "peer disconnected"
        );
        if notify {
            self.send_to(conn, Packet::Disconnect { reason, arg });
        }
        self.send_raw(NetDirective::Drop { conn });
        self.verifier.drop_peer(conn);
        self.emit(HostEvent::PeerDisconnected { conn, reason });

        if let Some(slot) = entry.slot {
            self.recover_slot(slot, entry.name);
        }
        // The departed peer may have been the last missing report.
        self.complete_sync_if_ready();
    }

    /// Failure-recovery policy: an undefined result pauses the session and
    /// asks the application to decide; a finished player is silently
    /// replaced by an AI so the remaining peers continue bit-identically.
    fn recover_slot(&mut self, slot: PlayerSlot, name: String) {
        let result = self
            .settings
            .player(slot)
            .map(|p| p.result)
            .unwrap_or(PlayerResult::Undefined);
        match result {
            PlayerResult::Undefined => {
                self.pause_speed();
                self.paused = true;
                self.emit(HostEvent::DecisionRequired { slot, name });
            }
            PlayerResult::Won => self.replace_with_ai(slot, AiKind::Normal),
            PlayerResult::Lost | PlayerResult::Resigned => {
                self.replace_with_ai(slot, AiKind::Empty)
            }
        }
    }

    /// Injects the AI substitution through the ordinary command path, with
    /// the same due-time discipline as any player command, so every
    /// remaining peer applies it at the same tick.
    fn replace_with_ai(&mut self, slot: PlayerSlot, ai: AiKind) {
        info!(
            { fields::SLOT } = slot,
            { fields::AI_KIND } = ?ai,
            "replacing player with AI"
        );
        self.distribute_command(Command::local(
            slot,
            KIND_REPLACE_PLAYER,
            vec![slot, ai.to_wire()],
        ));
        if let Some(player) = self.settings.player_mut(slot) {
            player.ai = Some(ai);
        }
        self.emit(HostEvent::PlayerReplaced { slot, ai });
    }

    /// Answers a [`HostEvent::DecisionRequired`]: substitute the chosen AI
    /// and let the session continue.
    pub fn resolve_decision(&mut self, slot: PlayerSlot, ai: AiKind) {
        if !self.paused {
            return;
        }
        self.replace_with_ai(slot, ai);
        self.paused = false;
        if !self.waiting {
            self.resume_speed();
        }
    }

    /// Records a player's game result; consulted when that player's
    /// connection goes away.
    pub fn set_player_result(&mut self, slot: PlayerSlot, result: PlayerResult) {
        if let Some(player) = self.settings.player_mut(slot) {
            player.result = result;
        }
    }

    pub fn set_local_desired_speed(&mut self, speed: u16) {
        self.local_desired_speed = speed;
        self.apply_speed_change();
    }

    fn apply_speed_change(&mut self) {
        if self.waiting || self.paused {
            return;
        }
        let effective = self.compute_effective_speed();
        if effective != self.current_speed {
            debug!({ fields::EFFECTIVE_SPEED } = effective, "speed renegotiated");
            self.current_speed = effective;
            self.broadcast(Packet::SetSpeed { speed: effective });
        }
    }

    /// Effective speed is the median of all desired speeds (mean of the two
    /// central values for an even count). With exactly two participants the
    /// faster side is first pulled to within `speed_clamp_delta` of the
    /// slower one, so neither side can force an extreme on its own.
    fn compute_effective_speed(&self) -> u16 {
        let mut speeds: Vec<u16> = self
            .clients
            .values()
            .filter(|c| c.slot.is_some())
            .map(|c| c.desired_speed)
            .collect();
        speeds.push(self.local_desired_speed);
        speeds.sort_unstable();
        if speeds.len() == 2 {
            speeds[1] = speeds[1].min(speeds[0].saturating_add(self.config.speed_clamp_delta));
        }
        let n = speeds.len();
        if n % 2 == 1 {
            speeds[n / 2]
        } else {
            ((u32::from(speeds[n / 2 - 1]) + u32::from(speeds[n / 2])) / 2) as u16
        }
    }

    fn broadcast(&mut self, packet: Packet) {
        let conns: Vec<ConnId> = self.clients.keys().copied().collect();
        for conn in conns {
            self.send_to(conn, packet.clone());
        }
    }

    fn send_to(&mut self, conn: ConnId, packet: Packet) {
        self.send_raw(NetDirective::Send { conn, packet });
    }

    fn send_raw(&mut self, directive: NetDirective) {
        // A closed channel means the network layer is shutting down; the
        // coordinator keeps its state consistent regardless.
        let _ = self.out.send(directive);
    }

    fn emit(&mut self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}
