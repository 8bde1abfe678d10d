use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{Command, PlayerSlot, Time};
use crate::error::{DisconnectReason, PeerError};
use crate::fields;
use crate::nettime::NetworkTime;
use crate::protocol::{Packet, PROTOCOL_VERSION};
use crate::settings::SyncConfig;
use crate::simulation::SyncedSimulation;

/// Events surfaced to the application embedding a client peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Joined { slot: PlayerSlot },
    SpeedChanged { speed: u16 },
    /// The host paused the whole session to let a lagging peer catch up.
    Waiting,
    Disconnected { reason: DisconnectReason, arg: String },
}

/// The non-authoritative peer. Follows the host's committed time, echoes
/// local input through the host before executing it, and answers sync and
/// keepalive requests.
///
/// Like the host coordinator it is a plain state machine behind one coarse
/// lock: packets to the wire leave through the outgoing channel and are
/// written by the transport task outside the lock.
pub struct ClientPeer<S: SyncedSimulation> {
    config: SyncConfig,
    sim: S,
    nettime: NetworkTime,
    slot: Option<PlayerSlot>,
    speed: u16,
    desired_speed: u16,
    /// Checkpoint to hash and report once the local simulation reaches it.
    pending_checkpoint: Option<Time>,
    report_elapsed_ms: u32,
    connected: bool,
    out: mpsc::UnboundedSender<Packet>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<S: SyncedSimulation> ClientPeer<S> {
    /// Creates the peer and immediately opens the handshake; nothing else
    /// is sent or accepted until the host's WELCOME arrives.
    pub fn new(
        config: SyncConfig,
        name: impl Into<String>,
        sim: S,
        out: mpsc::UnboundedSender<Packet>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let peer = Self {
            config,
            sim,
            nettime: NetworkTime::new(0),
            slot: None,
            speed: 0,
            desired_speed: 0,
            pending_checkpoint: None,
            report_elapsed_ms: 0,
            connected: true,
            out,
            events,
        };
        peer.send(Packet::Hello {
            version: PROTOCOL_VERSION,
            name: name.into(),
        });
        peer
    }

    pub fn slot(&self) -> Option<PlayerSlot> {
        self.slot
    }

    pub fn speed(&self) -> u16 {
        self.speed
    }

    pub fn local_time(&self) -> Time {
        self.nettime.local_time()
    }

    pub fn network_time(&self) -> Time {
        self.nettime.network_time()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    /// A misbehaving host is handled the same way the host handles a
    /// misbehaving client: one farewell frame with a reason code, then the
    /// connection is dead from this side's point of view.
    pub fn handle_frame(&mut self, packet: Packet) {
        if !self.connected {
            return;
        }
        if let Err(err) = self.handle_packet(packet) {
            self.fail(err);
        }
    }

    /// Undecodable bytes from the host, reported by the transport.
    pub fn protocol_failure(&mut self, err: crate::error::ProtocolError) {
        if self.connected {
            self.fail(err.into());
        }
    }

    /// The socket died without a farewell frame.
    pub fn connection_lost(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.emit(ClientEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost,
            arg: String::new(),
        });
    }

    fn fail(&mut self, err: PeerError) {
        warn!(
            { fields::ERROR } = %err,
            { fields::REASON } = err.reason().tag(),
            "host violation, leaving session"
        );
        let reason = err.reason();
        let arg = err.to_string();
        self.send(Packet::Disconnect {
            reason,
            arg: arg.clone(),
        });
        self.connected = false;
        self.emit(ClientEvent::Disconnected { reason, arg });
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), PeerError> {
        match packet {
            Packet::Welcome { slot } => {
                if self.slot.is_some() {
                    warn!({ fields::SLOT } = slot, "duplicate WELCOME ignored");
                    return Ok(());
                }
                info!({ fields::SLOT } = slot, "joined session");
                self.slot = Some(slot);
                if self.desired_speed != 0 {
                    // Preference picked before the handshake finished;
                    // the host only listens to welcomed peers.
                    self.send(Packet::DesiredSpeed {
                        speed: self.desired_speed,
                    });
                }
                self.emit(ClientEvent::Joined { slot });
            }
            Packet::Time { time } => {
                self.nettime.receive(time);
            }
            Packet::SetSpeed { speed } => {
                debug!({ fields::SPEED } = speed, "speed set by host");
                self.speed = speed;
                self.emit(ClientEvent::SpeedChanged { speed });
            }
            Packet::Wait => {
                // Park exactly at the committed time so every frozen peer
                // rests at the same logical instant; the pending time
                // backlog would otherwise have to drain after resume.
                info!(
                    { fields::NETWORK_TIME } = self.nettime.network_time(),
                    "session waiting, catching up"
                );
                self.speed = 0;
                self.nettime.fastforward();
                self.advance_simulation();
                self.emit(ClientEvent::Waiting);
            }
            Packet::PlayerCommand { command } => {
                if !command.is_stamped() {
                    return Err(PeerError::UnstampedCommand);
                }
                if command.due_time <= self.nettime.local_time() {
                    // Cannot happen while the host honors its own ordering;
                    // executed late, this would diverge from the others.
                    warn!(
                        { fields::DUE_TIME } = command.due_time,
                        { fields::LOCAL_TIME } = self.nettime.local_time(),
                        "command due in the past"
                    );
                }
                debug!(
                    { fields::DUE_TIME } = command.due_time,
                    { fields::SENDER } = command.sender,
                    { fields::COMMAND_KIND } = command.kind,
                    "command received"
                );
                self.sim.enqueue_command(command);
            }
            Packet::SyncRequest { time } => {
                debug!({ fields::CHECKPOINT } = time, "sync check requested");
                self.pending_checkpoint = Some(time);
                self.advance_simulation();
            }
            Packet::Ping { seq } => {
                self.send(Packet::Pong { seq });
            }
            Packet::Disconnect { reason, arg } => {
                info!(
                    { fields::REASON } = reason.tag(),
                    arg = %arg,
                    "disconnected by host"
                );
                self.connected = false;
                self.emit(ClientEvent::Disconnected { reason, arg });
            }
            other => {
                return Err(PeerError::UnexpectedPacket {
                    opcode: other.opcode(),
                })
            }
        }
        Ok(())
    }

    /// One housekeeping tick: advances the local simulation within the
    /// authorized window and keeps the periodic time reports flowing.
    pub fn think(&mut self, delta_ms: u32) {
        if !self.connected {
            return;
        }
        self.nettime.think(self.speed, delta_ms);
        self.advance_simulation();

        self.report_elapsed_ms += delta_ms;
        if self.report_elapsed_ms >= self.config.report_interval_ms && self.slot.is_some() {
            self.report_elapsed_ms = 0;
            self.send(Packet::Time {
                time: self.nettime.local_time(),
            });
        }
    }

    /// Moves the simulation up to the local time, stopping exactly at a
    /// pending checkpoint to hash and report before continuing past it.
    fn advance_simulation(&mut self) {
        let local = self.nettime.local_time();
        if let Some(checkpoint) = self.pending_checkpoint {
            if local >= checkpoint {
                self.sim.advance_to(checkpoint);
                let hash = self.sim.sync_hash();
                debug!(
                    { fields::CHECKPOINT } = checkpoint,
                    { fields::HASH } = %hash,
                    "sync report sent"
                );
                self.send(Packet::SyncReport {
                    time: checkpoint,
                    hash,
                });
                self.pending_checkpoint = None;
            }
        }
        self.sim.advance_to(local);
    }

    /// Local player input. The command leaves unstamped and is not executed
    /// here until the host broadcasts it back with a due time; a peer that
    /// executed its own input early could never match the others.
    pub fn submit_command(&mut self, kind: u8, payload: Vec<u8>) {
        let Some(slot) = self.slot else {
            warn!("command submitted before WELCOME, dropped");
            return;
        };
        self.send(Packet::PlayerCommand {
            command: Command::local(slot, kind, payload),
        });
    }

    /// Asks the host for a different speed; the host answers with the
    /// negotiated effective speed for everyone. Before WELCOME the value is
    /// only stored, since the host rejects traffic from unwelcomed peers,
    /// and is forwarded as part of joining.
    pub fn set_desired_speed(&mut self, speed: u16) {
        self.desired_speed = speed;
        if self.slot.is_some() {
            self.send(Packet::DesiredSpeed { speed });
        }
    }

    /// Graceful exit announced to the host.
    pub fn leave(&mut self) {
        if !self.connected {
            return;
        }
        self.send(Packet::Disconnect {
            reason: DisconnectReason::Shutdown,
            arg: String::new(),
        });
        self.connected = false;
    }

    fn send(&self, packet: Packet) {
        let _ = self.out.send(packet);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ConnId, KIND_APPLICATION_BASE};
    use crate::host::{HostCoordinator, NetDirective};
    use crate::settings::{GameSettings, PlayerSettings};
    use crate::simulation::testing::ScriptedSimulation;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        client: ClientPeer<ScriptedSimulation>,
        out: UnboundedReceiver<Packet>,
        events: UnboundedReceiver<ClientEvent>,
    }

    fn harness() -> Harness {
        let (out_tx, out) = mpsc::unbounded_channel();
        let (ev_tx, events) = mpsc::unbounded_channel();
        let client = ClientPeer::new(
            SyncConfig::default(),
            "ana",
            ScriptedSimulation::new(),
            out_tx,
            ev_tx,
        );
        Harness {
            client,
            out,
            events,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Packet>) -> Vec<Packet> {
        let mut v = Vec::new();
        while let Ok(p) = rx.try_recv() {
            v.push(p);
        }
        v
    }

    fn drain_events(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut v = Vec::new();
        while let Ok(e) = rx.try_recv() {
            v.push(e);
        }
        v
    }

    fn joined() -> Harness {
        let mut h = harness();
        h.client.handle_frame(Packet::Welcome { slot: 1 });
        h.client.handle_frame(Packet::SetSpeed { speed: 1000 });
        drain(&mut h.out);
        drain_events(&mut h.events);
        h
    }

    fn command(due_time: Time, kind: u8) -> Command {
        Command {
            due_time,
            sender: 1,
            kind,
            payload: vec![],
        }
    }

    #[test]
    fn handshake_opens_with_hello() {
        let mut h = harness();
        let sent = drain(&mut h.out);
        assert_eq!(
            sent,
            vec![Packet::Hello {
                version: PROTOCOL_VERSION,
                name: "ana".to_string(),
            }]
        );
        assert_eq!(h.client.slot(), None);
    }

    #[test]
    fn welcome_assigns_slot() {
        let mut h = harness();
        h.client.handle_frame(Packet::Welcome { slot: 3 });
        assert_eq!(h.client.slot(), Some(3));
        assert_eq!(
            drain_events(&mut h.events),
            vec![ClientEvent::Joined { slot: 3 }]
        );
    }

    #[test]
    fn commands_are_held_until_their_due_time() {
        let mut h = joined();
        h.client.handle_frame(Packet::Time { time: 1000 });
        h.client.handle_frame(Packet::PlayerCommand {
            command: command(401, 0x10),
        });

        h.client.think(300); // local 300 < 401
        assert!(h.client.simulation().applied.is_empty());

        h.client.think(300); // local 600
        let applied = &h.client.simulation().applied;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, 401);
    }

    #[test]
    fn local_input_is_echoed_not_executed() {
        let mut h = joined();
        h.client.handle_frame(Packet::Time { time: 1000 });
        h.client.submit_command(KIND_APPLICATION_BASE, vec![5]);
        h.client.think(1000);

        // Nothing ran locally; the command only went to the host, unstamped.
        assert!(h.client.simulation().applied.is_empty());
        let sent = drain(&mut h.out);
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::PlayerCommand { command } if !command.is_stamped() && command.sender == 1
        )));
    }

    #[test]
    fn unstamped_broadcast_is_a_host_violation() {
        let mut h = joined();
        h.client.handle_frame(Packet::PlayerCommand {
            command: Command::local(1, 0x10, vec![]),
        });

        assert!(!h.client.is_connected());
        let sent = drain(&mut h.out);
        assert!(sent.iter().any(|p| matches!(
            p,
            Packet::Disconnect {
                reason: DisconnectReason::ProtocolViolation,
                ..
            }
        )));
    }

    #[test]
    fn sync_report_hashes_state_exactly_at_checkpoint() {
        let mut h = joined();
        h.client.handle_frame(Packet::PlayerCommand {
            command: command(500, 0x10),
        });
        h.client.handle_frame(Packet::PlayerCommand {
            command: command(800, 0x11),
        });
        h.client.handle_frame(Packet::SyncRequest { time: 600 });
        h.client.handle_frame(Packet::Time { time: 1000 });
        h.client.think(1000);

        // The reported hash covers the command due at 500 but not the one
        // due at 800, even though both were known before the checkpoint.
        let mut mirror = ScriptedSimulation::new();
        mirror.enqueue_command(command(500, 0x10));
        mirror.advance_to(600);
        let expected = mirror.sync_hash();

        let sent = drain(&mut h.out);
        let reported = sent
            .iter()
            .find_map(|p| match p {
                Packet::SyncReport { time, hash } => Some((*time, *hash)),
                _ => None,
            })
            .expect("sync report sent");
        assert_eq!(reported, (600, expected));

        // Past the checkpoint the later command ran too.
        assert_eq!(h.client.simulation().applied.len(), 2);
    }

    #[test]
    fn wait_fastforwards_to_network_time_and_freezes() {
        let mut h = joined();
        h.client.handle_frame(Packet::Time { time: 1000 });
        h.client.think(100);
        assert_eq!(h.client.local_time(), 100);

        h.client.handle_frame(Packet::Wait);
        assert_eq!(h.client.local_time(), 1000);
        assert_eq!(h.client.speed(), 0);
        assert_eq!(drain_events(&mut h.events), vec![ClientEvent::Waiting]);

        // Frozen until the host raises the speed again.
        h.client.handle_frame(Packet::Time { time: 2000 });
        h.client.think(5000);
        assert_eq!(h.client.local_time(), 1000);

        h.client.handle_frame(Packet::SetSpeed { speed: 1000 });
        h.client.think(1000);
        assert_eq!(h.client.local_time(), 2000);
    }

    #[test]
    fn time_reports_flow_at_the_configured_interval() {
        let mut h = joined();
        h.client.handle_frame(Packet::Time { time: 10_000 });

        h.client.think(50);
        assert!(drain(&mut h.out).is_empty());

        h.client.think(50);
        assert_eq!(drain(&mut h.out), vec![Packet::Time { time: 100 }]);
    }

    #[test]
    fn ping_is_answered() {
        let mut h = joined();
        h.client.handle_frame(Packet::Ping { seq: 42 });
        assert_eq!(drain(&mut h.out), vec![Packet::Pong { seq: 42 }]);
    }

    #[test]
    fn disconnect_from_host_surfaces_as_event() {
        let mut h = joined();
        h.client.handle_frame(Packet::Disconnect {
            reason: DisconnectReason::Desynced,
            arg: "sync report mismatch".to_string(),
        });
        assert!(!h.client.is_connected());
        assert_eq!(
            drain_events(&mut h.events),
            vec![ClientEvent::Disconnected {
                reason: DisconnectReason::Desynced,
                arg: "sync report mismatch".to_string(),
            }]
        );

        // Dead connection drops everything silently.
        h.client.handle_frame(Packet::Ping { seq: 1 });
        h.client.think(1000);
        assert!(drain(&mut h.out).is_empty());
    }

    #[test]
    fn desired_speed_goes_to_the_host_not_local_state() {
        let mut h = joined();
        h.client.set_desired_speed(2500);
        assert_eq!(drain(&mut h.out), vec![Packet::DesiredSpeed { speed: 2500 }]);
        // Effective speed only changes when the host says so.
        assert_eq!(h.client.speed(), 1000);
    }

    #[test]
    fn desired_speed_chosen_before_welcome_reaches_the_host() {
        let mut h = harness();
        drain(&mut h.out); // hello

        // Held back while unwelcomed: the host would disconnect us for it.
        h.client.set_desired_speed(2500);
        assert_eq!(drain(&mut h.out), vec![]);

        h.client.handle_frame(Packet::Welcome { slot: 1 });
        assert_eq!(drain(&mut h.out), vec![Packet::DesiredSpeed { speed: 2500 }]);
    }

    /// Full host/client exchange over in-memory channels: input from both
    /// sides, a sync checkpoint, and bit-identical state at the end.
    #[test]
    fn host_and_client_stay_bit_identical() {
        let (h_out_tx, mut h_out) = mpsc::unbounded_channel();
        let (h_ev_tx, _h_ev) = mpsc::unbounded_channel();
        let settings = GameSettings {
            map_name: "crater".to_string(),
            random_seed: 7,
            default_speed: 1000,
            players: vec![
                PlayerSettings::human("host", 0, 1),
                PlayerSettings::human("ana", 1, 2),
            ],
        };
        let mut host = HostCoordinator::new(
            SyncConfig::default(),
            settings,
            0,
            ScriptedSimulation::new(),
            h_out_tx,
            h_ev_tx,
        );

        let (c_out_tx, mut c_out) = mpsc::unbounded_channel();
        let (c_ev_tx, _c_ev) = mpsc::unbounded_channel();
        let mut client = ClientPeer::new(
            SyncConfig::default(),
            "ana",
            ScriptedSimulation::new(),
            c_out_tx,
            c_ev_tx,
        );

        const CONN: ConnId = 1;
        host.accept(CONN);

        let mut pump = |host: &mut HostCoordinator<ScriptedSimulation>,
                        client: &mut ClientPeer<ScriptedSimulation>| {
            loop {
                let mut moved = false;
                while let Ok(p) = c_out.try_recv() {
                    host.handle_frame(CONN, p);
                    moved = true;
                }
                while let Ok(d) = h_out.try_recv() {
                    if let NetDirective::Send { conn, packet } = d {
                        assert_eq!(conn, CONN);
                        client.handle_frame(packet);
                    }
                    moved = true;
                }
                if !moved {
                    break;
                }
            }
        };

        pump(&mut host, &mut client);
        assert_eq!(client.slot(), Some(1));

        // Input from both sides, interleaved with lockstep progress.
        host.submit_local_command(0, KIND_APPLICATION_BASE, vec![1])
            .unwrap();
        pump(&mut host, &mut client);
        for _ in 0..10 {
            host.think(100);
            pump(&mut host, &mut client);
            client.think(100);
            pump(&mut host, &mut client);
        }
        client.submit_command(KIND_APPLICATION_BASE + 1, vec![2]);
        pump(&mut host, &mut client);
        for _ in 0..30 {
            host.think(100);
            pump(&mut host, &mut client);
            client.think(100);
            pump(&mut host, &mut client);
        }

        // Both simulations executed both commands at identical times.
        assert!(host.simulation().applied.len() >= 2);
        assert_eq!(host.simulation().applied, client.simulation().applied);

        let t = host
            .simulation()
            .gametime()
            .min(client.simulation().gametime());
        let hash_at = |applied: &[(Time, Command)]| {
            let mut sim = ScriptedSimulation::new();
            for (_, cmd) in applied {
                sim.enqueue_command(cmd.clone());
            }
            sim.advance_to(t);
            sim.sync_hash()
        };
        assert_eq!(
            hash_at(&host.simulation().applied),
            hash_at(&client.simulation().applied)
        );
    }
}
