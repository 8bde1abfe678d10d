use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::command::{Command, Time};
use crate::settings::GameSettings;
use crate::sync::SyncHash;

const REPLAY_MAGIC: &[u8; 4] = b"LKRP";
const REPLAY_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a replay file")]
    BadMagic,
    #[error("unsupported replay version {0}")]
    UnsupportedVersion(u8),
    #[error("corrupt replay record: {0}")]
    Corrupt(#[from] bincode::Error),
    #[error("replay record of {0} bytes exceeds the sanity limit")]
    OversizedRecord(u32),
}

/// One entry of the recorded session, in authority send order.
///
/// Checkpoints carry the hash the live session produced; playing the same
/// command stream into the same simulation must reproduce them exactly, so
/// a replay doubles as a determinism check of the simulation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplayRecord {
    Command(Command),
    Checkpoint { time: Time, hash: SyncHash },
}

// Records are length-framed so a truncated tail (crash mid-write) surfaces
// as a clean end of stream instead of a bincode panic deep in a record.
const MAX_RECORD_LEN: u32 = 1 << 20;

/// Records the stamped command stream of a live session to a file, together
/// with the settings snapshot needed to restart the simulation identically.
pub struct ReplayWriter {
    out: BufWriter<File>,
}

impl ReplayWriter {
    pub fn create(path: impl AsRef<Path>, settings: &GameSettings) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(REPLAY_MAGIC)?;
        out.write_all(&[REPLAY_VERSION])?;
        let header = bincode::serialize(settings)?;
        out.write_all(&(header.len() as u32).to_le_bytes())?;
        out.write_all(&header)?;
        info!(replay_path = %path.display(), "replay recording started");
        Ok(Self { out })
    }

    /// Appends one stamped command, in the order the authority sent it.
    pub fn record_command(&mut self, command: &Command) -> Result<(), ReplayError> {
        debug_assert!(command.is_stamped());
        self.write_record(&ReplayRecord::Command(command.clone()))
    }

    /// Appends the checksum a passed sync check produced, for verification
    /// during playback.
    pub fn record_checkpoint(&mut self, time: Time, hash: SyncHash) -> Result<(), ReplayError> {
        self.write_record(&ReplayRecord::Checkpoint { time, hash })
    }

    fn write_record(&mut self, record: &ReplayRecord) -> Result<(), ReplayError> {
        let bytes = bincode::serialize(record)?;
        self.out.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.out.write_all(&bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ReplayError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads a recorded session back as a command source: the same stream, in
/// the same order, with the recorded checkpoint hashes for cross-checking.
pub struct ReplayReader {
    input: BufReader<File>,
    pending: Option<ReplayRecord>,
}

impl ReplayReader {
    /// Opens a replay and returns the settings snapshot the session ran
    /// with; the caller rebuilds the simulation from it before playback.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, GameSettings), ReplayError> {
        let path = path.as_ref();
        let mut input = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != REPLAY_MAGIC {
            return Err(ReplayError::BadMagic);
        }
        let mut version = [0u8; 1];
        input.read_exact(&mut version)?;
        if version[0] != REPLAY_VERSION {
            return Err(ReplayError::UnsupportedVersion(version[0]));
        }

        let mut len = [0u8; 4];
        input.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len);
        if len > MAX_RECORD_LEN {
            return Err(ReplayError::OversizedRecord(len));
        }
        let mut header = vec![0u8; len as usize];
        input.read_exact(&mut header)?;
        let settings: GameSettings = bincode::deserialize(&header)?;

        info!(
            replay_path = %path.display(),
            map = %settings.map_name,
            "replay opened"
        );
        Ok((
            Self {
                input,
                pending: None,
            },
            settings,
        ))
    }

    /// Next record in recorded order; `None` at the end of the stream. A
    /// record cut short by a crash during recording also ends the stream.
    pub fn next_record(&mut self) -> Result<Option<ReplayRecord>, ReplayError> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        self.read_record()
    }

    /// Command-feed view, used by a simulation driver exactly like live
    /// network input: the next command due at or before `up_to`, in
    /// recorded order. Checkpoint records are skipped; callers interested
    /// in verification walk `next_record` instead.
    pub fn next_command(&mut self, up_to: Time) -> Result<Option<Command>, ReplayError> {
        loop {
            let record = match self.next_record()? {
                Some(record) => record,
                None => return Ok(None),
            };
            match record {
                ReplayRecord::Command(c) if c.due_time <= up_to => return Ok(Some(c)),
                ReplayRecord::Command(c) => {
                    // Not due yet; keep it for the next call.
                    self.pending = Some(ReplayRecord::Command(c));
                    return Ok(None);
                }
                ReplayRecord::Checkpoint { .. } => continue,
            }
        }
    }

    /// True once the stream is exhausted.
    pub fn end_of_replay(&mut self) -> Result<bool, ReplayError> {
        if self.pending.is_some() {
            return Ok(false);
        }
        self.pending = self.read_record()?;
        Ok(self.pending.is_none())
    }

    fn read_record(&mut self) -> Result<Option<ReplayRecord>, ReplayError> {
        let mut len = [0u8; 4];
        match self.input.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len);
        if len > MAX_RECORD_LEN {
            return Err(ReplayError::OversizedRecord(len));
        }
        let mut bytes = vec![0u8; len as usize];
        match self.input.read_exact(&mut bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!(record_len = len, "replay ends mid-record, stopping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Some(bincode::deserialize(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::KIND_APPLICATION_BASE;
    use crate::settings::PlayerSettings;
    use crate::simulation::testing::ScriptedSimulation;
    use crate::simulation::SyncedSimulation;

    fn settings() -> GameSettings {
        GameSettings {
            map_name: "crater".to_string(),
            random_seed: 99,
            default_speed: 1000,
            players: vec![
                PlayerSettings::human("ana", 0, 1),
                PlayerSettings::human("ben", 1, 2),
            ],
        }
    }

    fn cmd(due: Time, sender: u8, payload: Vec<u8>) -> Command {
        Command {
            due_time: due,
            sender,
            kind: KIND_APPLICATION_BASE,
            payload,
        }
    }

    #[test]
    fn records_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.replay");

        let hash = SyncHash::of_state(b"at 2000");
        {
            let mut w = ReplayWriter::create(&path, &settings()).unwrap();
            w.record_command(&cmd(101, 0, vec![1])).unwrap();
            w.record_command(&cmd(450, 1, vec![2, 3])).unwrap();
            w.record_checkpoint(2000, hash).unwrap();
            w.record_command(&cmd(2001, 0, vec![])).unwrap();
            w.flush().unwrap();
        }

        let (mut r, loaded) = ReplayReader::open(&path).unwrap();
        assert_eq!(loaded, settings());
        assert_eq!(
            r.next_record().unwrap(),
            Some(ReplayRecord::Command(cmd(101, 0, vec![1])))
        );
        assert_eq!(
            r.next_record().unwrap(),
            Some(ReplayRecord::Command(cmd(450, 1, vec![2, 3])))
        );
        assert_eq!(
            r.next_record().unwrap(),
            Some(ReplayRecord::Checkpoint { time: 2000, hash })
        );
        assert_eq!(
            r.next_record().unwrap(),
            Some(ReplayRecord::Command(cmd(2001, 0, vec![])))
        );
        assert_eq!(r.next_record().unwrap(), None);
    }

    #[test]
    fn replayed_session_matches_recorded_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.replay");

        // Live session: run commands through a simulation, recording the
        // stream and the checkpoint hashes as they are produced.
        {
            let mut live = ScriptedSimulation::new();
            let mut w = ReplayWriter::create(&path, &settings()).unwrap();
            let commands = [cmd(101, 0, vec![7]), cmd(350, 1, vec![8]), cmd(900, 0, vec![9])];
            for c in &commands {
                w.record_command(c).unwrap();
                live.enqueue_command(c.clone());
            }
            live.advance_to(500);
            w.record_checkpoint(500, live.sync_hash()).unwrap();
            live.advance_to(1000);
            w.record_checkpoint(1000, live.sync_hash()).unwrap();
            w.flush().unwrap();
        }

        // Playback into a fresh simulation reproduces both hashes.
        let (mut r, _) = ReplayReader::open(&path).unwrap();
        let mut replayed = ScriptedSimulation::new();
        while let Some(record) = r.next_record().unwrap() {
            match record {
                ReplayRecord::Command(c) => replayed.enqueue_command(c),
                ReplayRecord::Checkpoint { time, hash } => {
                    replayed.advance_to(time);
                    assert_eq!(replayed.sync_hash(), hash, "divergence at {time}");
                }
            }
        }
        assert_eq!(replayed.gametime(), 1000);
    }

    #[test]
    fn command_feed_view_gates_on_due_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.replay");
        {
            let mut w = ReplayWriter::create(&path, &settings()).unwrap();
            w.record_command(&cmd(101, 0, vec![1])).unwrap();
            w.record_checkpoint(200, SyncHash::of_state(b"x")).unwrap();
            w.record_command(&cmd(300, 1, vec![2])).unwrap();
            w.flush().unwrap();
        }

        let (mut r, _) = ReplayReader::open(&path).unwrap();
        assert!(!r.end_of_replay().unwrap());

        assert_eq!(r.next_command(100).unwrap(), None);
        assert_eq!(r.next_command(101).unwrap(), Some(cmd(101, 0, vec![1])));
        // The checkpoint is transparent to the command feed.
        assert_eq!(r.next_command(250).unwrap(), None);
        assert_eq!(r.next_command(300).unwrap(), Some(cmd(300, 1, vec![2])));
        assert!(r.end_of_replay().unwrap());
        assert_eq!(r.next_command(9999).unwrap(), None);
    }

    #[test]
    fn truncated_tail_ends_the_stream_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.replay");

        {
            let mut w = ReplayWriter::create(&path, &settings()).unwrap();
            w.record_command(&cmd(101, 0, vec![1])).unwrap();
            w.record_command(&cmd(200, 1, vec![2])).unwrap();
            w.flush().unwrap();
        }
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let (mut r, _) = ReplayReader::open(&path).unwrap();
        assert!(matches!(
            r.next_record().unwrap(),
            Some(ReplayRecord::Command(_))
        ));
        // Second record is cut short: end of stream, not an error.
        assert_eq!(r.next_record().unwrap(), None);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.replay");
        std::fs::write(&path, b"GARBAGE FILE").unwrap();
        assert!(matches!(
            ReplayReader::open(&path),
            Err(ReplayError::BadMagic)
        ));
    }
}
