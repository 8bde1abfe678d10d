use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::command::{ConnId, Time};
use crate::fields;

pub const SYNC_HASH_LEN: usize = 16;

/// 128-bit checksum of the full simulation state. For a consistent game the
/// hashes of all participants at the same logical time are bit-identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncHash(pub [u8; SYNC_HASH_LEN]);

impl SyncHash {
    /// Hashes a serialized state snapshot (SHA-256, truncated).
    pub fn of_state(state: &[u8]) -> Self {
        let digest = Sha256::digest(state);
        let mut out = [0u8; SYNC_HASH_LEN];
        out.copy_from_slice(&digest[..SYNC_HASH_LEN]);
        Self(out)
    }
}

impl fmt::Debug for SyncHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncHash({self})")
    }
}

impl fmt::Display for SyncHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A checksum tagged with the logical time it was computed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub time: Time,
    pub hash: SyncHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// No sync check outstanding.
    Idle,
    /// A checkpoint time has been chosen and announced to every peer.
    Requested,
    /// Reports are trickling in as each peer's simulation reaches the
    /// checkpoint; they arrive in any order.
    Collecting,
}

/// Collects sync reports for one checkpoint epoch and compares each
/// client's checksum byte-for-byte against the authority's own.
///
/// State machine per epoch: Idle -> Requested -> Collecting -> (compare)
/// -> Idle. Comparison happens as soon as the last expected report is in.
pub struct SyncVerifier {
    state: EpochState,
    checkpoint: Time,
    last_checkpoint: Time,
    expected: Vec<ConnId>,
    reports: HashMap<ConnId, SyncHash>,
    host_hash: Option<SyncHash>,
}

impl SyncVerifier {
    pub fn new() -> Self {
        Self {
            state: EpochState::Idle,
            checkpoint: 0,
            last_checkpoint: 0,
            expected: Vec::new(),
            reports: HashMap::new(),
            host_hash: None,
        }
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn outstanding(&self) -> bool {
        self.state != EpochState::Idle
    }

    /// Checkpoint time of the outstanding epoch, if any.
    pub fn checkpoint(&self) -> Option<Time> {
        self.outstanding().then_some(self.checkpoint)
    }

    pub fn host_reported(&self) -> bool {
        self.host_hash.is_some()
    }

    /// Whether a new epoch should be scheduled: checks stay periodic
    /// without an external timer by re-arming whenever the committed time
    /// has moved `interval` past the previous checkpoint.
    pub fn should_rearm(&self, committed: Time, interval: Time) -> bool {
        !self.outstanding() && committed.saturating_sub(self.last_checkpoint) >= interval
    }

    /// Opens a new epoch at `checkpoint` expecting one report from each
    /// listed connection plus the authority's own.
    pub fn request(&mut self, checkpoint: Time, expected: Vec<ConnId>) {
        debug_assert!(!self.outstanding(), "sync epoch already outstanding");
        info!(
            { fields::CHECKPOINT } = checkpoint,
            { fields::REPORTS_PENDING } = expected.len(),
            "sync check requested"
        );
        self.state = EpochState::Requested;
        self.checkpoint = checkpoint;
        self.last_checkpoint = checkpoint;
        self.expected = expected;
        self.reports.clear();
        self.host_hash = None;
    }

    /// Records one peer report. Returns false for a report that does not
    /// belong to the outstanding epoch (stale time, unexpected peer or
    /// duplicate); the caller treats that as a protocol violation.
    pub fn peer_report(&mut self, conn: ConnId, report: SyncReport) -> bool {
        if !self.outstanding()
            || report.time != self.checkpoint
            || !self.expected.contains(&conn)
            || self.reports.contains_key(&conn)
        {
            return false;
        }
        debug!(
            { fields::CONN_ID } = conn,
            { fields::CHECKPOINT } = report.time,
            { fields::HASH } = %report.hash,
            "sync report received"
        );
        self.reports.insert(conn, report.hash);
        self.state = EpochState::Collecting;
        true
    }

    /// Records the authority's own checksum for the checkpoint.
    pub fn host_report(&mut self, hash: SyncHash) {
        debug_assert!(self.outstanding());
        self.host_hash = Some(hash);
        if self.state == EpochState::Requested {
            self.state = EpochState::Collecting;
        }
    }

    /// Removes a disconnected peer from the epoch so its missing report can
    /// never stall the remaining session.
    pub fn drop_peer(&mut self, conn: ConnId) {
        self.expected.retain(|c| *c != conn);
        self.reports.remove(&conn);
    }

    /// Once every expected report (the authority's included) has arrived,
    /// compares them and closes the epoch. Returns the diverging
    /// connections; an empty result means the session is consistent.
    pub fn try_compare(&mut self) -> Option<Vec<ConnId>> {
        if !self.outstanding() {
            return None;
        }
        let host_hash = self.host_hash?;
        if self.expected.iter().any(|c| !self.reports.contains_key(c)) {
            return None;
        }

        let mut diverged = Vec::new();
        for conn in &self.expected {
            let hash = self.reports[conn];
            if hash != host_hash {
                error!(
                    { fields::CONN_ID } = conn,
                    { fields::CHECKPOINT } = self.checkpoint,
                    { fields::HASH } = %hash,
                    { fields::EXPECTED_HASH } = %host_hash,
                    "sync report mismatch, peer desynced"
                );
                diverged.push(*conn);
            }
        }
        if diverged.is_empty() {
            info!(
                { fields::CHECKPOINT } = self.checkpoint,
                "sync check passed, all peers consistent"
            );
        }

        self.state = EpochState::Idle;
        self.expected.clear();
        self.reports.clear();
        self.host_hash = None;
        Some(diverged)
    }
}

impl Default for SyncVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(time: Time, hash: SyncHash) -> SyncReport {
        SyncReport { time, hash }
    }

    #[test]
    fn hash_is_stable_and_sensitive() {
        let a = SyncHash::of_state(b"state at 5000");
        let b = SyncHash::of_state(b"state at 5000");
        let c = SyncHash::of_state(b"state at 5001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a}").len(), SYNC_HASH_LEN * 2);
    }

    #[test]
    fn matching_reports_close_the_epoch_cleanly() {
        let mut v = SyncVerifier::new();
        let hash = SyncHash::of_state(b"consistent");

        v.request(5000, vec![1, 2, 3]);
        assert_eq!(v.state(), EpochState::Requested);
        assert!(v.try_compare().is_none());

        // Reports arrive in arbitrary order.
        assert!(v.peer_report(2, report(5000, hash)));
        assert_eq!(v.state(), EpochState::Collecting);
        assert!(v.peer_report(3, report(5000, hash)));
        assert!(v.try_compare().is_none());

        assert!(v.peer_report(1, report(5000, hash)));
        v.host_report(hash);

        assert_eq!(v.try_compare(), Some(vec![]));
        assert_eq!(v.state(), EpochState::Idle);
    }

    #[test]
    fn single_bit_difference_flags_only_that_peer() {
        let mut v = SyncVerifier::new();
        let good = SyncHash::of_state(b"consistent");
        let mut bad = good;
        bad.0[0] ^= 0x01;

        v.request(5000, vec![1, 2, 3]);
        v.host_report(good);
        assert!(v.peer_report(1, report(5000, good)));
        assert!(v.peer_report(2, report(5000, bad)));
        assert!(v.peer_report(3, report(5000, good)));

        assert_eq!(v.try_compare(), Some(vec![2]));
        assert_eq!(v.state(), EpochState::Idle);
    }

    #[test]
    fn stray_reports_are_rejected() {
        let mut v = SyncVerifier::new();
        let hash = SyncHash::of_state(b"x");

        // No epoch outstanding.
        assert!(!v.peer_report(1, report(5000, hash)));

        v.request(5000, vec![1]);
        // Wrong time.
        assert!(!v.peer_report(1, report(4000, hash)));
        // Unexpected peer.
        assert!(!v.peer_report(9, report(5000, hash)));
        // Duplicate.
        assert!(v.peer_report(1, report(5000, hash)));
        assert!(!v.peer_report(1, report(5000, hash)));
    }

    #[test]
    fn dropped_peer_cannot_stall_comparison() {
        let mut v = SyncVerifier::new();
        let hash = SyncHash::of_state(b"x");

        v.request(5000, vec![1, 2]);
        v.host_report(hash);
        assert!(v.peer_report(1, report(5000, hash)));
        assert!(v.try_compare().is_none());

        v.drop_peer(2);
        assert_eq!(v.try_compare(), Some(vec![]));
    }

    #[test]
    fn rearm_interval_is_respected() {
        let mut v = SyncVerifier::new();
        assert!(!v.should_rearm(1999, 2000));
        assert!(v.should_rearm(2000, 2000));

        v.request(2500, vec![1]);
        // Outstanding epoch blocks re-arming regardless of elapsed time.
        assert!(!v.should_rearm(10_000, 2000));

        v.host_report(SyncHash::of_state(b"x"));
        v.peer_report(1, SyncReport { time: 2500, hash: SyncHash::of_state(b"x") });
        v.try_compare();
        assert!(!v.should_rearm(4000, 2000));
        assert!(v.should_rearm(4500, 2000));
    }
}
