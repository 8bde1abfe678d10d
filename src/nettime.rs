use tracing::warn;

use crate::command::Time;
use crate::fields;

/// Per-peer time reconciliation: tracks the locally simulated time against
/// the most recently received authoritative network time and answers "how
/// far may the simulation legally advance this tick".
///
/// The local time never passes the network time. When it has caught up the
/// simulation simply waits for more authority input; it never extrapolates,
/// because extrapolated ticks could execute commands the authority has not
/// ordered yet.
#[derive(Debug, Clone)]
pub struct NetworkTime {
    local: Time,
    network: Time,
}

impl NetworkTime {
    pub fn new(start: Time) -> Self {
        Self {
            local: start,
            network: start,
        }
    }

    /// Updates the authoritative reference time. A value behind the current
    /// reference is clamped and logged: the sender violated the protocol,
    /// but that is the sender's problem, not a local error.
    pub fn receive(&mut self, network_time: Time) {
        if network_time < self.network {
            warn!(
                { fields::NETWORK_TIME } = network_time,
                previous = self.network,
                "authority time ran backwards, ignoring"
            );
            return;
        }
        self.network = network_time;
    }

    /// Advances the local time toward the network time at `speed`
    /// (milliseconds of simulated time per real second) over `delta_ms` of
    /// wall-clock time. No-op while caught up or at zero speed.
    pub fn think(&mut self, speed: u16, delta_ms: u32) {
        if speed == 0 || self.local >= self.network {
            return;
        }
        let step = (u64::from(speed) * u64::from(delta_ms) / 1000) as Time;
        self.local = self.local.saturating_add(step).min(self.network);
    }

    /// Snaps the local time to the network time. Only used when the
    /// effective speed has dropped to zero or a peer is catching up after a
    /// stall, to avoid a runaway backlog of pending ticks.
    pub fn fastforward(&mut self) {
        self.local = self.network;
    }

    pub fn local_time(&self) -> Time {
        self.local
    }

    pub fn network_time(&self) -> Time {
        self.network
    }

    /// True when the simulation has consumed all authorized time.
    pub fn caught_up(&self) -> bool {
        self.local >= self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_advances_at_speed() {
        let mut nt = NetworkTime::new(0);
        nt.receive(10_000);

        // 1000 ms/s over 250 real ms is 250 logical ms.
        nt.think(1000, 250);
        assert_eq!(nt.local_time(), 250);

        // Double speed.
        nt.think(2000, 250);
        assert_eq!(nt.local_time(), 750);
    }

    #[test]
    fn local_never_passes_network() {
        let mut nt = NetworkTime::new(0);
        nt.receive(100);

        for _ in 0..50 {
            nt.think(8000, 1000);
            assert!(nt.local_time() <= nt.network_time());
        }
        assert_eq!(nt.local_time(), 100);
        assert!(nt.caught_up());
    }

    #[test]
    fn no_overrun_under_interleaved_receive_and_think() {
        let mut nt = NetworkTime::new(0);
        let mut authority = 0u32;
        for step in 0..200u32 {
            if step % 3 == 0 {
                authority += (step % 7) * 40;
                nt.receive(authority);
            }
            nt.think(1000 + (step % 5) as u16 * 500, 17 + step % 13);
            assert!(
                nt.local_time() <= nt.network_time(),
                "overrun at step {step}"
            );
        }
    }

    #[test]
    fn zero_speed_freezes_local_time() {
        let mut nt = NetworkTime::new(500);
        nt.receive(2000);
        nt.think(0, 10_000);
        assert_eq!(nt.local_time(), 500);
    }

    #[test]
    fn backwards_receive_is_clamped() {
        let mut nt = NetworkTime::new(0);
        nt.receive(1000);
        nt.receive(400);
        assert_eq!(nt.network_time(), 1000);
    }

    #[test]
    fn fastforward_snaps_to_network() {
        let mut nt = NetworkTime::new(0);
        nt.receive(5000);
        nt.think(1000, 100);
        assert_eq!(nt.local_time(), 100);
        nt.fastforward();
        assert_eq!(nt.local_time(), 5000);
        assert!(nt.caught_up());
    }
}
