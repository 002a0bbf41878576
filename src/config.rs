//! Runtime configuration: the timing constants that drive the three Raft
//! timers (spec §4.5), following the shape of `async-raft::Config` --
//! defaults baked in, jittered election timeouts generated on demand.

use rand::Rng;

/// Tuning knobs for the Raft timers.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base election timeout, in milliseconds. The actual timeout used is
    /// `election_timeout_millis * (1 + U)` for `U` uniform in `[0, 1)`.
    pub election_timeout_millis: u64,
    /// How often a leader sends a heartbeat to an otherwise-idle peer.
    pub heartbeat_interval_millis: u64,
    /// The replication timer's polling floor: it never fires more often
    /// than this.
    pub min_replication_interval_millis: u64,
    /// The polling resolution used by the election and step-down timers.
    pub tick_interval_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_millis: 2_000,
            heartbeat_interval_millis: 1_000,
            min_replication_interval_millis: 50,
            tick_interval_millis: 100,
        }
    }
}

impl Config {
    /// A fresh, jittered election timeout duration: `election_timeout * (1 + U)`.
    pub fn new_rand_election_timeout(&self) -> std::time::Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let millis = (self.election_timeout_millis as f64) * (1.0 + jitter);
        std::time::Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_timeout_stays_within_one_to_two_times_base() {
        let config = Config::default();
        for _ in 0..100 {
            let d = config.new_rand_election_timeout();
            assert!(d.as_millis() as u64 >= config.election_timeout_millis);
            assert!(d.as_millis() as u64 <= config.election_timeout_millis * 2);
        }
    }
}
