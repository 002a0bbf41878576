//! The three periodic tasks that drive a Raft node in the absence of any
//! inbound message: the election timer, the leader step-down timer, and the
//! leader replication timer (spec §4.5 "Timers").

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::raft::election;
use crate::raft::replication;
use crate::raft::RaftNode;
use crate::raft::RaftState;
use crate::raft::Role;

/// Polls at `tick_interval_millis`; starts an election whenever the deadline
/// has passed and the node is not already a leader.
pub fn spawn_election_timer(node: Arc<RaftNode>) {
    tokio::spawn(async move {
        let tick = Duration::from_millis(node.config.tick_interval_millis);
        loop {
            tokio::time::sleep(tick).await;
            let due = {
                let state = node.state.lock().await;
                state.role != Role::Leader && Instant::now() >= state.election_deadline
            };
            if due {
                election::start_election(node.clone()).await;
            }
        }
    });
}

/// Polls at `tick_interval_millis`; a leader whose step-down deadline has
/// passed without hearing from a majority reverts to follower (spec §4.5
/// "Leader step-down").
///
/// A single-node cluster has no peer to ever ack from, so the deadline would
/// otherwise elapse unconditionally every `election_timeout_millis` and
/// bounce the node between `Leader` and a leaderless `Follower` forever,
/// contradicting spec §8's boundary case ("that node becomes leader on its
/// first election and services all requests locally"). There is trivially
/// always a quorum of one, so such a node is never subject to step-down.
pub fn spawn_step_down_timer(node: Arc<RaftNode>) {
    tokio::spawn(async move {
        let tick = Duration::from_millis(node.config.tick_interval_millis);
        loop {
            tokio::time::sleep(tick).await;
            let mut state = node.state.lock().await;
            if should_step_down(&state, Instant::now()) {
                tracing::warn!(term = state.current_term, "step-down deadline elapsed, reverting to follower");
                state.become_follower(&node.config);
            }
        }
    });
}

/// Whether a leader's step-down deadline has elapsed without acks from a
/// majority. Always `false` for a single-node cluster, which has no peer to
/// ever ack from and is trivially always at quorum.
fn should_step_down(state: &RaftState, now: Instant) -> bool {
    state.role == Role::Leader && state.peers.len() > 1 && now >= state.step_down_deadline
}

/// Fires `replicate_cycle` no more often than `min_replication_interval_millis`.
/// A leader with nothing new to send still wakes up on this cadence so that
/// due heartbeats get sent (spec §4.5 "Leader replication cycle").
pub fn spawn_replication_timer(node: Arc<RaftNode>) {
    tokio::spawn(async move {
        let interval = Duration::from_millis(node.config.min_replication_interval_millis);
        loop {
            tokio::time::sleep(interval).await;
            replication::replicate_cycle(node.clone()).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn single_node_leader_never_steps_down_however_long_the_deadline_has_passed() {
        let config = Config::default();
        let mut state = RaftState::new("n1".into(), vec!["n1".into()], &config);
        state.role = Role::Leader;
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(!should_step_down(&state, far_future));
    }

    #[test]
    fn multi_node_leader_steps_down_once_its_deadline_has_passed() {
        let config = Config::default();
        let mut state = RaftState::new("n1".into(), vec!["n1".into(), "n2".into()], &config);
        state.role = Role::Leader;
        let past_deadline = state.step_down_deadline + Duration::from_millis(1);
        assert!(should_step_down(&state, past_deadline));
    }

    #[test]
    fn follower_never_steps_down_regardless_of_deadline() {
        let config = Config::default();
        let state = RaftState::new("n1".into(), vec!["n1".into(), "n2".into()], &config);
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(!should_step_down(&state, far_future));
    }
}
