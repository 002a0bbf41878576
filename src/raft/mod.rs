//! The consensus state machine tying Log, state machine and Runtime
//! together (spec §4.5): follower/candidate/leader roles, election, a
//! step-down timer, quorum tracking, commit-index advancement and
//! application of committed entries.
//!
//! Mirrors `async-raft`'s `RaftCore`/`LeaderState`/`CandidateState`/
//! `FollowerState` split, minus the snapshot and membership-change
//! machinery this spec excludes: here a single `RaftState` struct carries
//! all three roles' data at once (no log compaction or joint-consensus
//! bookkeeping to keep separate), guarded by one `tokio::sync::Mutex`
//! per spec §5 ("Raft state: a single lock suffices").

pub mod client;
pub mod election;
pub mod replication;
pub mod timers;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::log::Log;
use crate::runtime::Runtime;
use crate::state_machine::StateMachine;

/// The three roles a node can occupy (spec §4.5). There is no `NonVoter` or
/// `Shutdown` role here -- membership changes are out of scope, and a fatal
/// fault simply exits the process rather than transitioning through a
/// shutdown state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// All Raft role state, held behind `RaftNode::state`.
pub struct RaftState {
    pub id: String,
    pub peers: Vec<String>,
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<String>,
    /// The node this follower believes is the current leader. Cleared on
    /// every role transition; only `append_entries` re-establishes it.
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log: Log,
    pub sm: StateMachine,
    /// Leader-only: for each peer, the index of the next entry to send.
    pub next_index: HashMap<String, u64>,
    /// Leader-only: for each peer, the highest index known to be replicated.
    pub match_index: HashMap<String, u64>,
    /// Candidate-only: the set of peers (including self) that have granted
    /// a vote in the current term.
    pub votes: HashSet<String>,
    pub election_deadline: Instant,
    pub step_down_deadline: Instant,
    /// Leader-only: last time an `append_entries` was sent to each peer, used
    /// to decide when a bare heartbeat is due.
    pub last_replicated_at: HashMap<String, Instant>,
}

impl RaftState {
    pub fn new(id: String, peers: Vec<String>, config: &Config) -> Self {
        let now = Instant::now();
        Self {
            id,
            peers,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            log: Log::new(),
            sm: StateMachine::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: now + config.new_rand_election_timeout(),
            step_down_deadline: now + Duration::from_millis(config.election_timeout_millis),
            last_replicated_at: HashMap::new(),
        }
    }

    /// `⌊n/2⌋ + 1` over the full cluster member list (spec GLOSSARY).
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn other_peers(&self) -> Vec<String> {
        self.peers.iter().filter(|p| **p != self.id).cloned().collect()
    }

    pub fn reset_election_deadline(&mut self, config: &Config) {
        self.election_deadline = Instant::now() + config.new_rand_election_timeout();
    }

    pub fn reset_step_down_deadline(&mut self, config: &Config) {
        self.step_down_deadline = Instant::now() + Duration::from_millis(config.election_timeout_millis);
    }

    /// If `term` exceeds our own, advance our term (clearing `voted_for`) and
    /// become a follower. Returns whether a step-down occurred.
    pub fn maybe_step_down(&mut self, config: &Config, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.become_follower(config);
            true
        } else {
            false
        }
    }

    pub fn become_follower(&mut self, config: &Config) {
        self.role = Role::Follower;
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
        self.votes.clear();
        self.last_replicated_at.clear();
        self.reset_election_deadline(config);
    }

    pub fn become_candidate(&mut self, config: &Config) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.reset_election_deadline(config);
        self.reset_step_down_deadline(config);
    }

    /// Pre-condition: role is candidate (spec §4.5 "Becoming leader").
    pub fn become_leader(&mut self, config: &Config) {
        assert_eq!(self.role, Role::Candidate, "become_leader called outside candidate role");
        self.role = Role::Leader;
        // The leader is its own presumed leader; this only matters for
        // forwarding decisions, which always check `role == Leader` first.
        self.leader_id = Some(self.id.clone());
        self.next_index.clear();
        self.match_index.clear();
        self.last_replicated_at.clear();
        let next = self.log.size() + 1;
        for peer in self.other_peers() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }
        self.reset_step_down_deadline(config);
    }
}

/// A point-in-time snapshot of a node's role and log progress, for
/// observability and tests -- the equivalent of `async-raft`'s
/// `RaftMetrics`, minus its `watch`-channel subscription machinery (no
/// component of this system needs to await a metrics change; `tracing`
/// already carries every transition as it happens).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metrics {
    pub role: Role,
    pub current_term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Owns the Raft state and the handles (Runtime, Config) needed to act on it.
pub struct RaftNode {
    pub runtime: Arc<Runtime>,
    pub config: Arc<Config>,
    state: Mutex<RaftState>,
}

impl RaftNode {
    pub fn new(runtime: Arc<Runtime>, config: Arc<Config>, id: String, peers: Vec<String>) -> Arc<Self> {
        let mut state = RaftState::new(id, peers, &config);
        // A single-node cluster has already secured its own vote's majority
        // the moment it becomes a candidate; there is no peer left to wait
        // a `request_vote_res` from, so the ordinary election path would
        // never fire `become_leader`. Promote it immediately instead.
        if state.majority() == 1 {
            state.become_candidate(&config);
            state.become_leader(&config);
        }
        Arc::new(Self {
            runtime,
            config,
            state: Mutex::new(state),
        })
    }

    pub async fn metrics(&self) -> Metrics {
        let state = self.state.lock().await;
        Metrics {
            role: state.role,
            current_term: state.current_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
        }
    }
}
