//! Log replication: the `append_entries` handler (follower side), the
//! leader's replication cycle, and commit-index advancement (spec §4.5
//! "Log replication", "Leader replication cycle", "Commit-index
//! advancement").

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::HandlerResult;
use crate::error::RpcError;
use crate::log::Entry;
use crate::message::Message;
use crate::raft::client;
use crate::raft::RaftNode;
use crate::raft::Role;

#[derive(Deserialize)]
struct AppendEntriesBody {
    term: u64,
    leader_id: String,
    /// `i64` rather than `u64` so a negative (and hence malformed) value can
    /// be told apart from the valid zero case (the sentinel; see DESIGN.md's
    /// resolution of this spec's own internal disagreement on the point).
    prev_log_index: i64,
    prev_log_term: u64,
    #[serde(default)]
    entries: Vec<Entry>,
    leader_commit: u64,
}

#[derive(Deserialize)]
struct AppendEntriesResponseBody {
    term: u64,
    success: bool,
}

/// Handler for inbound `append_entries` (spec §4.5 "Log replication").
pub async fn handle_append_entries(node: Arc<RaftNode>, msg: Message) -> HandlerResult {
    let body: AppendEntriesBody = msg.parse().map_err(RpcError::crash)?;

    if body.prev_log_index < 0 {
        tracing::error!(prev_log_index = body.prev_log_index, "leader sent a negative prev_log_index, aborting");
        std::process::exit(1);
    }
    let prev_log_index = body.prev_log_index as u64;

    let mut state = node.state.lock().await;
    state.maybe_step_down(&node.config, body.term);

    let fail = serde_json::json!({
        "type": "append_entries_res",
        "term": state.current_term,
        "success": false,
    });

    if body.term < state.current_term {
        return Ok(Some(fail));
    }

    // spec §4.5's state table has a transition `maybe_step_down` alone
    // doesn't cover: "candidate -> follower: ... OR receive valid
    // append_entries for current term" (not just a strictly greater one).
    // Without this, a candidate that hears the winner of its own term's
    // election stays `Candidate`, and a late `request_vote_res` for that
    // term can still carry it to `become_leader()` -- a second leader in
    // a term that already has one.
    if state.role != Role::Leader {
        state.become_follower(&node.config);
    }

    state.leader_id = Some(body.leader_id.clone());
    state.reset_election_deadline(&node.config);

    if prev_log_index > state.log.size() || state.log.get(prev_log_index).term != body.prev_log_term {
        return Ok(Some(fail));
    }

    state.log.truncate(prev_log_index);
    state.log.append(body.entries);

    let to_reply = if body.leader_commit > state.commit_index {
        state.commit_index = body.leader_commit.min(state.log.size());
        client::apply_committed(&mut state)
    } else {
        Vec::new()
    };

    let success = serde_json::json!({
        "type": "append_entries_res",
        "term": state.current_term,
        "success": true,
    });
    drop(state);

    for (client_msg, resp) in to_reply {
        let _ = node.runtime.reply(&client_msg, resp).await;
    }

    Ok(Some(success))
}

/// Called right after a candidate becomes leader, to fire the first
/// replication cycle immediately rather than waiting for the next tick
/// (spec §4.5 "Becoming leader": "force the next replication to fire
/// immediately").
pub async fn on_become_leader(node: Arc<RaftNode>) {
    replicate_cycle(node).await;
}

/// One pass of the leader replication cycle: for each peer with unsent
/// entries, or for which a heartbeat is due, send one `append_entries`.
pub async fn replicate_cycle(node: Arc<RaftNode>) {
    let heartbeat_interval = Duration::from_millis(node.config.heartbeat_interval_millis);

    let (term, to_send) = {
        let mut state = node.state.lock().await;
        if state.role != Role::Leader {
            return;
        }

        let now = Instant::now();
        let peer_ids: Vec<String> = state.peers.iter().filter(|p| **p != state.id).cloned().collect();
        let mut to_send = Vec::new();

        for peer in peer_ids {
            let ni = *state.next_index.get(&peer).unwrap_or(&(state.log.size() + 1));
            let entries = state.log.from(ni);
            let len = entries.len() as u64;

            let due_heartbeat = state
                .last_replicated_at
                .get(&peer)
                .map(|t| now.saturating_duration_since(*t) >= heartbeat_interval)
                .unwrap_or(true);

            if entries.is_empty() && !due_heartbeat {
                continue;
            }

            let prev_log_index = ni - 1;
            let prev_log_term = state.log.get(prev_log_index).term;
            let body = serde_json::json!({
                "type": "append_entries",
                "term": state.current_term,
                "leader_id": state.id,
                "prev_log_index": prev_log_index,
                "prev_log_term": prev_log_term,
                "entries": entries,
                "leader_commit": state.commit_index,
            });

            state.last_replicated_at.insert(peer.clone(), now);
            to_send.push((peer, body, ni, len));
        }

        (state.current_term, to_send)
    };

    for (peer, body, ni, len) in to_send {
        let node = node.clone();
        let peer_for_cb = peer.clone();
        let result = node
            .runtime
            .rpc(
                &peer,
                body,
                Box::new(move |msg: Message| {
                    let node = node.clone();
                    let peer = peer_for_cb.clone();
                    Box::pin(async move { handle_append_entries_response(node, term, peer, ni, len, msg).await })
                        as BoxFuture<'static, ()>
                }),
            )
            .await;
        if let Err(err) = result {
            tracing::error!(peer = %peer, error = %err, "failed to send append_entries");
        }
    }

    // Recompute unconditionally, not only from append_entries_res callbacks:
    // a single-node cluster has no peer to ever send an RPC to, let alone
    // get a response from, so this is the only place its commit index ever
    // advances.
    advance_commit_index(node).await;
}

async fn handle_append_entries_response(node: Arc<RaftNode>, term: u64, peer: String, ni: u64, len: u64, msg: Message) {
    let body: AppendEntriesResponseBody = match msg.parse() {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(error = %err, "malformed append_entries_res, dropping");
            return;
        }
    };

    let should_advance_commit = {
        let mut state = node.state.lock().await;
        if state.maybe_step_down(&node.config, body.term) {
            return;
        }
        if state.role != Role::Leader || state.current_term != term {
            return;
        }
        state.reset_step_down_deadline(&node.config);

        if body.success {
            let new_next = ni + len;
            let new_match = new_next - 1;
            let next_entry = state.next_index.entry(peer.clone()).or_insert(new_next);
            if new_next > *next_entry {
                *next_entry = new_next;
            }
            let match_entry = state.match_index.entry(peer).or_insert(0);
            if new_match > *match_entry {
                *match_entry = new_match;
            }
            true
        } else {
            let next_entry = state.next_index.entry(peer).or_insert(1);
            if *next_entry > 1 {
                *next_entry -= 1;
            }
            false
        }
    };

    if should_advance_commit {
        advance_commit_index(node).await;
    }
}

/// Recompute the commit index as the lower median of `match_index` values
/// (including self), gated on the Raft §5.4.2 "current term" safety check
/// (spec §4.5 "Commit-index advancement"), then apply any newly committed
/// entries.
async fn advance_commit_index(node: Arc<RaftNode>) {
    let mut state = node.state.lock().await;
    if state.role != Role::Leader {
        return;
    }

    let mut matches: Vec<u64> = state
        .peers
        .iter()
        .filter(|p| **p != state.id)
        .map(|p| *state.match_index.get(p).unwrap_or(&0))
        .collect();
    matches.push(state.log.size());
    matches.sort_unstable();

    let majority = state.majority();
    let n = matches[matches.len() - majority];

    let to_reply = if n > state.commit_index && state.log.get(n).term == state.current_term {
        state.commit_index = n;
        client::apply_committed(&mut state)
    } else {
        Vec::new()
    };
    drop(state);

    for (client_msg, resp) in to_reply {
        let _ = node.runtime.reply(&client_msg, resp).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::raft::RaftState;

    fn majority_match_index(matches: &mut Vec<u64>, majority: usize) -> u64 {
        matches.sort_unstable();
        matches[matches.len() - majority]
    }

    #[test]
    fn commit_index_is_lower_median_of_match_indices() {
        // 5-node cluster, majority = 3: match indices [0, 2, 2, 5, 5] (self=5)
        // sorted -> [0,2,2,5,5], position size-majority = 5-3 = 2 -> value 2.
        let mut matches = vec![0, 2, 2, 5, 5];
        assert_eq!(majority_match_index(&mut matches, 3), 2);
    }

    fn raft_node(id: &str, peers: &[&str]) -> Arc<RaftNode> {
        let runtime = crate::runtime::Runtime::new(crate::transport::Transport::new());
        let config = Arc::new(Config::default());
        let state = RaftState::new(id.to_string(), peers.iter().map(|p| p.to_string()).collect(), &config);
        Arc::new(RaftNode { runtime, config, state: tokio::sync::Mutex::new(state) })
    }

    #[tokio::test]
    async fn candidate_steps_down_on_valid_append_entries_for_its_own_term() {
        let node = raft_node("n2", &["n1", "n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.role = Role::Candidate;
            state.current_term = 5;
            state.votes.insert("n2".to_string());
        }

        let msg = Message::new(
            "n1",
            "n2",
            serde_json::json!({
                "type": "append_entries",
                "msg_id": 1,
                "term": 5,
                "leader_id": "n1",
                "prev_log_index": 0,
                "prev_log_term": 0,
                "entries": [],
                "leader_commit": 0,
            }),
        );
        let result = handle_append_entries(node.clone(), msg).await.unwrap().unwrap();
        assert_eq!(result["success"], true);

        let state = node.state.lock().await;
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.leader_id.as_deref(), Some("n1"));

        // A late vote response for the same term must no longer be able to
        // carry this node to `become_leader` (election safety, spec §8).
        assert!(state.votes.is_empty());
    }

    #[test]
    fn single_node_cluster_commits_immediately() {
        let config = Config::default();
        let mut state = RaftState::new("n1".into(), vec!["n1".into()], &config);
        state.role = Role::Leader;
        state.log.append(vec![Entry {
            term: 1,
            op: None,
            msg: None,
        }]);
        let mut matches = vec![state.log.size()];
        let majority = state.majority();
        assert_eq!(majority, 1);
        let n = majority_match_index(&mut matches, majority);
        assert_eq!(n, 1);
    }
}
