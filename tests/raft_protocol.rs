//! Multi-module protocol scenarios exercised through the crate's public
//! surface: vote granting across a term boundary, a follower catching up
//! via `append_entries`, and single-node commit-and-apply.
//!
//! These don't drive real stdio (the binary's `Transport` is tied to the
//! process's actual stdin/stdout, so a same-process multi-node harness
//! would need a pluggable transport this system doesn't have); instead
//! they call the handler functions directly with hand-built messages,
//! the way the colocated unit tests do, but across the `raft::{election,
//! replication, client}` boundary together rather than one module at a time.

use std::sync::Arc;

use maelstrom_raft_kv::config::Config;
use maelstrom_raft_kv::message::Message;
use maelstrom_raft_kv::raft::election::handle_vote_request;
use maelstrom_raft_kv::raft::replication::handle_append_entries;
use maelstrom_raft_kv::raft::RaftNode;
use maelstrom_raft_kv::raft::Role;
use maelstrom_raft_kv::runtime::Runtime;
use maelstrom_raft_kv::transport::Transport;

fn node(id: &str, peers: &[&str]) -> Arc<RaftNode> {
    let runtime = Runtime::new(Transport::new());
    let config = Arc::new(Config::default());
    RaftNode::new(
        runtime,
        config,
        id.to_string(),
        peers.iter().map(|p| p.to_string()).collect(),
    )
}

fn vote_request(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> Message {
    Message::new(
        candidate,
        "n1",
        serde_json::json!({
            "type": "request_vote",
            "msg_id": 1,
            "term": term,
            "candidate_id": candidate,
            "last_log_index": last_log_index,
            "last_log_term": last_log_term,
        }),
    )
}

#[tokio::test]
async fn grants_vote_to_a_candidate_with_an_up_to_date_log() {
    let n1 = node("n1", &["n1", "n2", "n3"]);
    let result = handle_vote_request(n1, vote_request(1, "n2", 0, 0)).await.unwrap();
    let body = result.unwrap();
    assert_eq!(body["vote_granted"], true);
    assert_eq!(body["term"], 1);
}

#[tokio::test]
async fn refuses_a_second_vote_in_the_same_term() {
    let n1 = node("n1", &["n1", "n2", "n3"]);
    let first = handle_vote_request(n1.clone(), vote_request(1, "n2", 0, 0)).await.unwrap().unwrap();
    assert_eq!(first["vote_granted"], true);

    let second = handle_vote_request(n1, vote_request(1, "n3", 0, 0)).await.unwrap().unwrap();
    assert_eq!(second["vote_granted"], false);
}

#[tokio::test]
async fn refuses_a_vote_for_a_stale_term() {
    let n1 = node("n1", &["n1", "n2", "n3"]);
    // Bump n1's term first via a higher-term vote request from some other candidate.
    let bump = handle_vote_request(n1.clone(), vote_request(5, "n3", 0, 0)).await.unwrap().unwrap();
    assert_eq!(bump["term"], 5);

    let stale = handle_vote_request(n1, vote_request(2, "n2", 0, 0)).await.unwrap().unwrap();
    assert_eq!(stale["vote_granted"], false);
    assert_eq!(stale["term"], 5);
}

fn append_entries(term: u64, leader: &str, prev_index: i64, prev_term: u64, entries: serde_json::Value, leader_commit: u64) -> Message {
    Message::new(
        leader,
        "n2",
        serde_json::json!({
            "type": "append_entries",
            "msg_id": 1,
            "term": term,
            "leader_id": leader,
            "prev_log_index": prev_index,
            "prev_log_term": prev_term,
            "entries": entries,
            "leader_commit": leader_commit,
        }),
    )
}

#[tokio::test]
async fn follower_accepts_the_first_heartbeat_at_the_sentinel() {
    let n2 = node("n2", &["n1", "n2", "n3"]);
    let result = handle_append_entries(n2, append_entries(1, "n1", 0, 0, serde_json::json!([]), 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["term"], 1);
}

#[tokio::test]
async fn follower_appends_entries_and_applies_up_to_leader_commit() {
    let n2 = node("n2", &["n1", "n2", "n3"]);
    let entries = serde_json::json!([
        {"term": 1, "op": {"type": "write", "key": 1, "value": 10}},
    ]);
    let result = handle_append_entries(n2, append_entries(1, "n1", 0, 0, entries, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["success"], true);
}

#[tokio::test]
async fn follower_rejects_append_entries_with_mismatched_prev_term() {
    let n2 = node("n2", &["n1", "n2", "n3"]);
    let entries = serde_json::json!([{"term": 1, "op": {"type": "write", "key": 1, "value": 10}}]);
    let first = handle_append_entries(n2.clone(), append_entries(1, "n1", 0, 0, entries, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["success"], true);

    // Leader claims the entry at index 1 has term 2, but we stored term 1.
    let conflicting = handle_append_entries(n2, append_entries(1, "n1", 1, 2, serde_json::json!([]), 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conflicting["success"], false);
}

#[tokio::test]
async fn follower_rejects_a_stale_leader_term() {
    let n2 = node("n2", &["n1", "n2", "n3"]);
    let bump = handle_append_entries(n2.clone(), append_entries(5, "n1", 0, 0, serde_json::json!([]), 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bump["term"], 5);

    let stale = handle_append_entries(n2, append_entries(2, "n3", 0, 0, serde_json::json!([]), 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale["success"], false);
    assert_eq!(stale["term"], 5);
}

#[tokio::test]
async fn single_node_cluster_becomes_leader_immediately() {
    let n1 = node("n1", &["n1"]);
    let metrics = n1.metrics().await;
    assert_eq!(metrics.role, Role::Leader);
    assert_eq!(metrics.current_term, 1);
}

#[tokio::test]
async fn single_node_cluster_commits_and_applies_a_write() {
    let n1 = node("n1", &["n1"]);
    let write = Message::new(
        "c1",
        "n1",
        serde_json::json!({"type": "write", "msg_id": 1, "key": 7, "value": 42}),
    );
    let result = maelstrom_raft_kv::raft::client::handle_client_request(n1.clone(), write).await.unwrap();
    // A leader defers the reply until the entry commits and applies.
    assert!(result.is_none());

    maelstrom_raft_kv::raft::replication::replicate_cycle(n1.clone()).await;

    let metrics = n1.metrics().await;
    assert_eq!(metrics.commit_index, 1);
    assert_eq!(metrics.last_applied, 1);
}
