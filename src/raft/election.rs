//! Leader election: vote granting and candidate-side vote collection
//! (spec §4.5 "Vote granting", "Becoming candidate").

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::HandlerResult;
use crate::error::RpcError;
use crate::message::Message;
use crate::raft::replication;
use crate::raft::RaftNode;
use crate::raft::Role;

#[derive(Deserialize)]
struct VoteRequestBody {
    term: u64,
    candidate_id: String,
    last_log_index: u64,
    last_log_term: u64,
}

#[derive(Deserialize)]
struct VoteResponseBody {
    term: u64,
    vote_granted: bool,
}

/// Handler for inbound `request_vote` (spec §4.5 "Vote granting").
pub async fn handle_vote_request(node: Arc<RaftNode>, msg: Message) -> HandlerResult {
    let body: VoteRequestBody = msg.parse().map_err(RpcError::crash)?;

    let mut state = node.state.lock().await;
    state.maybe_step_down(&node.config, body.term);

    let log_ok = body.last_log_term > state.log.last_term()
        || (body.last_log_term == state.log.last_term() && body.last_log_index >= state.log.size());

    let vote_ok = state.voted_for.is_none() || state.voted_for.as_deref() == Some(body.candidate_id.as_str());
    let grant = body.term >= state.current_term && vote_ok && log_ok;

    if grant {
        state.voted_for = Some(body.candidate_id.clone());
        state.reset_election_deadline(&node.config);
    }

    tracing::debug!(
        candidate = %body.candidate_id,
        term = body.term,
        granted = grant,
        "request_vote"
    );

    Ok(Some(serde_json::json!({
        "type": "request_vote_res",
        "term": state.current_term,
        "vote_granted": grant,
    })))
}

/// Become a candidate and broadcast `request_vote` to every peer (spec §4.5
/// "Becoming candidate").
pub async fn start_election(node: Arc<RaftNode>) {
    let (term, body, became_leader) = {
        let mut state = node.state.lock().await;
        state.become_candidate(&node.config);
        // Single-node cluster: the self-vote already is a majority, so there
        // is no peer left to wait a response from.
        let became_leader = state.votes.len() >= state.majority();
        if became_leader {
            state.become_leader(&node.config);
        }
        let body = serde_json::json!({
            "type": "request_vote",
            "term": state.current_term,
            "candidate_id": state.id,
            "last_log_index": state.log.size(),
            "last_log_term": state.log.last_term(),
        });
        (state.current_term, body, became_leader)
    };

    if became_leader {
        tracing::info!(term, "became leader (single-node cluster)");
        replication::on_become_leader(node).await;
        return;
    }

    tracing::info!(term, "became candidate, requesting votes");

    let result = node
        .runtime
        .broadcast_rpc(body, {
            let node = node.clone();
            move |peer| {
                let node = node.clone();
                Box::new(move |msg: Message| {
                    let node = node.clone();
                    let peer = peer.clone();
                    Box::pin(async move { handle_vote_response(node, term, peer, msg).await }) as BoxFuture<'static, ()>
                })
            }
        })
        .await;

    if let Err(err) = result {
        tracing::error!(error = %err, "failed to broadcast request_vote");
    }
}

async fn handle_vote_response(node: Arc<RaftNode>, term: u64, peer: String, msg: Message) {
    let body: VoteResponseBody = match msg.parse() {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(error = %err, "malformed request_vote_res, dropping");
            return;
        }
    };

    let became_leader = {
        let mut state = node.state.lock().await;
        state.reset_step_down_deadline(&node.config);

        if state.maybe_step_down(&node.config, body.term) {
            false
        } else if state.role == Role::Candidate && state.current_term == term && body.vote_granted {
            state.votes.insert(peer);
            if state.votes.len() >= state.majority() {
                state.become_leader(&node.config);
                true
            } else {
                false
            }
        } else {
            false
        }
    };

    if became_leader {
        tracing::info!(term, "became leader");
        replication::on_become_leader(node).await;
    }
}
