//! Client-facing request handling: `read`/`write`/`cas` (spec §4.4, §4.5
//! "Client request handling") and application of committed entries to the
//! state machine.

use std::sync::Arc;

use serde_json::Value;

use crate::error::HandlerResult;
use crate::error::RpcError;
use crate::log::Entry;
use crate::message::Message;
use crate::raft::RaftNode;
use crate::raft::RaftState;
use crate::raft::Role;
use crate::state_machine::Operation;

/// Apply every committed-but-unapplied entry to the state machine, in order,
/// returning the `(client_message, reply_body)` pairs for entries that
/// originated on this node (spec §4.5 "Applying entries").
///
/// Called with `state` already locked; never performs I/O itself, since the
/// lock must not be held across an `await` (spec §5).
pub fn apply_committed(state: &mut RaftState) -> Vec<(Message, Value)> {
    let mut to_reply = Vec::new();
    while state.last_applied < state.commit_index {
        state.last_applied += 1;
        let index = state.last_applied;
        let entry = state.log.get(index).clone();
        let Some(op) = entry.op.as_ref() else {
            continue;
        };
        let result = state.sm.apply(op);
        if let Some(msg) = entry.msg {
            let body = match result {
                Ok(body) => body,
                Err(err) => err.to_body(),
            };
            to_reply.push((msg, body));
        }
    }
    to_reply
}

/// Handler for inbound `read`/`write`/`cas` (spec §4.5 "Client request
/// handling").
pub async fn handle_client_request(node: Arc<RaftNode>, msg: Message) -> HandlerResult {
    let op: Operation = msg.parse().map_err(RpcError::crash)?;

    let mut state = node.state.lock().await;
    match state.role {
        Role::Leader => {
            let entry = Entry::new(state.current_term, op, msg.clone());
            state.log.append(vec![entry]);
            drop(state);
            crate::raft::replication::replicate_cycle(node).await;
            // The reply is sent later, from `apply_committed`, once this
            // entry is actually committed and applied.
            Ok(None)
        }
        Role::Follower | Role::Candidate => {
            let redirect = state.leader_id.clone();
            drop(state);
            match redirect {
                // Forward the raw request to the presumed leader, rewriting
                // only `dest` (spec §4.5 "Client request handling", §9
                // "Forwarding"). The leader's eventual reply travels straight
                // back to the client, whose id is still `msg.src`, so this
                // node never replies to `msg` itself.
                Some(leader) => {
                    if let Err(err) = node.runtime.forward(&leader, &msg).await {
                        tracing::error!(leader = %leader, error = %err, "failed to forward client request");
                    }
                    Ok(None)
                }
                None => Err(RpcError::temporarily_unavailable("not a leader")),
            }
        }
    }
}
