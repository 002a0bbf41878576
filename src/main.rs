//! Entry point: wires up the transport, the runtime, the Raft node and its
//! timers, registers handlers for every message type this node speaks, and
//! runs the dispatch loop to completion (spec §1, §4).

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use maelstrom_raft_kv::config::Config;
use maelstrom_raft_kv::raft;
use maelstrom_raft_kv::raft::RaftNode;
use maelstrom_raft_kv::runtime::Runtime;
use maelstrom_raft_kv::transport::Transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Maelstrom reads node stdout as protocol traffic, so diagnostic logging
    // goes to stderr (spec §4 Logging).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = Runtime::new(Transport::new());
    let config = Arc::new(Config::default());

    let node_handle: Arc<std::sync::OnceLock<Arc<RaftNode>>> = Arc::new(std::sync::OnceLock::new());

    {
        let runtime_for_init = runtime.clone();
        let config_for_init = config.clone();
        let node_handle = node_handle.clone();
        runtime.on_init(move |rt, _msg| {
            let runtime_for_init = runtime_for_init.clone();
            let config_for_init = config_for_init.clone();
            let node_handle = node_handle.clone();
            async move {
                let id = rt.id();
                let peers = rt.peers();
                tracing::info!(id = %id, peers = ?peers, "starting raft node");
                let node = RaftNode::new(runtime_for_init.clone(), config_for_init.clone(), id, peers);

                raft::timers::spawn_election_timer(node.clone());
                raft::timers::spawn_step_down_timer(node.clone());
                raft::timers::spawn_replication_timer(node.clone());

                let _ = node_handle.set(node);
                Ok(None)
            }
        });
    }

    macro_rules! register {
        ($typ:expr, $handler:path) => {{
            let node_handle = node_handle.clone();
            runtime.handle($typ, move |_rt, msg| {
                let node_handle = node_handle.clone();
                async move {
                    let node = node_handle
                        .get()
                        .cloned()
                        .expect("message received before init completed");
                    $handler(node, msg).await
                }
            });
        }};
    }

    register!("request_vote", raft::election::handle_vote_request);
    register!("append_entries", raft::replication::handle_append_entries);
    register!("read", raft::client::handle_client_request);
    register!("write", raft::client::handle_client_request);
    register!("cas", raft::client::handle_client_request);

    runtime.run().await
}
