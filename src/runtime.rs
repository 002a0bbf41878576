//! The message-routing and RPC layer (spec §4.2).
//!
//! `Runtime` owns node identity, outbound `msg_id` allocation, the handler
//! table and the RPC callback table, and multiplexes a single Transport
//! between typed request handlers and asynchronous RPC callbacks -- the
//! role `async-raft`'s `RaftCore` plays for its `rx_api` channel, except
//! here the "API" is the wire itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::HandlerResult;
use crate::error::RpcError;
use crate::message::Message;
use crate::transport::Transport;

pub type Handler = Arc<dyn Fn(Arc<Runtime>, Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type Callback = Box<dyn FnOnce(Message) -> BoxFuture<'static, ()> + Send>;

/// Failure modes of `Runtime::sync_rpc`.
#[derive(Debug, thiserror::Error)]
pub enum SyncRpcError {
    #[error("failed to send rpc: {0}")]
    Send(#[source] anyhow::Error),
    #[error("rpc cancelled")]
    Cancelled,
    #[error("rpc timed out")]
    Timeout,
    #[error("malformed rpc reply: {0}")]
    Decode(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct Runtime {
    transport: Arc<Transport>,
    node_id: StdMutex<Option<String>>,
    node_ids: StdMutex<Option<Vec<String>>>,
    next_msg_id: AtomicU64,
    handlers: StdMutex<HashMap<String, Handler>>,
    init_handler: StdMutex<Option<Handler>>,
    callbacks: StdMutex<HashMap<u64, Callback>>,
    /// Upgrades a missing-handler fault to a fatal error, for diagnostic
    /// harnesses (spec §4.2: "the surrounding test mode may upgrade this to
    /// a fatal error").
    strict: AtomicBool,
}

impl Runtime {
    pub fn new(transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            transport: Arc::new(transport),
            node_id: StdMutex::new(None),
            node_ids: StdMutex::new(None),
            next_msg_id: AtomicU64::new(0),
            handlers: StdMutex::new(HashMap::new()),
            init_handler: StdMutex::new(None),
            callbacks: StdMutex::new(HashMap::new()),
            strict: AtomicBool::new(false),
        })
    }

    pub fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::Relaxed);
    }

    /// This node's own id. Valid only after `init` (spec §4.2).
    pub fn id(&self) -> String {
        self.node_id.lock().unwrap().clone().expect("Runtime::id() called before init")
    }

    /// The full cluster member list, in the order given at `init`, including
    /// this node's own id. Valid only after `init`.
    pub fn peers(&self) -> Vec<String> {
        self.node_ids.lock().unwrap().clone().expect("Runtime::peers() called before init")
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a handler for a message type.
    ///
    /// Registering the same type twice is a programming error and aborts the
    /// process (spec §4.2).
    pub fn handle<F, Fut>(&self, typ: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Runtime>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let typ = typ.into();
        let boxed: Handler = Arc::new(move |rt, msg| Box::pin(handler(rt, msg)));
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&typ) {
            tracing::error!(typ = %typ, "duplicate handler registration, this is a programming error");
            std::process::exit(1);
        }
        handlers.insert(typ, boxed);
    }

    /// Register a handler invoked once, synchronously with respect to the
    /// automatic `init_ok` reply, when `init` arrives.
    pub fn on_init<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Runtime>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |rt, msg| Box::pin(handler(rt, msg)));
        *self.init_handler.lock().unwrap() = Some(boxed);
    }

    /// Stamp `src`/`dest` and emit `body` unchanged.
    pub async fn send(&self, dest: &str, body: Value) -> anyhow::Result<()> {
        let msg = Message::new(self.id(), dest, body);
        self.transport.send(&msg).await
    }

    /// Proxy `original` to `dest`, rewriting only the destination (spec §4.5
    /// "Client request handling", §9 "Forwarding"). Unlike `send`, `src` is
    /// left as `original.src` rather than stamped with our own id, so the
    /// eventual reply from `dest` routes directly back to the original
    /// sender instead of bouncing through us.
    pub async fn forward(&self, dest: &str, original: &Message) -> anyhow::Result<()> {
        let msg = Message::new(original.src.clone(), dest, original.body.clone());
        self.transport.send(&msg).await
    }

    /// Reply to `request`, setting `in_reply_to` and routing back to its source.
    pub async fn reply(&self, request: &Message, mut body: Value) -> anyhow::Result<()> {
        if let Some(id) = request.msg_id() {
            body["in_reply_to"] = serde_json::json!(id);
        }
        self.send(&request.src, body).await
    }

    /// Send an RPC, invoking `callback` on the matching reply.
    pub async fn rpc(&self, dest: &str, mut body: Value, callback: Callback) -> anyhow::Result<()> {
        let msg_id = self.next_msg_id();
        body["msg_id"] = serde_json::json!(msg_id);
        self.callbacks.lock().unwrap().insert(msg_id, callback);
        self.send(dest, body).await
    }

    fn cancel_pending(&self, msg_id: u64) {
        self.callbacks.lock().unwrap().remove(&msg_id);
    }

    /// Fire-and-wait RPC: suspends until a matching reply arrives, `cancel`
    /// fires, or `timeout` elapses.
    pub async fn sync_rpc(
        &self,
        dest: &str,
        body: Value,
        cancel: oneshot::Receiver<()>,
        timeout: Option<Duration>,
    ) -> Result<Message, SyncRpcError> {
        let (tx, rx) = oneshot::channel();
        let mut body = body;
        let msg_id = self.next_msg_id();
        body["msg_id"] = serde_json::json!(msg_id);
        self.callbacks.lock().unwrap().insert(
            msg_id,
            Box::new(move |msg| {
                let _ = tx.send(msg);
                Box::pin(async {})
            }),
        );
        self.send(dest, body).await.map_err(SyncRpcError::Send)?;

        let wait = async move {
            tokio::select! {
                res = rx => res.map_err(|_| SyncRpcError::Cancelled),
                _ = cancel => Err(SyncRpcError::Cancelled),
            }
        };

        let msg = match timeout {
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(res) => res,
                Err(_) => {
                    self.cancel_pending(msg_id);
                    Err(SyncRpcError::Timeout)
                }
            },
            None => wait.await,
        }?;

        if msg.kind() == "error" {
            let err: RpcError = msg.parse().map_err(|e| SyncRpcError::Decode(e.to_string()))?;
            return Err(SyncRpcError::Rpc(err));
        }
        Ok(msg)
    }

    /// Send a copy of `body` to every peer other than self, sequentially, in
    /// cluster-list order.
    pub async fn broadcast(&self, body: Value) -> anyhow::Result<()> {
        let self_id = self.id();
        for peer in self.peers() {
            if peer != self_id {
                self.send(&peer, body.clone()).await?;
            }
        }
        Ok(())
    }

    /// RPC variant of `broadcast`: each peer gets a distinct `msg_id` and its
    /// own callback, built from `make_callback(peer_id)`.
    pub async fn broadcast_rpc<F>(&self, body: Value, mut make_callback: F) -> anyhow::Result<()>
    where
        F: FnMut(String) -> Callback,
    {
        let self_id = self.id();
        for peer in self.peers() {
            if peer == self_id {
                continue;
            }
            let callback = make_callback(peer.clone());
            self.rpc(&peer, body.clone(), callback).await?;
        }
        Ok(())
    }

    /// The main dispatch loop. Returns when stdin closes; returns an error on
    /// an unrecoverable decode failure.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let msg = match self.transport.recv().await? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            let this = self.clone();
            tokio::spawn(async move { this.dispatch(msg).await });
        }
    }

    async fn dispatch(self: Arc<Self>, msg: Message) {
        if let Some(id) = msg.in_reply_to() {
            let callback = self.callbacks.lock().unwrap().remove(&id);
            match callback {
                Some(callback) => callback(msg).await,
                None => tracing::trace!(in_reply_to = id, "dropping reply with no pending callback"),
            }
            return;
        }

        if msg.kind() == "init" {
            self.handle_init(msg).await;
            return;
        }

        let handler = self.handlers.lock().unwrap().get(msg.kind()).cloned();
        match handler {
            Some(handler) => {
                let result = handler(self.clone(), msg.clone()).await;
                self.reply_with_result(&msg, result).await;
            }
            None => {
                if msg.msg_id().is_some() {
                    let err = RpcError::not_supported(format!("no handler for message type {:?}", msg.kind()));
                    let _ = self.reply(&msg, err.to_body()).await;
                } else {
                    tracing::warn!(kind = %msg.kind(), "dropping message with no handler and no msg_id");
                }
                if self.strict.load(Ordering::Relaxed) {
                    tracing::error!(kind = %msg.kind(), "strict mode: missing handler is fatal");
                    std::process::exit(1);
                }
            }
        }
    }

    async fn reply_with_result(&self, msg: &Message, result: HandlerResult) {
        match result {
            Ok(Some(body)) => {
                if msg.msg_id().is_some() {
                    if let Err(err) = self.reply(msg, body).await {
                        tracing::error!(error = %err, "failed to send reply");
                    }
                }
            }
            Ok(None) => {}
            Err(rpc_err) => {
                if msg.msg_id().is_some() {
                    let _ = self.reply(msg, rpc_err.to_body()).await;
                } else {
                    tracing::error!(error = %rpc_err, "handler error on message with no msg_id");
                }
            }
        }
    }

    async fn handle_init(self: Arc<Self>, msg: Message) {
        #[derive(Deserialize)]
        struct InitBody {
            node_id: String,
            node_ids: Vec<String>,
        }
        let body: InitBody = match msg.parse() {
            Ok(b) => b,
            Err(err) => {
                tracing::error!(error = %err, "malformed init message");
                std::process::exit(1);
            }
        };
        *self.node_id.lock().unwrap() = Some(body.node_id.clone());
        *self.node_ids.lock().unwrap() = Some(body.node_ids.clone());
        tracing::info!(id = %body.node_id, peers = ?body.node_ids, "node initialized");

        let init_handler = self.init_handler.lock().unwrap().clone();
        if let Some(handler) = init_handler {
            if let Err(err) = handler(self.clone(), msg.clone()).await {
                tracing::error!(error = %err, "init handler failed");
            }
        }

        let _ = self.reply(&msg, serde_json::json!({"type": "init_ok"})).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_msg_id_is_strictly_increasing_and_starts_at_one() {
        let rt = Runtime::new(Transport::new());
        assert_eq!(rt.next_msg_id(), 1);
        assert_eq!(rt.next_msg_id(), 2);
        assert_eq!(rt.next_msg_id(), 3);
    }
}
