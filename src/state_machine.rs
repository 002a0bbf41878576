//! The integer-keyed register store (spec §4.4).
//!
//! `apply` is the only mutator, and it is only ever called by the Raft node's
//! single apply-loop, in strict log order (spec §3, §4.4).

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;

/// A client operation, parsed from a Maelstrom `read`/`write`/`cas` request
/// body (spec §4.4, §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Read { key: i64 },
    Write { key: i64, value: i64 },
    Cas { key: i64, from: i64, to: i64 },
}

/// An in-memory map from integer key to integer value.
#[derive(Clone, Debug, Default)]
pub struct StateMachine {
    values: HashMap<i64, i64>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `op`, producing the reply body Maelstrom expects (spec §4.4).
    ///
    /// This is the only mutator of the state machine's internal map.
    pub fn apply(&mut self, op: &Operation) -> Result<Value, RpcError> {
        match *op {
            Operation::Read { key } => match self.values.get(&key) {
                Some(&value) => Ok(serde_json::json!({"type": "read_ok", "value": value})),
                None => Err(RpcError::key_does_not_exist(key)),
            },
            Operation::Write { key, value } => {
                self.values.insert(key, value);
                Ok(serde_json::json!({"type": "write_ok"}))
            }
            Operation::Cas { key, from, to } => match self.values.get(&key) {
                None => Err(RpcError::key_does_not_exist(key)),
                Some(&actual) if actual != from => Err(RpcError::precondition_failed(from, actual)),
                Some(_) => {
                    self.values.insert(key, to);
                    Ok(serde_json::json!({"type": "cas_ok"}))
                }
            },
        }
    }
}
