//! A Raft-replicated, linearizable integer key-value register speaking
//! Maelstrom's newline-delimited JSON protocol over stdin/stdout (spec §1).
//!
//! The binary (`src/main.rs`) just wires these pieces together; they live in
//! a library target so integration tests can drive a small in-process
//! cluster without going through stdio.

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod raft;
pub mod runtime;
pub mod state_machine;
pub mod transport;
