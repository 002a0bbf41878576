//! The error taxonomy used across the node: wire-level RPC errors that travel
//! back to Maelstrom clients and peers, plus the internal result alias used by
//! the Raft/runtime plumbing.

use serde::Deserializer;
use serde::Serializer;
use serde_json::Value;

/// The Maelstrom error codes this node ever produces.
///
/// Values are the ones fixed by the Maelstrom protocol (spec §4.5); we only
/// ever emit the subset the node's own logic can reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Timeout = 0,
    NodeNotFound = 1,
    NotSupported = 10,
    TemporarilyUnavailable = 11,
    MalformedRequest = 12,
    Crash = 13,
    Abort = 14,
    KeyDoesNotExist = 20,
    KeyAlreadyExists = 21,
    PreconditionFailed = 22,
    TxnConflict = 30,
}

impl ErrorCode {
    /// True for codes the spec (GLOSSARY) classifies as definite: the
    /// operation did not and will never happen.
    pub fn is_definite(self) -> bool {
        !matches!(self, ErrorCode::Timeout | ErrorCode::Crash)
    }
}

// serde_json represents Maelstrom error codes as bare integers on the wire;
// implement (de)serialization by hand rather than pulling in serde_repr for
// a single enum.
impl serde::Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(*self as u32)
    }
}

impl<'de> serde::Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        Ok(match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxnConflict,
            other => {
                return Err(serde::de::Error::custom(format!("unknown maelstrom error code {}", other)))
            }
        })
    }
}

/// A wire-level error reply body: `{type: "error", code, text, in_reply_to}`.
///
/// `in_reply_to` is stamped on by `Runtime::reply`, not stored here.
#[derive(Clone, Debug, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("rpc error {code:?}: {text}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub text: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn not_supported(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, text)
    }

    pub fn temporarily_unavailable(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::TemporarilyUnavailable, text)
    }

    pub fn key_does_not_exist(key: i64) -> Self {
        Self::new(ErrorCode::KeyDoesNotExist, format!("key {} does not exist", key))
    }

    pub fn precondition_failed(expected: i64, actual: i64) -> Self {
        Self::new(
            ErrorCode::PreconditionFailed,
            format!("expected {}, but had {}", expected, actual),
        )
    }

    /// Map an arbitrary handler error to the wire error Maelstrom expects for
    /// a generic crash (spec §4.2 rule 4, §7.ii).
    pub fn crash(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::Crash, err.to_string())
    }

    /// Render this error as the JSON body Maelstrom expects for an error reply.
    pub fn to_body(&self) -> Value {
        serde_json::json!({
            "type": "error",
            "code": self.code,
            "text": self.text,
        })
    }
}

/// Result alias used by handlers.
///
/// `Ok(Some(body))` is the reply body to auto-send; `Ok(None)` means the
/// handler has already replied itself, or deliberately defers the reply (the
/// leader accepting a client write defers until the entry is applied, per
/// spec §4.5); `Err` is the RPC error to report instead.
pub type HandlerResult = Result<Option<Value>, RpcError>;

/// Internal result alias for plumbing that can fail for structural reasons
/// (never exposed on the wire -- these are programming/framing bugs per
/// spec §7.iii and abort the process).
pub type RaftResult<T> = anyhow::Result<T>;
