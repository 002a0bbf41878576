//! The envelope type Transport and Runtime exchange.
//!
//! A `Message` is `{src, dest, body}` where `body` stays a free-form JSON
//! value (spec §3): the Runtime dispatches on `body.type` without needing to
//! know, at compile time, every workload a node might ever be asked to
//! speak.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: Value,
}

impl Message {
    pub fn new(src: impl Into<String>, dest: impl Into<String>, body: Value) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// `body.type`, or `""` if absent/non-string -- malformed bodies are a
    /// framing bug the caller is expected to have already rejected.
    pub fn kind(&self) -> &str {
        self.body.get("type").and_then(Value::as_str).unwrap_or("")
    }

    pub fn msg_id(&self) -> Option<u64> {
        self.body.get("msg_id").and_then(Value::as_u64)
    }

    pub fn in_reply_to(&self) -> Option<u64> {
        self.body.get("in_reply_to").and_then(Value::as_u64)
    }

    /// Parse `body` into a type-specific payload, at the boundary between the
    /// opaque transport and a concrete handler (spec §9's callback-identity
    /// note: handlers own typed parsing, the Runtime never does).
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_src_dest_body_object() {
        let msg = Message::new("n1", "c1", serde_json::json!({"type": "init_ok", "in_reply_to": 1}));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["src"], "n1");
        assert_eq!(decoded["dest"], "c1");
        assert_eq!(decoded["body"]["type"], "init_ok");
    }

    #[test]
    fn round_trip_preserves_envelope() {
        let msg = Message::new("c2", "n1", serde_json::json!({"type": "write", "msg_id": 5, "key": 7, "value": 42}));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.src, msg.src);
        assert_eq!(decoded.dest, msg.dest);
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn kind_msg_id_and_in_reply_to_accessors() {
        let msg = Message::new("n2", "n1", serde_json::json!({"type": "append_entries_res", "in_reply_to": 9}));
        assert_eq!(msg.kind(), "append_entries_res");
        assert_eq!(msg.in_reply_to(), Some(9));
        assert_eq!(msg.msg_id(), None);
    }
}
