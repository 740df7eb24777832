//! Wire envelope for the request/reply protocol
//!
//! ```text
//! { "protocolId": "...", "correlationId": "...", "action": "request",  "payload": <any> }
//! { "protocolId": "...", "correlationId": "...", "action": "response", "payload":
//!     { "type": "result", "result": <any> }
//!   | { "type": "error", "error": <any>, "isErrorObject": true } }
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Fault, PoolError};

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    /// Channel identity; messages for other protocols are ignored
    pub protocol_id: String,

    /// Pairs a request with its response
    pub correlation_id: String,

    /// Request or response body
    #[serde(flatten)]
    pub body: RpcBody,
}

/// Envelope body, discriminated by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RpcBody {
    Request { payload: Value },
    Response { payload: RpcOutcome },
}

/// Outcome of a remote handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcOutcome {
    Result {
        result: Value,
    },
    Error {
        error: Value,
        #[serde(
            rename = "isErrorObject",
            default,
            skip_serializing_if = "std::ops::Not::not"
        )]
        is_error_object: bool,
    },
}

impl RpcEnvelope {
    /// Build a request envelope
    pub fn request(protocol_id: &str, correlation_id: String, payload: Value) -> Self {
        Self {
            protocol_id: protocol_id.to_string(),
            correlation_id,
            body: RpcBody::Request { payload },
        }
    }

    /// Build a response envelope
    pub fn response(protocol_id: &str, correlation_id: String, outcome: RpcOutcome) -> Self {
        Self {
            protocol_id: protocol_id.to_string(),
            correlation_id,
            body: RpcBody::Response { payload: outcome },
        }
    }
}

impl RpcOutcome {
    /// Wrap a handler result for the wire
    ///
    /// Thrown values travel verbatim; everything else is sent as an error
    /// object with message and stack text.
    pub fn from_result(result: Result<Value, PoolError>) -> Self {
        match result {
            Ok(result) => RpcOutcome::Result { result },
            Err(err) => match err.to_fault() {
                Fault::Value { value } => RpcOutcome::Error {
                    error: value,
                    is_error_object: false,
                },
                Fault::Error { message, stack } => RpcOutcome::Error {
                    error: json!({ "message": message, "stack": stack }),
                    is_error_object: true,
                },
            },
        }
    }

    /// Reconstruct the handler result on the requesting side
    pub fn into_result(self) -> Result<Value, PoolError> {
        match self {
            RpcOutcome::Result { result } => Ok(result),
            RpcOutcome::Error {
                error,
                is_error_object: false,
            } => Err(PoolError::thrown(error)),
            RpcOutcome::Error {
                error,
                is_error_object: true,
            } => Err(PoolError::Task(error_object_to_fault(error))),
        }
    }
}

fn error_object_to_fault(error: Value) -> Fault {
    match error {
        Value::String(message) => Fault::error(message),
        Value::Object(mut fields) => {
            let message = match fields.remove("message") {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let stack = match fields.remove("stack") {
                Some(Value::String(stack)) => Some(stack),
                _ => None,
            };
            Fault::Error { message, stack }
        }
        other => Fault::error(other.to_string()),
    }
}

/// Correlation id allocator owned by one channel
///
/// Ids look like `"{protocol_id}:{n}"` with `n` wrapping back to 1 after
/// `wrap_at`. Ids that are still pending or were abandoned by a timeout
/// are never handed out, so a late reply can never land on a newer
/// request. An abandoned id comes back only once its late reply arrives.
#[derive(Debug, Clone)]
pub struct CorrelationSequence {
    last: u64,
    wrap_at: u64,
    abandoned: HashSet<String>,
}

/// Default wrap point, matching the id range the protocol has always used
pub const DEFAULT_CORRELATION_WRAP: u64 = 1000;

impl Default for CorrelationSequence {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_WRAP)
    }
}

impl CorrelationSequence {
    /// Create a sequence wrapping after `wrap_at`
    pub fn new(wrap_at: u64) -> Self {
        Self::starting_at(0, wrap_at)
    }

    /// Create a sequence that continues after `last`
    pub fn starting_at(last: u64, wrap_at: u64) -> Self {
        let wrap_at = wrap_at.max(1);
        Self {
            last: last.min(wrap_at),
            wrap_at,
            abandoned: HashSet::new(),
        }
    }

    /// Allocate the next id that is neither rejected by `in_use` nor abandoned
    ///
    /// Returns `None` when every id in the range is taken.
    pub fn next_id(&mut self, protocol_id: &str, in_use: impl Fn(&str) -> bool) -> Option<String> {
        for _ in 0..self.wrap_at {
            self.last = if self.last >= self.wrap_at { 1 } else { self.last + 1 };
            let id = format!("{}:{}", protocol_id, self.last);
            if !in_use(&id) && !self.abandoned.contains(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Hold back an id whose request gave up waiting
    pub fn abandon(&mut self, id: String) {
        self.abandoned.insert(id);
    }

    /// Consume a late reply for an abandoned id
    ///
    /// Returns true when the id was abandoned (and the reply must be dropped).
    /// The id is free for reuse afterwards.
    pub fn take_abandoned(&mut self, id: &str) -> bool {
        self.abandoned.remove(id)
    }

    /// Number of ids currently held back
    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let envelope = RpcEnvelope::request("proto", "proto:1".into(), json!({"action": "start"}));
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            wire,
            json!({
                "protocolId": "proto",
                "correlationId": "proto:1",
                "action": "request",
                "payload": {"action": "start"}
            })
        );
        let parsed: RpcEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_error_response_wire_shape() {
        let envelope = RpcEnvelope::response(
            "proto",
            "proto:7".into(),
            RpcOutcome::from_result(Err(PoolError::task("boom"))),
        );
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["action"], "response");
        assert_eq!(wire["payload"]["type"], "error");
        assert_eq!(wire["payload"]["isErrorObject"], true);
        assert_eq!(wire["payload"]["error"]["message"], "boom");
    }

    #[test]
    fn test_thrown_value_omits_error_object_marker() {
        let outcome = RpcOutcome::from_result(Err(PoolError::thrown(json!({"code": 42}))));
        let wire = serde_json::to_value(&outcome).unwrap();

        assert_eq!(wire, json!({"type": "error", "error": {"code": 42}}));
        match outcome.into_result() {
            Err(PoolError::Task(Fault::Value { value })) => assert_eq!(value, json!({"code": 42})),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_error_object_reconstructs_message_and_stack() {
        let outcome = RpcOutcome::Error {
            error: json!({"message": "bad input", "stack": "at handler"}),
            is_error_object: true,
        };
        match outcome.into_result() {
            Err(PoolError::Task(fault)) => {
                assert_eq!(fault, Fault::error_with_stack("bad input", "at handler"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_plain_string_error_object() {
        let outcome = RpcOutcome::Error {
            error: json!("Error: legacy stack text"),
            is_error_object: true,
        };
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Error: legacy stack text");
    }

    #[test]
    fn test_sequence_wraps_around() {
        let mut seq = CorrelationSequence::new(3);
        let ids: Vec<String> = (0..4).map(|_| seq.next_id("p", |_| false).unwrap()).collect();
        assert_eq!(ids, vec!["p:1", "p:2", "p:3", "p:1"]);
    }

    #[test]
    fn test_sequence_skips_pending_and_abandoned_ids() {
        let mut seq = CorrelationSequence::new(4);
        let first = seq.next_id("p", |_| false).unwrap();
        seq.abandon(first.clone());

        let pending = "p:3".to_string();
        let ids: Vec<String> = (0..3)
            .map(|_| seq.next_id("p", |id| id == pending).unwrap())
            .collect();

        assert_eq!(ids, vec!["p:2", "p:4", "p:2"]);
        assert!(!ids.contains(&first));
    }

    #[test]
    fn test_late_reply_releases_abandoned_id() {
        let mut seq = CorrelationSequence::new(2);
        let id = seq.next_id("p", |_| false).unwrap();
        seq.abandon(id.clone());

        assert!(seq.take_abandoned(&id));
        assert!(!seq.take_abandoned(&id));
        assert_eq!(seq.abandoned_len(), 0);
    }

    #[test]
    fn test_saturated_sequence_refuses_to_reuse_ids() {
        let mut seq = CorrelationSequence::new(2);
        let first = seq.next_id("p", |_| false).unwrap();
        let second = seq.next_id("p", |id| id == first).unwrap();
        seq.abandon(second.clone());

        // One id pending, the other waiting for its late reply.
        assert_eq!(seq.next_id("p", |id| id == first), None);

        assert!(seq.take_abandoned(&second));
        assert_eq!(seq.next_id("p", |id| id == first), Some(second));
    }
}
