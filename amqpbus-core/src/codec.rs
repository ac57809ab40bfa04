//! Wire encoding of the `{q, qid}` envelope.
//!
//! Requests travel wrapped in the envelope; responses are the bare payload,
//! their correlation is carried by the routing key alone.

use serde_json::Value;

use crate::{Envelope, MessagingError, Result};

/// Decode a request body into `(qid, payload)`.
///
/// Anything that is not a JSON object with a `q` member is a decode failure.
/// A missing or null `qid` is a fire-and-forget request, not an error.
pub fn decode(raw: &[u8]) -> Result<(Option<String>, Value)> {
    let envelope: Envelope =
        serde_json::from_slice(raw).map_err(|e| MessagingError::Decode(e.to_string()))?;
    Ok((envelope.qid, envelope.q))
}

/// Encode a response body.
pub fn encode(payload: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| MessagingError::Serialization(e.to_string()))
}

/// Encode a request body; `qid` is omitted from the wire when absent.
pub fn encode_request(payload: &Value, qid: Option<&str>) -> Result<Vec<u8>> {
    let envelope = Envelope::new(payload.clone(), qid.map(str::to_string));
    serde_json::to_vec(&envelope).map_err(|e| MessagingError::Serialization(e.to_string()))
}

/// Decode a response body.
pub fn decode_response(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw).map_err(|e| MessagingError::Decode(e.to_string()))
}
