// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Serialization
//!
//! Encodes outgoing payloads and decodes inbound message bodies. Bodies that
//! look like a JSON object (or an array of objects) are decoded into
//! `serde_json::Value`; anything else passes through untouched as raw bytes,
//! so opaque/plain-text peers keep working.

use crate::errors::AmqpError;
use serde::Serialize;
use serde_json::Value;

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(Vec<u8>),
}

impl Payload {
    /// The body as a JSON value, wrapping raw bytes as a JSON string.
    pub fn into_value(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Raw(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

/// Encodes a serializable payload into a message body.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|_| AmqpError::ParsePayloadError)
}

/// Decodes an inbound message body.
///
/// Only bodies shaped like a JSON envelope are parsed; a body that looks like
/// JSON but fails to parse falls back to raw pass-through rather than erroring
/// the consumer.
pub fn decode(body: &[u8]) -> Payload {
    if !looks_like_json(body) {
        return Payload::Raw(body.to_vec());
    }

    match serde_json::from_slice(body) {
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Raw(body.to_vec()),
    }
}

/// Envelope detection: `{...}` or `[{...}]` shaped text is treated as JSON.
fn looks_like_json(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let text = text.trim();

    (text.starts_with('{') && text.ends_with('}') && text.len() > 2)
        || (text.starts_with("[{") && text.ends_with("}]") && text.len() > 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_preserves_value() {
        let value = json!({"method": "createProduct", "params": {"id": 1, "name": "A"}});

        let encoded = encode(&value).unwrap();
        assert_eq!(decode(&encoded), Payload::Json(value));
    }

    #[test]
    fn array_of_objects_is_decoded() {
        let value = json!([{"id": 1}, {"id": 2}]);

        let encoded = encode(&value).unwrap();
        assert_eq!(decode(&encoded), Payload::Json(value));
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let body = b"just a plain string";

        assert_eq!(decode(body), Payload::Raw(body.to_vec()));
    }

    #[test]
    fn bare_scalars_are_not_treated_as_envelopes() {
        assert_eq!(decode(b"123"), Payload::Raw(b"123".to_vec()));
        assert_eq!(decode(b"true"), Payload::Raw(b"true".to_vec()));
    }

    #[test]
    fn malformed_braces_fall_back_to_raw() {
        let body = b"{not valid json}";

        assert_eq!(decode(body), Payload::Raw(body.to_vec()));
    }

    #[test]
    fn raw_payload_converts_to_string_value() {
        let payload = decode(b"pong");

        assert_eq!(payload.into_value(), Value::String("pong".to_owned()));
    }
}
