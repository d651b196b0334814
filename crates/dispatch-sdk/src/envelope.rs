// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boxing of application values into typed envelopes.
//!
//! The scheduler never interprets function inputs or outputs; it moves them
//! around as [`Envelope`]s, an `Any`-shaped pair of a type URL and opaque
//! bytes. Two families exist:
//!
//! - the *value* family carries an encoded [`Value`], used for everything
//!   application-level;
//! - the *raw* family carries bare bytes, used for integral protocol
//!   payloads that must not be re-encoded.
//!
//! Boxing failures surface as INVALID_ARGUMENT, unboxing failures as
//! INVALID_RESPONSE: a value we cannot encode is our caller's bug, a payload
//! we cannot decode is the peer's.

use prost::Message;

use dispatch_proto::{Envelope, Raw};

use crate::error::{Result, SdkError};
use crate::value::Value;

/// Type URL of the encoded-value envelope family.
pub const VALUE_TYPE_URL: &str = "types.dispatch.run/dispatch.sdk.v1.Value";

/// Type URL of the raw-bytes envelope family.
pub const RAW_TYPE_URL: &str = "types.dispatch.run/dispatch.sdk.v1.Raw";

/// Box a value into the encoded-value family.
pub fn box_value(value: &Value) -> Result<Envelope> {
    let bytes = bincode::serialize(value)
        .map_err(|e| SdkError::InvalidArgument(format!("unserializable value: {}", e)))?;
    Ok(Envelope {
        type_url: VALUE_TYPE_URL.to_string(),
        value: bytes,
    })
}

/// Box raw bytes into the raw family. Never fails.
pub fn box_bytes(bytes: &[u8]) -> Envelope {
    let raw = Raw {
        value: bytes.to_vec(),
    };
    Envelope {
        type_url: RAW_TYPE_URL.to_string(),
        value: raw.encode_to_vec(),
    }
}

/// Unbox an envelope into a value.
///
/// Raw envelopes come back as [`Value::Bytes`] so both families flow into
/// functions uniformly.
pub fn unbox_value(envelope: &Envelope) -> Result<Value> {
    match envelope.type_url.as_str() {
        VALUE_TYPE_URL => bincode::deserialize(&envelope.value)
            .map_err(|e| SdkError::InvalidResponse(format!("corrupt value payload: {}", e))),
        RAW_TYPE_URL => Ok(Value::Bytes(unbox_bytes(envelope)?)),
        other => Err(SdkError::InvalidResponse(format!(
            "unsupported envelope type {:?}",
            other
        ))),
    }
}

/// Unbox a raw-family envelope into its bytes.
pub fn unbox_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    if envelope.type_url != RAW_TYPE_URL {
        return Err(SdkError::InvalidResponse(format!(
            "expected raw envelope, got {:?}",
            envelope.type_url
        )));
    }
    let raw = Raw::decode(envelope.value.as_slice())
        .map_err(|e| SdkError::InvalidResponse(format!("corrupt raw payload: {}", e)))?;
    Ok(raw.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let value = Value::List(vec![Value::Int(21), Value::Str("x".into()), Value::Nil]);
        let envelope = box_value(&value).unwrap();
        assert_eq!(envelope.type_url, VALUE_TYPE_URL);
        assert_eq!(unbox_value(&envelope).unwrap(), value);
    }

    #[test]
    fn test_raw_round_trip() {
        let payload = vec![0u8, 1, 255, 42];
        let envelope = box_bytes(&payload);
        assert_eq!(envelope.type_url, RAW_TYPE_URL);
        assert_eq!(unbox_bytes(&envelope).unwrap(), payload);
        assert_eq!(unbox_value(&envelope).unwrap(), Value::Bytes(payload));
    }

    #[test]
    fn test_unknown_type_url_is_invalid_response() {
        let envelope = Envelope {
            type_url: "types.example.com/Mystery".to_string(),
            value: vec![1, 2, 3],
        };
        match unbox_value(&envelope) {
            Err(SdkError::InvalidResponse(_)) => {}
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_value_payload_is_invalid_response() {
        let envelope = Envelope {
            type_url: VALUE_TYPE_URL.to_string(),
            value: vec![255, 255, 255, 255, 255, 255, 255, 255, 255],
        };
        assert!(matches!(
            unbox_value(&envelope),
            Err(SdkError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_boxing_is_deterministic() {
        let value = Value::Map(std::collections::BTreeMap::from([
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Int(1)),
        ]));
        assert_eq!(
            box_value(&value).unwrap().value,
            box_value(&value).unwrap().value
        );
    }
}
