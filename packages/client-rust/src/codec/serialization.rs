//! Body (de)serialization between in-memory payloads and wire formats.
//!
//! Structured payloads are cross-encodable: a JSON tree may travel as
//! `MessagePack` and the other way round. `Bytes` payloads are already
//! serialized and pass through untouched whatever the encode type.

use bytes::Bytes;
use tailrpc_core::{DataType, EncodeType, Payload};

/// Errors while turning a payload into body bytes or back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializationError {
    #[error("{data_type:?} payload cannot use encode type {encode_type:?}")]
    Unsupported {
        data_type: DataType,
        encode_type: EncodeType,
    },
    #[error("json: {0}")]
    Json(String),
    #[error("msgpack: {0}")]
    MsgPack(String),
}

/// Serializes `payload` into body bytes using `encode_type`.
///
/// # Errors
///
/// Returns `SerializationError::Unsupported` for a structured payload with
/// the `Noop` encode type, or the underlying serializer's failure.
pub fn serialize(payload: &Payload, encode_type: EncodeType) -> Result<Bytes, SerializationError> {
    match (payload, encode_type) {
        (Payload::Bytes(bytes), _) => Ok(bytes.clone()),
        (Payload::Json(value), EncodeType::Json) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Json(e.to_string())),
        (Payload::Json(value), EncodeType::MsgPack) => rmp_serde::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::MsgPack(e.to_string())),
        (Payload::MsgPack(value), EncodeType::MsgPack) => {
            let mut buf = Vec::new();
            rmpv::encode::write_value(&mut buf, value)
                .map_err(|e| SerializationError::MsgPack(e.to_string()))?;
            Ok(Bytes::from(buf))
        }
        (Payload::MsgPack(value), EncodeType::Json) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializationError::Json(e.to_string())),
        (payload, EncodeType::Noop) => Err(SerializationError::Unsupported {
            data_type: payload.data_type(),
            encode_type,
        }),
    }
}

/// Deserializes body bytes written with `encode_type` into a payload of
/// `data_type`.
///
/// # Errors
///
/// Returns `SerializationError::Unsupported` when structured data is
/// requested from a `Noop` body, or the underlying parser's failure.
pub fn deserialize(
    body: Bytes,
    encode_type: EncodeType,
    data_type: DataType,
) -> Result<Payload, SerializationError> {
    match (encode_type, data_type) {
        (_, DataType::Bytes) => Ok(Payload::Bytes(body)),
        (EncodeType::Json, DataType::Json) => serde_json::from_slice(&body)
            .map(Payload::Json)
            .map_err(|e| SerializationError::Json(e.to_string())),
        (EncodeType::MsgPack, DataType::Json) => rmp_serde::from_slice::<serde_json::Value>(&body)
            .map(Payload::Json)
            .map_err(|e| SerializationError::MsgPack(e.to_string())),
        (EncodeType::MsgPack, DataType::MsgPack) => rmpv::decode::read_value(&mut body.as_ref())
            .map(Payload::MsgPack)
            .map_err(|e| SerializationError::MsgPack(e.to_string())),
        (EncodeType::Json, DataType::MsgPack) => serde_json::from_slice::<rmpv::Value>(&body)
            .map(Payload::MsgPack)
            .map_err(|e| SerializationError::Json(e.to_string())),
        (EncodeType::Noop, data_type) => Err(SerializationError::Unsupported {
            data_type,
            encode_type,
        }),
    }
}

/// Encode type for a structured frame when the negotiated one is `Noop`.
#[must_use]
pub fn effective_encode_type(negotiated: EncodeType, payload: &Payload) -> EncodeType {
    match negotiated {
        EncodeType::Noop => payload.data_type().default_encode_type(),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bytes_pass_through_any_encode_type() {
        let payload = Payload::Bytes(Bytes::from_static(b"raw"));
        for encode_type in [EncodeType::Noop, EncodeType::Json, EncodeType::MsgPack] {
            assert_eq!(serialize(&payload, encode_type).unwrap(), Bytes::from_static(b"raw"));
        }
    }

    #[test]
    fn json_travels_as_msgpack() {
        let value = json!({"user": "ada", "ids": [1, 2, 3]});
        let body = serialize(&Payload::Json(value.clone()), EncodeType::MsgPack).unwrap();
        let back = deserialize(body, EncodeType::MsgPack, DataType::Json).unwrap();
        assert_eq!(back.as_json(), Some(&value));
    }

    #[test]
    fn msgpack_value_travels_as_json() {
        let value = rmpv::Value::Map(vec![(rmpv::Value::from("n"), rmpv::Value::from(5))]);
        let body = serialize(&Payload::MsgPack(value), EncodeType::Json).unwrap();
        assert_eq!(body, Bytes::from_static(br#"{"n":5}"#));

        let back = deserialize(body, EncodeType::Json, DataType::MsgPack).unwrap();
        assert!(matches!(back, Payload::MsgPack(rmpv::Value::Map(_))));
    }

    #[test]
    fn structured_payload_needs_an_encode_type() {
        let err = serialize(&Payload::Json(json!(1)), EncodeType::Noop).unwrap_err();
        assert_eq!(
            err,
            SerializationError::Unsupported {
                data_type: DataType::Json,
                encode_type: EncodeType::Noop,
            }
        );
    }

    #[test]
    fn malformed_json_body_is_reported() {
        let err = deserialize(Bytes::from_static(b"{oops"), EncodeType::Json, DataType::Json)
            .unwrap_err();
        assert!(matches!(err, SerializationError::Json(_)));
    }

    #[test]
    fn noop_falls_back_to_payload_default() {
        let payload = Payload::Json(json!(null));
        assert_eq!(effective_encode_type(EncodeType::Noop, &payload), EncodeType::Json);
        assert_eq!(effective_encode_type(EncodeType::MsgPack, &payload), EncodeType::MsgPack);
    }
}
