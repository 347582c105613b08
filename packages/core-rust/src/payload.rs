//! Call payloads and the protocol envelopes the codec frames.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::context::CallType;

/// Wire serialization format of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncodeType {
    /// Body bytes are opaque and passed through unchanged.
    #[default]
    Noop = 0,
    /// UTF-8 JSON.
    Json = 1,
    /// `MessagePack`.
    MsgPack = 2,
}

impl EncodeType {
    /// Maps the wire byte back to an encode type.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Noop),
            1 => Some(Self::Json),
            2 => Some(Self::MsgPack),
            _ => None,
        }
    }
}

/// In-memory representation of a payload, independent of its wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Already-serialized bytes.
    #[default]
    Bytes = 0,
    /// A `serde_json::Value` tree.
    Json = 1,
    /// An `rmpv::Value` tree.
    MsgPack = 2,
}

impl DataType {
    /// Wire format a payload of this type uses unless the caller overrides it.
    #[must_use]
    pub const fn default_encode_type(self) -> EncodeType {
        match self {
            Self::Bytes => EncodeType::Noop,
            Self::Json => EncodeType::Json,
            Self::MsgPack => EncodeType::MsgPack,
        }
    }
}

/// A request or response body as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Json(serde_json::Value),
    MsgPack(rmpv::Value),
}

impl Payload {
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bytes(_) => DataType::Bytes,
            Self::Json(_) => DataType::Json,
            Self::MsgPack(_) => DataType::MsgPack,
        }
    }

    /// Returns the raw bytes for a `Bytes` payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the JSON tree for a `Json` payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<rmpv::Value> for Payload {
    fn from(value: rmpv::Value) -> Self {
        Self::MsgPack(value)
    }
}

/// Protocol-level request header plus serialized body.
///
/// Built by the proxy from the request context; the codec turns it into
/// wire bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u32,
    pub call_type: CallType,
    pub caller: String,
    pub callee: String,
    pub func: String,
    pub timeout_ms: u32,
    pub encode_type: EncodeType,
    pub compress_type: u8,
    pub compress_level: u8,
    pub trans_info: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Protocol-level response header plus serialized body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u32,
    /// Framework return code set by the server, 0 on success.
    pub ret: i32,
    /// Business return code set by the handler, 0 on success.
    pub func_ret: i32,
    pub error_msg: String,
    pub encode_type: EncodeType,
    pub compress_type: u8,
    pub trans_info: BTreeMap<String, String>,
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_follows_variant() {
        assert_eq!(Payload::from(Bytes::from_static(b"x")).data_type(), DataType::Bytes);
        assert_eq!(Payload::from(serde_json::json!({"a": 1})).data_type(), DataType::Json);
        assert_eq!(Payload::from(rmpv::Value::from(3)).data_type(), DataType::MsgPack);
    }

    #[test]
    fn default_encode_type_matches_data_type() {
        assert_eq!(DataType::Bytes.default_encode_type(), EncodeType::Noop);
        assert_eq!(DataType::Json.default_encode_type(), EncodeType::Json);
        assert_eq!(DataType::MsgPack.default_encode_type(), EncodeType::MsgPack);
    }

    #[test]
    fn encode_type_from_wire_byte() {
        assert_eq!(EncodeType::from_u8(2), Some(EncodeType::MsgPack));
        assert_eq!(EncodeType::from_u8(9), None);
    }
}
