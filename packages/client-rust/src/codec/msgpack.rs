//! Reference `MessagePack` envelope codec.
//!
//! Envelopes are framed with `rmp_serde::to_vec_named()`, so field names
//! travel on the wire and either side may add fields without breaking the
//! other.

use bytes::Bytes;
use tailrpc_core::{Codec, CodecError, RequestContext, RequestEnvelope, ResponseEnvelope};

/// Frames request and response envelopes as named `MessagePack` maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    pub const NAME: &'static str = "msgpack";

    /// Parses a request envelope. Server side of the protocol, used by
    /// loopback transports and tests.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` on malformed input.
    pub fn decode_request(wire: &[u8]) -> Result<RequestEnvelope, CodecError> {
        rmp_serde::from_slice(wire).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Frames a response envelope. Server side of the protocol.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode_response(response: &ResponseEnvelope) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(response)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode_request(
        &self,
        _ctx: &RequestContext,
        request: &RequestEnvelope,
    ) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(request)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_response(
        &self,
        _ctx: &RequestContext,
        wire: Bytes,
    ) -> Result<ResponseEnvelope, CodecError> {
        rmp_serde::from_slice(&wire).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
