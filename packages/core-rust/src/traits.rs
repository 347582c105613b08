//! Capabilities the invocation pipeline consumes from its collaborators.
//!
//! - [`Codec`]: frames request/response envelopes for one protocol
//! - [`Transport`]: moves bytes to an endpoint and back, or opens a stream
//! - [`Selector`]: resolves a logical service name to concrete endpoints

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::context::{CallType, Endpoint, RequestContext};
use crate::payload::{RequestEnvelope, ResponseEnvelope};
use crate::status::{ErrorKind, Status};

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors raised while framing or unframing an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        let kind = match err {
            CodecError::Encode(_) => ErrorKind::EncodeError,
            CodecError::Decode(_) => ErrorKind::DecodeError,
        };
        Status::from_kind(kind, err.to_string())
    }
}

/// Wire protocol of a service proxy.
///
/// The codec never sees typed payloads: the runtime serializes the body into
/// the envelope first, and the codec only frames envelopes.
pub trait Codec: Send + Sync + 'static {
    /// Protocol name used for registry lookups (e.g. `"msgpack"`).
    fn name(&self) -> &'static str;

    /// A fresh request envelope with protocol defaults.
    fn create_request(&self) -> RequestEnvelope {
        RequestEnvelope::default()
    }

    /// A fresh response envelope with protocol defaults.
    fn create_response(&self) -> ResponseEnvelope {
        ResponseEnvelope::default()
    }

    /// Frames a request envelope into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the envelope cannot be represented.
    fn encode_request(
        &self,
        ctx: &RequestContext,
        request: &RequestEnvelope,
    ) -> Result<Bytes, CodecError>;

    /// Parses wire bytes into a response envelope.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid response.
    fn decode_response(
        &self,
        ctx: &RequestContext,
        wire: Bytes,
    ) -> Result<ResponseEnvelope, CodecError>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u32 },
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("transport operation cancelled")]
    Cancelled,
    #[error("dispatch overloaded, too many in-flight requests")]
    Overloaded,
    #[error("streaming is not supported by this transport")]
    StreamUnsupported,
}

impl TransportError {
    /// Converts into a call status. Timeouts take their kind from the
    /// context so full-link expiry is reported as such.
    #[must_use]
    pub fn into_status(self, ctx: &RequestContext) -> Status {
        self.into_status_with(ctx.timeout_kind())
    }

    /// Converts into a call status, reporting timeouts as `timeout_kind`.
    /// Used where the owning context is no longer at hand (stream handles).
    #[must_use]
    pub fn into_status_with(self, timeout_kind: ErrorKind) -> Status {
        let kind = match &self {
            Self::Timeout { .. } => timeout_kind,
            Self::Connect { .. } => ErrorKind::ConnectError,
            Self::Network(_) | Self::StreamUnsupported => ErrorKind::NetworkError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Overloaded => ErrorKind::LimitedError,
        };
        Status::from_kind(kind, self.to_string())
    }
}

/// One physical request handed to a transport.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub request_id: u32,
    pub call_type: CallType,
    pub endpoint: Endpoint,
    /// Budget for this physical request.
    pub timeout: Duration,
    pub payload: Bytes,
}

/// Options for opening a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub call_type: CallType,
    pub stream_id: u32,
    pub timeout: Duration,
    /// Encoded stream-init envelope, sent as the first frame.
    pub init_frame: Bytes,
    pub metadata: BTreeMap<String, String>,
}

/// Sending half of a transport-level stream.
#[async_trait]
pub trait FrameWriter: Send {
    /// Writes one data frame.
    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Half-closes the sending side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a transport-level stream.
#[async_trait]
pub trait FrameReader: Send {
    /// Reads the next data frame; `None` once the peer finished.
    async fn read(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// The two halves of an opened stream.
pub struct StreamPair {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// Moves requests to endpoints.
///
/// Connection management, multiplexing and scheduling are the
/// implementation's business; the pipeline only awaits these futures.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Sends a request and waits for its response.
    async fn send_recv(&self, msg: TransportMessage) -> Result<Bytes, TransportError>;

    /// Sends a request on a separate task. Dropping the handle does not
    /// cancel the task; callers abort it explicitly.
    fn send_recv_async(
        self: Arc<Self>,
        msg: TransportMessage,
    ) -> JoinHandle<Result<Bytes, TransportError>> {
        tokio::spawn(async move { self.send_recv(msg).await })
    }

    /// Sends a request without waiting for any response.
    async fn send_only(&self, msg: TransportMessage) -> Result<(), TransportError>;

    /// Opens a stream to `endpoint`.
    async fn create_stream(
        &self,
        _endpoint: &Endpoint,
        _options: StreamOptions,
    ) -> Result<StreamPair, TransportError> {
        Err(TransportError::StreamUnsupported)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Errors from endpoint selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("no endpoint available for service {service}")]
    NoEndpoint { service: String },
    #[error("selector failure: {0}")]
    Other(String),
}

impl From<SelectorError> for Status {
    fn from(err: SelectorError) -> Self {
        Status::from_kind(ErrorKind::RouterError, err.to_string())
    }
}

/// Outcome of one invocation against an endpoint, fed back to the selector.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub service: String,
    pub endpoint: Endpoint,
    pub framework_code: i32,
    pub cost: Duration,
}

/// Resolves service names to endpoints.
#[async_trait]
pub trait Selector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Picks one endpoint for `service`.
    async fn select(&self, service: &str) -> Result<Endpoint, SelectorError>;

    /// Picks up to `count` distinct endpoints for `service`.
    async fn select_batch(&self, service: &str, count: usize)
        -> Result<Vec<Endpoint>, SelectorError>;

    /// Reports an invocation outcome. Default is a no-op.
    fn report(&self, _result: &InvokeResult) {}
}
