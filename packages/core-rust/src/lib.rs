//! `tailrpc` core: call status, request context, filter points, payloads and
//! the collaborator traits (`Codec`, `Transport`, `Selector`).

pub mod context;
pub mod filter_point;
pub mod payload;
pub mod status;
pub mod traits;

pub use context::{
    compose_timeout, BackupRequest, CallType, ContextError, ContextState, Endpoint,
    RequestContext, DEFAULT_TIMEOUT_MS,
};
pub use filter_point::{FilterPoint, NUM_POINT_PAIRS};
pub use payload::{DataType, EncodeType, Payload, RequestEnvelope, ResponseEnvelope};
pub use status::{ErrorKind, Status};
pub use traits::{
    Codec, CodecError, FrameReader, FrameWriter, InvokeResult, Selector, SelectorError,
    StreamOptions, StreamPair, Transport, TransportError, TransportMessage,
};
