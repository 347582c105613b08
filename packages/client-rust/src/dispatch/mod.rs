//! Tower stack that carries one physical request to the transport.
//!
//! Every attempt of a call, including both legs of a backup race, goes
//! through the same stack and comes out as a `Status` on failure.
//!
//! - [`limit`]: per-proxy cap on requests on the wire
//! - [`report`]: per-attempt feedback to the selector, metrics and tracing
//! - [`deadline`]: the attempt's budget, expiring with the call's timeout kind
//! - [`transport`]: the innermost service, adapting the `Transport` trait
//! - [`pipeline`]: composes all layers into a [`Dispatcher`]

pub mod deadline;
pub mod limit;
pub mod pipeline;
pub mod report;
pub mod transport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tailrpc_core::{ErrorKind, RequestContext, Status, TransportMessage};
use tower::util::BoxCloneSyncService;

pub use deadline::DeadlineLayer;
pub use limit::InFlightLimitLayer;
pub use pipeline::build_dispatch_pipeline;
pub use report::ReportLayer;
pub use transport::TransportService;

/// How the transport is driven for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Await `send_recv` in place.
    SendRecv,
    /// Run `send_recv_async` on its own task; dropping the dispatch aborts it.
    SendRecvAsync,
    /// Fire `send_only`; no response is expected.
    SendOnly,
}

impl DispatchMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendRecv => "send_recv",
            Self::SendRecvAsync => "send_recv_async",
            Self::SendOnly => "send_only",
        }
    }
}

/// One physical request flowing through the dispatch stack.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub service: Arc<str>,
    pub mode: DispatchMode,
    /// `Timeout` or `FullLinkTimeout`, whichever the call's budget came from.
    pub timeout_kind: ErrorKind,
    pub msg: TransportMessage,
}

impl DispatchRequest {
    /// Request for the call described by `ctx`, carrying `msg`.
    #[must_use]
    pub fn for_call(
        service: Arc<str>,
        mode: DispatchMode,
        ctx: &RequestContext,
        msg: TransportMessage,
    ) -> Self {
        Self {
            service,
            mode,
            timeout_kind: ctx.timeout_kind(),
            msg,
        }
    }
}

/// What the transport produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResponse {
    /// Wire bytes of the response.
    Reply(Bytes),
    /// A one-way send was handed to the transport.
    Sent,
}

impl DispatchResponse {
    /// Response bytes; empty for one-way sends.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Reply(bytes) => bytes,
            Self::Sent => Bytes::new(),
        }
    }
}

/// Boxed future shared by every layer of the stack.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<DispatchResponse, Status>> + Send>>;

/// The assembled dispatch stack of one proxy. Cloning it is cheap and
/// needs no lock, so every attempt takes its own copy.
pub type Dispatcher = BoxCloneSyncService<DispatchRequest, DispatchResponse, Status>;
