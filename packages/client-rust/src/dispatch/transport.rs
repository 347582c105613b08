//! Innermost dispatch service: hands the message to the `Transport`.

use std::sync::Arc;
use std::task::{Context, Poll};

use tailrpc_core::{Status, Transport, TransportError};
use tokio::task::AbortHandle;
use tower::Service;

use super::{DispatchFuture, DispatchMode, DispatchRequest, DispatchResponse};

/// Aborts the spawned transport task if the dispatch future goes away
/// before the task finished.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ---------------------------------------------------------------------------
// TransportService
// ---------------------------------------------------------------------------

/// Adapts a shared `Transport` to `tower::Service<DispatchRequest>`.
///
/// Transport failures leave this service as statuses; a transport-reported
/// timeout takes the request's timeout kind.
#[derive(Clone)]
pub struct TransportService {
    transport: Arc<dyn Transport>,
}

impl TransportService {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl Service<DispatchRequest> for TransportService {
    type Response = DispatchResponse;
    type Error = Status;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let transport = Arc::clone(&self.transport);
        let timeout_kind = req.timeout_kind;
        match req.mode {
            DispatchMode::SendRecv => Box::pin(async move {
                transport
                    .send_recv(req.msg)
                    .await
                    .map(DispatchResponse::Reply)
                    .map_err(|e| e.into_status_with(timeout_kind))
            }),
            DispatchMode::SendRecvAsync => {
                let handle = transport.send_recv_async(req.msg);
                let guard = AbortOnDrop(handle.abort_handle());
                Box::pin(async move {
                    let joined = handle.await;
                    drop(guard);
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(TransportError::Cancelled),
                        Err(e) => Err(TransportError::Network(format!("transport task failed: {e}"))),
                    };
                    result
                        .map(DispatchResponse::Reply)
                        .map_err(|e| e.into_status_with(timeout_kind))
                })
            }
            DispatchMode::SendOnly => Box::pin(async move {
                transport
                    .send_only(req.msg)
                    .await
                    .map(|()| DispatchResponse::Sent)
                    .map_err(|e| e.into_status_with(timeout_kind))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
