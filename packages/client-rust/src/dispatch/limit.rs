//! In-flight limit of one proxy.
//!
//! A saturated proxy fails new attempts at once with `LimitedError` instead
//! of queueing them behind requests that already hold the wire.

use std::sync::Arc;
use std::task::{Context, Poll};

use tailrpc_core::{ErrorKind, Status};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use super::{DispatchFuture, DispatchRequest, DispatchResponse};
use crate::stats::ProxyStats;

/// Caps the attempts a proxy has on the wire.
///
/// Clones share the permits, so every dispatcher clone taken by the proxy
/// (one per attempt) counts against the same limit.
#[derive(Debug, Clone)]
pub struct InFlightLimitLayer {
    permits: Arc<Semaphore>,
    limit: u32,
    stats: Arc<ProxyStats>,
}

impl InFlightLimitLayer {
    #[must_use]
    pub fn new(limit: u32, stats: Arc<ProxyStats>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
            stats,
        }
    }

    /// Attempts that could start right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> Layer<S> for InFlightLimitLayer {
    type Service = InFlightLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InFlightLimit {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlightLimit<S> {
    inner: S,
    layer: InFlightLimitLayer,
}

impl<S> Service<DispatchRequest> for InFlightLimit<S>
where
    S: Service<DispatchRequest, Response = DispatchResponse, Error = Status, Future = DispatchFuture>,
{
    type Response = DispatchResponse;
    type Error = Status;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.layer.permits).try_acquire_owned() else {
            self.layer.stats.record_shed();
            tracing::warn!(
                service = %req.service,
                endpoint = %req.msg.endpoint,
                limit = self.layer.limit,
                "dispatch shed"
            );
            let status = Status::from_kind(
                ErrorKind::LimitedError,
                format!("{} has {} requests in flight", req.service, self.layer.limit),
            );
            return Box::pin(async move { Err(status) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let _permit = permit;
            fut.await
        })
    }
}
