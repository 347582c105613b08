//! Pipeline composition: combines all dispatch layers into one service stack.

use std::sync::Arc;

use tailrpc_core::{Selector, Transport};
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::deadline::DeadlineLayer;
use super::limit::InFlightLimitLayer;
use super::report::ReportLayer;
use super::transport::TransportService;
use super::Dispatcher;

/// Build the dispatch stack of one proxy around `transport`.
///
/// Layer order (outermost to innermost):
/// 1. `InFlightLimitLayer` -- shed when the proxy is saturated
/// 2. `ReportLayer` -- selector feedback and metrics, timeouts included
/// 3. `DeadlineLayer` -- enforce the attempt's budget
#[must_use]
pub fn build_dispatch_pipeline(
    transport: Arc<dyn Transport>,
    selector: Arc<dyn Selector>,
    limit: InFlightLimitLayer,
) -> Dispatcher {
    let stack = ServiceBuilder::new()
        .layer(limit)
        .layer(ReportLayer::new(selector))
        .layer(DeadlineLayer)
        .service(TransportService::new(transport));
    BoxCloneSyncService::new(stack)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tailrpc_core::ErrorKind;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::test_support::{request, ENDPOINT};
    use crate::dispatch::{DispatchMode, DispatchResponse};
    use crate::selector::StaticSelector;
    use crate::stats::ProxyStats;
    use crate::testing::{MockTransport, Script};

    fn pipeline(
        transport: &Arc<MockTransport>,
        limit: u32,
    ) -> (Dispatcher, Arc<StaticSelector>, Arc<ProxyStats>) {
        let selector = Arc::new(StaticSelector::new());
        let stats = Arc::new(ProxyStats::new("ledger"));
        let dispatcher = build_dispatch_pipeline(
            transport.clone(),
            selector.clone(),
            InFlightLimitLayer::new(limit, Arc::clone(&stats)),
        );
        (dispatcher, selector, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn one_way_send_is_handed_off_and_reported() {
        let transport = MockTransport::new();
        let (dispatcher, selector, _) = pipeline(&transport, 4);

        let resp = dispatcher
            .oneshot(request(DispatchMode::SendOnly, 100))
            .await
            .unwrap();
        assert_eq!(resp, DispatchResponse::Sent);
        assert_eq!(transport.send_only_calls(), 1);
        assert_eq!(selector.endpoint_stats(ENDPOINT).successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_attempt_counts_as_endpoint_failure() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::reply(500, Bytes::from_static(b"late")));
        let (dispatcher, selector, _) = pipeline(&transport, 4);

        let err = dispatcher
            .oneshot(request(DispatchMode::SendRecv, 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));

        let stats = selector.endpoint_stats(ENDPOINT);
        assert_eq!(stats.failures, 1);
        assert!(stats.total_cost_us >= 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn shed_attempts_never_reach_selector_or_transport() {
        let transport = MockTransport::new();
        transport.script(ENDPOINT, Script::echo(50));
        let (dispatcher, selector, stats) = pipeline(&transport, 1);

        let first = tokio::spawn(dispatcher.clone().oneshot(request(DispatchMode::SendRecv, 1_000)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let err = dispatcher
            .clone()
            .oneshot(request(DispatchMode::SendRecv, 1_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::LimitedError));

        first.await.unwrap().unwrap();
        assert_eq!(transport.send_recv_calls(), 1);
        assert_eq!(stats.snapshot().shed, 1);
        assert_eq!(selector.endpoint_stats(ENDPOINT).successes, 1);
        assert_eq!(selector.endpoint_stats(ENDPOINT).failures, 0);
    }
}
