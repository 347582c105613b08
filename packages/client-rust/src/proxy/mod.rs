//! Service proxies: the call-shape-specific drivers of the invocation
//! pipeline.
//!
//! Every call shape walks the same stages:
//!
//! ```text
//! fill -> PRE_RPC_INVOKE -> route -> encode -> PRE_SEND_MSG -> dispatch
//!      -> POST_RECV_MSG -> decode -> POST_RPC_INVOKE
//! ```
//!
//! A failing or rejected stage short-circuits the stages after it, but the
//! post point of every pre point that ran still fires, so filters always see
//! their pre and post hooks in pairs.
//!
//! - [`async_call`]: the cancellable future returned by async calls
//! - [`backup`]: the primary/backup race for tail-latency mitigation
//! - [`stream`]: streaming call handles

pub mod async_call;
pub mod backup;
pub mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tailrpc_core::{
    BackupRequest, CallType, ErrorKind, FilterPoint, Payload, RequestContext, RequestEnvelope,
    Selector, Status, Transport, TransportMessage, DEFAULT_TIMEOUT_MS,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::Instrument;

use crate::codec::{deserialize, serialize, SharedCodec};
use crate::config::ProxyConfig;
use crate::dispatch::{
    build_dispatch_pipeline, DispatchMode, DispatchRequest, DispatchResponse, Dispatcher,
    InFlightLimitLayer,
};
use crate::filter::{FilterChain, FilterStatus};
use crate::runtime::lifecycle::LifecycleController;
use crate::runtime::RuntimeError;
use crate::stats::{ProxyStats, ProxyStatsSnapshot};

pub use async_call::ResponseFuture;
pub use stream::{StreamReader, StreamWriter};

/// Everything a proxy is assembled from; built by the runtime.
pub(crate) struct ProxyParts {
    pub config: ProxyConfig,
    pub filters: FilterChain,
    pub codec: SharedCodec,
    pub selector: Arc<dyn Selector>,
    pub transport: Arc<dyn Transport>,
    pub max_in_flight: u32,
    pub lifecycle: Arc<LifecycleController>,
}

// ---------------------------------------------------------------------------
// ServiceProxy
// ---------------------------------------------------------------------------

/// Client-side handle of one remote service.
///
/// Proxies are created and cached by `ClientRuntime::proxy` and shared as
/// `Arc<ServiceProxy>`; every method takes `&self`.
pub struct ServiceProxy {
    service: Arc<str>,
    config: ProxyConfig,
    filters: FilterChain,
    codec: SharedCodec,
    selector: Arc<dyn Selector>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    lifecycle: Arc<LifecycleController>,
    stats: Arc<ProxyStats>,
}

impl ServiceProxy {
    pub(crate) fn new(parts: ProxyParts) -> Self {
        let service: Arc<str> = Arc::from(parts.config.service_name.as_str());
        let stats = Arc::new(ProxyStats::new(service.as_ref()));
        let dispatcher = build_dispatch_pipeline(
            Arc::clone(&parts.transport),
            Arc::clone(&parts.selector),
            InFlightLimitLayer::new(parts.max_in_flight, Arc::clone(&stats)),
        );
        Self {
            stats,
            service,
            config: parts.config,
            filters: parts.filters,
            codec: parts.codec,
            selector: parts.selector,
            transport: parts.transport,
            dispatcher,
            lifecycle: parts.lifecycle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[must_use]
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    #[must_use]
    pub fn stats(&self) -> ProxyStatsSnapshot {
        self.stats.snapshot()
    }

    // -- invocation API -----------------------------------------------------

    /// Sends `request` and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns the call's final status when it is not OK; the same status is
    /// left in `ctx`.
    pub async fn unary_invoke(
        &self,
        ctx: &mut RequestContext,
        request: &Payload,
    ) -> Result<Payload, Status> {
        let Some(_guard) = self.lifecycle.try_enter() else {
            return Err(refuse(ctx));
        };
        ctx.set_call_type(CallType::Unary);
        let span = self.call_span(ctx);
        let token = CancellationToken::new();
        self.invoke(ctx, Some(request), DispatchMode::SendRecv, &token)
            .instrument(span)
            .await
    }

    /// Runs the unary pipeline on its own task.
    ///
    /// The context moves into the task and comes back with the outcome.
    /// Cancelling or dropping the returned future aborts the in-flight
    /// transport operation; `POST_RPC_INVOKE` still runs once, with a
    /// `Cancelled` status.
    pub fn async_unary_invoke(
        self: &Arc<Self>,
        mut ctx: RequestContext,
        request: Payload,
    ) -> ResponseFuture {
        let cancel = CancellationToken::new();
        let guard = self.lifecycle.try_enter();
        ctx.set_call_type(CallType::Unary);
        let span = self.call_span(&ctx);
        let proxy = Arc::clone(self);
        let token = cancel.clone();

        ResponseFuture::spawn(
            async move {
                let result = match guard {
                    Some(_guard) => {
                        proxy
                            .invoke(&mut ctx, Some(&request), DispatchMode::SendRecvAsync, &token)
                            .await
                    }
                    None => Err(refuse(&mut ctx)),
                };
                (ctx, result)
            }
            .instrument(span),
            cancel,
        )
    }

    /// Sends `request` without waiting for a response. Backup requests
    /// never apply.
    ///
    /// # Errors
    ///
    /// Returns the status of the first failing stage.
    pub async fn oneway_invoke(
        &self,
        ctx: &mut RequestContext,
        request: &Payload,
    ) -> Result<(), Status> {
        let Some(_guard) = self.lifecycle.try_enter() else {
            return Err(refuse(ctx));
        };
        ctx.set_call_type(CallType::OneWay);
        let span = self.call_span(ctx);
        let token = CancellationToken::new();
        self.invoke(ctx, Some(request), DispatchMode::SendOnly, &token)
            .instrument(span)
            .await
            .map(|_| ())
    }

    // -- stages -------------------------------------------------------------

    fn call_span(&self, ctx: &RequestContext) -> tracing::Span {
        tracing::info_span!(
            "rpc_call",
            service = %self.service,
            func = ctx.func_name(),
            call_type = ?ctx.call_type(),
            request_id = tracing::field::Empty,
        )
    }

    async fn invoke(
        &self,
        ctx: &mut RequestContext,
        request: Option<&Payload>,
        mode: DispatchMode,
        token: &CancellationToken,
    ) -> Result<Payload, Status> {
        self.stats.record_call();
        if let Err(status) = self.fill_client_context(ctx, request) {
            return self.finish(ctx, Err(status));
        }

        let verdict = self.filters.run(FilterPoint::ClientPreRpcInvoke, ctx);
        let result = if verdict == FilterStatus::Reject {
            Err(self.rejected(ctx, FilterPoint::ClientPreRpcInvoke))
        } else {
            self.invoke_stages(ctx, request, mode, token).await
        };

        if let Err(status) = &result {
            ctx.set_status(status.clone());
        }
        self.filters.run(FilterPoint::ClientPostRpcInvoke, ctx);
        self.finish(ctx, result)
    }

    async fn invoke_stages(
        &self,
        ctx: &mut RequestContext,
        request: Option<&Payload>,
        mode: DispatchMode,
        token: &CancellationToken,
    ) -> Result<Payload, Status> {
        cancellable(token, self.route(ctx)).await?;
        let empty = Payload::Bytes(Bytes::new());
        let wire = self.encode(ctx, request.unwrap_or(&empty))?;

        if self.filters.run(FilterPoint::ClientPreSendMsg, ctx) == FilterStatus::Reject {
            let status = self.rejected(ctx, FilterPoint::ClientPreSendMsg);
            ctx.set_status(status.clone());
            self.filters.run(FilterPoint::ClientPostRecvMsg, ctx);
            return Err(status);
        }

        let reply = cancellable(token, self.transport_stage(ctx, wire, mode)).await;
        if let Err(status) = &reply {
            ctx.set_status(status.clone());
        }
        self.filters.run(FilterPoint::ClientPostRecvMsg, ctx);

        let wire = reply?;
        if mode == DispatchMode::SendOnly {
            return Ok(empty);
        }
        self.decode(ctx, wire)
    }

    /// Fills identity, encoding defaults and the effective timeout.
    fn fill_client_context(
        &self,
        ctx: &mut RequestContext,
        request: Option<&Payload>,
    ) -> Result<(), Status> {
        let request_id = ctx.assign_request_id();
        tracing::Span::current().record("request_id", request_id);

        if ctx.caller_name().is_empty() {
            ctx.set_caller_name(self.config.caller_name.clone());
        }
        if ctx.callee_name().is_empty() {
            ctx.set_callee_name(self.service.as_ref());
        }
        if ctx.req_compress() == (0, 0) {
            ctx.set_req_compress(self.config.compress_type, self.config.compress_level);
        }
        if let Some(encode_type) = self.config.encode_type {
            if !ctx.has_req_encode_type() {
                ctx.set_req_encode_type(encode_type);
            }
        }
        if let Some(request) = request {
            ctx.apply_payload_defaults(request);
        }

        let timeout_ms = ctx.apply_proxy_timeout(self.config.timeout_ms);
        if timeout_ms == 0 {
            return Err(ctx.timeout_status("call budget exhausted before dispatch"));
        }

        if let Some(delay_ms) = ctx.backup_request().map(BackupRequest::delay_ms) {
            if ctx.call_type() != CallType::Unary || timeout_ms <= delay_ms {
                tracing::debug!(timeout_ms, delay_ms, "backup request disarmed");
                ctx.disarm_backup_request();
            }
        }

        ctx.mark_filled();
        Ok(())
    }

    /// Resolves the destination unless the caller pinned one.
    async fn route(&self, ctx: &mut RequestContext) -> Result<(), Status> {
        let target = self.config.resolved_target();
        let needs_backup_addrs = ctx.backup_request().is_some_and(|b| b.addrs().is_none());

        if ctx.has_explicit_endpoint() {
            if needs_backup_addrs {
                self.pair_with_backup(ctx, target).await;
            }
            return Ok(());
        }

        if needs_backup_addrs {
            let mut endpoints = self.selector.select_batch(target, 2).await?.into_iter();
            match (endpoints.next(), endpoints.next()) {
                (Some(primary), Some(backup)) => {
                    ctx.set_backup_request_addrs(primary, backup)
                        .map_err(|e| Status::from_kind(ErrorKind::Unknown, e.to_string()))?;
                    return Ok(());
                }
                (Some(only), None) => {
                    tracing::debug!(endpoint = %only, "single endpoint, backup request disarmed");
                    ctx.disarm_backup_request();
                    ctx.set_selected_endpoint(only);
                    return Ok(());
                }
                _ => ctx.disarm_backup_request(),
            }
        }

        let endpoint = self.selector.select(target).await?;
        ctx.set_selected_endpoint(endpoint);
        Ok(())
    }

    /// Finds a backup destination for a caller-pinned primary. Backup mode
    /// is disarmed when the selector has no other endpoint to offer.
    async fn pair_with_backup(&self, ctx: &mut RequestContext, target: &str) {
        let Some(primary) = ctx.endpoint().cloned() else {
            ctx.disarm_backup_request();
            return;
        };
        let backup = match self.selector.select_batch(target, 2).await {
            Ok(endpoints) => endpoints
                .into_iter()
                .find(|e| e.address() != primary.address()),
            Err(e) => {
                tracing::debug!(error = %e, "no backup destination for pinned endpoint");
                None
            }
        };
        let paired = backup.is_some_and(|b| ctx.set_backup_request_addrs(primary, b).is_ok());
        if !paired {
            tracing::debug!("pinned endpoint has no backup, backup request disarmed");
            ctx.disarm_backup_request();
        }
    }

    /// The protocol header for this call around `body`.
    fn build_envelope(&self, ctx: &RequestContext, body: Bytes) -> RequestEnvelope {
        let (compress_type, compress_level) = ctx.req_compress();
        let mut envelope = self.codec.create_request();
        envelope.request_id = ctx.request_id().unwrap_or_default();
        envelope.call_type = ctx.call_type();
        envelope.caller = ctx.caller_name().to_string();
        envelope.callee = ctx.callee_name().to_string();
        envelope.func = ctx.func_name().to_string();
        envelope.timeout_ms = ctx.remaining_timeout_ms().unwrap_or(DEFAULT_TIMEOUT_MS);
        envelope.encode_type = ctx.req_encode_type();
        envelope.compress_type = compress_type;
        envelope.compress_level = compress_level;
        envelope.trans_info = ctx.req_trans_info().clone();
        envelope.body = body;
        envelope
    }

    fn encode(&self, ctx: &RequestContext, request: &Payload) -> Result<Bytes, Status> {
        let body = serialize(request, ctx.req_encode_type())
            .map_err(|e| Status::from_kind(ErrorKind::EncodeError, e.to_string()))?;
        let envelope = self.build_envelope(ctx, body);
        Ok(self.codec.encode_request(ctx, &envelope)?)
    }

    /// Hands the wire bytes to the dispatch stack, racing a backup
    /// destination when backup mode is armed.
    async fn transport_stage(
        &self,
        ctx: &mut RequestContext,
        wire: Bytes,
        mode: DispatchMode,
    ) -> Result<Bytes, Status> {
        let endpoint = ctx
            .endpoint()
            .cloned()
            .ok_or_else(|| Status::from_kind(ErrorKind::RouterError, "no endpoint selected"))?;
        let budget = ctx.remaining_timeout_ms().unwrap_or(DEFAULT_TIMEOUT_MS);
        let msg = TransportMessage {
            request_id: ctx.request_id().unwrap_or_default(),
            call_type: ctx.call_type(),
            endpoint: endpoint.clone(),
            timeout: Duration::from_millis(u64::from(budget)),
            payload: wire,
        };
        let request = DispatchRequest::for_call(Arc::clone(&self.service), mode, ctx, msg);

        ctx.mark_sent();
        let armed = if mode == DispatchMode::SendOnly {
            None
        } else {
            ctx.backup_request_mut()
        };
        let race = armed.and_then(|state| {
            let backup_endpoint = state.addrs()?.1.clone();
            Some((backup_endpoint, state))
        });
        let (result, served_by) = match race {
            Some((backup_endpoint, state)) => {
                let delay = Duration::from_millis(u64::from(state.delay_ms()));
                let outcome = backup::race(
                    self.dispatcher.clone(),
                    request,
                    backup_endpoint,
                    delay,
                    state,
                    Arc::clone(&self.stats),
                )
                .await;
                (outcome.result, outcome.endpoint)
            }
            None => {
                let result = self
                    .dispatcher
                    .clone()
                    .oneshot(request)
                    .await
                    .map(DispatchResponse::into_bytes);
                (result, endpoint.clone())
            }
        };
        ctx.mark_received();

        if served_by != endpoint {
            ctx.set_selected_endpoint(served_by);
        }
        result
    }

    /// Parses the response and turns server-reported codes into the status.
    fn decode(&self, ctx: &mut RequestContext, wire: Bytes) -> Result<Payload, Status> {
        let response = self.codec.decode_response(ctx, wire)?;
        ctx.set_rsp_trans_info(response.trans_info);
        if response.ret != 0 || response.func_ret != 0 {
            return Err(Status::new(response.ret, response.func_ret, response.error_msg));
        }
        if ctx.is_transparent() {
            return Ok(Payload::Bytes(response.body));
        }
        deserialize(response.body, response.encode_type, ctx.rsp_encode_data_type())
            .map_err(|e| Status::from_kind(ErrorKind::DecodeError, e.to_string()))
    }

    /// Status for a rejected pre point: the rejecting filter's own status
    /// if it set one, `FilterRejected` otherwise.
    fn rejected(&self, ctx: &RequestContext, point: FilterPoint) -> Status {
        self.stats.record_rejected();
        if ctx.status().is_ok() {
            Status::from_kind(ErrorKind::FilterRejected, format!("rejected by filter at {point:?}"))
        } else {
            ctx.status().clone()
        }
    }

    /// Reconciles the stage result with the status post hooks left behind.
    fn finish<T>(&self, ctx: &mut RequestContext, result: Result<T, Status>) -> Result<T, Status> {
        let status = ctx.status().clone();
        let outcome = match result {
            Ok(value) if status.is_ok() => Ok(value),
            Err(err) if status.is_ok() => Err(err),
            _ => Err(status),
        };
        if let Err(status) = &outcome {
            ctx.set_status(status.clone());
            self.stats.record_failure(status);
            tracing::debug!(
                code = status.framework_code(),
                func_code = status.func_code(),
                message = status.message(),
                "call failed"
            );
        }
        ctx.mark_completed();
        outcome
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service)
            .field("codec", &self.codec.name())
            .field("selector", &self.selector.name())
            .field("transport", &self.transport.name())
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Status for a call refused by the lifecycle gate.
fn refuse(ctx: &mut RequestContext) -> Status {
    let status = Status::from(RuntimeError::NotReady);
    ctx.set_status(status.clone());
    status
}

/// Runs `fut` unless the call is cancelled first.
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Status::from_kind(ErrorKind::Cancelled, "call cancelled")),
        result = fut => result,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
