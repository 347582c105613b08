//! Per-call request context threaded through every stage of the client pipeline.
//!
//! A context belongs to exactly one logical call. It is mutated by the proxy,
//! the filter chain, the selector and the backup-request coordinator, and is
//! discarded once the call completes (or the stream closes).

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::filter_point::{FilterPoint, NUM_POINT_PAIRS};
use crate::payload::{DataType, EncodeType, Payload};
use crate::status::{ErrorKind, Status};

/// Process-wide request id source. Ids start at 1.
static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Shape of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallType {
    #[default]
    Unary,
    OneWay,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl CallType {
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::ClientStreaming | Self::ServerStreaming | Self::BidiStreaming
        )
    }
}

/// Externally observable lifecycle of a context.
///
/// `Created -> Filled -> (Sent -> Received)* -> Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Filled,
    Sent,
    Received,
    Completed,
}

/// Resolved destination of a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub is_ipv6: bool,
    /// Free-form selector metadata (weight, set name, ...).
    pub metadata: BTreeMap<String, String>,
    pub target_service_name: String,
}

impl Endpoint {
    /// Creates an endpoint, detecting IPv6 from the address text.
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        let is_ipv6 = ip.contains(':');
        Self {
            ip,
            port,
            is_ipv6,
            metadata: BTreeMap::new(),
            target_service_name: String::new(),
        }
    }

    /// Parses `"ip:port"` or `"[v6]:port"`.
    #[must_use]
    pub fn parse(addr: &str) -> Option<Self> {
        let socket: SocketAddr = addr.parse().ok()?;
        Some(Self::from(socket))
    }

    /// Renders the endpoint as a socket address string.
    #[must_use]
    pub fn address(&self) -> String {
        if self.is_ipv6 {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(socket: SocketAddr) -> Self {
        let is_ipv6 = matches!(socket.ip(), IpAddr::V6(_));
        Self {
            ip: socket.ip().to_string(),
            port: socket.port(),
            is_ipv6,
            metadata: BTreeMap::new(),
            target_service_name: String::new(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Backup-request state, present only while backup mode is armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    delay_ms: u32,
    addrs: Option<(Endpoint, Endpoint)>,
    resend_count: u32,
    success_node_index: i8,
}

impl BackupRequest {
    fn new(delay_ms: u32) -> Self {
        Self {
            delay_ms,
            addrs: None,
            resend_count: 0,
            success_node_index: -1,
        }
    }

    #[must_use]
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// `(primary, backup)` once both destinations are known.
    #[must_use]
    pub fn addrs(&self) -> Option<&(Endpoint, Endpoint)> {
        self.addrs.as_ref()
    }

    pub fn set_addrs(&mut self, primary: Endpoint, backup: Endpoint) {
        self.addrs = Some((primary, backup));
    }

    /// How many times the backup destination was actually sent to.
    #[must_use]
    pub fn resend_count(&self) -> u32 {
        self.resend_count
    }

    pub fn increment_resend_count(&mut self) {
        self.resend_count += 1;
    }

    /// `0` primary won, `1` backup won, `-1` nobody succeeded.
    #[must_use]
    pub fn success_node_index(&self) -> i8 {
        self.success_node_index
    }

    pub fn set_success_node_index(&mut self, index: i8) {
        self.success_node_index = index;
    }
}

/// Errors from misusing the context setters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("backup request delay must be set before backup addresses")]
    BackupDelayNotSet,
}

/// Default timeout when neither the caller nor the proxy configured one.
pub const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// Computes the effective timeout from the caller's budget and the proxy's
/// configured timeout.
///
/// A missing side is ignored; both missing falls back to
/// [`DEFAULT_TIMEOUT_MS`].
#[must_use]
pub fn compose_timeout(
    context_timeout_ms: Option<u32>,
    proxy_timeout_ms: Option<u32>,
    ignores_proxy_timeout: bool,
) -> u32 {
    match (context_timeout_ms, proxy_timeout_ms) {
        (None, None) => DEFAULT_TIMEOUT_MS,
        (Some(ctx), None) => ctx,
        (None, Some(proxy)) => proxy,
        (Some(ctx), Some(_)) if ignores_proxy_timeout => ctx,
        (Some(ctx), Some(proxy)) => ctx.min(proxy),
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

/// Mutable per-call record.
pub struct RequestContext {
    request_id: Option<u32>,
    call_type: CallType,
    state: ContextState,

    timeout_ms: Option<u32>,
    timeout_set_at: Option<Instant>,
    uses_full_link_timeout: bool,
    ignores_proxy_timeout: bool,

    req_encode_type: Option<EncodeType>,
    req_encode_data_type: Option<DataType>,
    rsp_encode_type: Option<EncodeType>,
    rsp_encode_data_type: Option<DataType>,
    req_compress_type: u8,
    req_compress_level: u8,
    rsp_compress_type: u8,
    rsp_compress_level: u8,

    status: Status,
    endpoint: Option<Endpoint>,
    explicit_endpoint: bool,
    backup_request: Option<BackupRequest>,

    filter_exec_index: [i8; NUM_POINT_PAIRS],
    filter_data: HashMap<String, Box<dyn Any + Send>>,

    caller_name: String,
    callee_name: String,
    func_name: String,
    transparent: bool,
    stream_id: Option<u32>,
    req_trans_info: BTreeMap<String, String>,
    rsp_trans_info: BTreeMap<String, String>,

    begin_timestamp_us: u64,
    send_timestamp_us: u64,
    recv_timestamp_us: u64,
    end_timestamp_us: u64,
}

impl RequestContext {
    /// Creates an empty context in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: None,
            call_type: CallType::Unary,
            state: ContextState::Created,
            timeout_ms: None,
            timeout_set_at: None,
            uses_full_link_timeout: false,
            ignores_proxy_timeout: false,
            req_encode_type: None,
            req_encode_data_type: None,
            rsp_encode_type: None,
            rsp_encode_data_type: None,
            req_compress_type: 0,
            req_compress_level: 0,
            rsp_compress_type: 0,
            rsp_compress_level: 0,
            status: Status::ok(),
            endpoint: None,
            explicit_endpoint: false,
            backup_request: None,
            filter_exec_index: [-1; NUM_POINT_PAIRS],
            filter_data: HashMap::new(),
            caller_name: String::new(),
            callee_name: String::new(),
            func_name: String::new(),
            transparent: false,
            stream_id: None,
            req_trans_info: BTreeMap::new(),
            rsp_trans_info: BTreeMap::new(),
            begin_timestamp_us: 0,
            send_timestamp_us: 0,
            recv_timestamp_us: 0,
            end_timestamp_us: 0,
        }
    }

    /// Convenience constructor for a call to `func` with a timeout.
    #[must_use]
    pub fn with_timeout(func: impl Into<String>, timeout_ms: u32) -> Self {
        let mut ctx = Self::new();
        ctx.set_func_name(func);
        ctx.set_timeout(timeout_ms);
        ctx
    }

    // -- identity -----------------------------------------------------------

    #[must_use]
    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    /// Assigns an explicit request id. Ignored if one is already assigned.
    pub fn set_request_id(&mut self, id: u32) -> bool {
        if let Some(existing) = self.request_id {
            tracing::warn!(existing, ignored = id, "request id already assigned");
            return false;
        }
        self.request_id = Some(id);
        true
    }

    /// Assigns the next process-wide id unless one is already present, and
    /// returns the id in effect.
    pub fn assign_request_id(&mut self) -> u32 {
        *self
            .request_id
            .get_or_insert_with(|| NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn set_call_type(&mut self, call_type: CallType) {
        self.call_type = call_type;
    }

    #[must_use]
    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    pub fn set_caller_name(&mut self, name: impl Into<String>) {
        self.caller_name = name.into();
    }

    #[must_use]
    pub fn callee_name(&self) -> &str {
        &self.callee_name
    }

    pub fn set_callee_name(&mut self, name: impl Into<String>) {
        self.callee_name = name.into();
    }

    #[must_use]
    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    pub fn set_func_name(&mut self, name: impl Into<String>) {
        self.func_name = name.into();
    }

    // -- lifecycle ----------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// `Created -> Filled`. Stamps the begin timestamp.
    pub fn mark_filled(&mut self) {
        self.state = ContextState::Filled;
        self.begin_timestamp_us = now_us();
    }

    pub fn mark_sent(&mut self) {
        self.state = ContextState::Sent;
        self.send_timestamp_us = now_us();
    }

    pub fn mark_received(&mut self) {
        self.state = ContextState::Received;
        self.recv_timestamp_us = now_us();
    }

    pub fn mark_completed(&mut self) {
        self.state = ContextState::Completed;
        self.end_timestamp_us = now_us();
    }

    #[must_use]
    pub fn begin_timestamp_us(&self) -> u64 {
        self.begin_timestamp_us
    }

    #[must_use]
    pub fn send_timestamp_us(&self) -> u64 {
        self.send_timestamp_us
    }

    #[must_use]
    pub fn recv_timestamp_us(&self) -> u64 {
        self.recv_timestamp_us
    }

    #[must_use]
    pub fn end_timestamp_us(&self) -> u64 {
        self.end_timestamp_us
    }

    // -- timeouts -----------------------------------------------------------

    /// Sets an explicit per-call timeout, starting the budget now.
    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = Some(timeout_ms);
        self.timeout_set_at = Some(Instant::now());
    }

    /// Clamps the timeout to `min(remaining, timeout_ms)` and switches to
    /// full-link mode.
    pub fn set_full_link_timeout(&mut self, timeout_ms: u32) {
        let clamped = self
            .remaining_timeout_ms()
            .map_or(timeout_ms, |current| current.min(timeout_ms));
        self.set_timeout(clamped);
        self.uses_full_link_timeout = true;
    }

    /// The configured timeout as last set, ignoring elapsed time.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u32> {
        self.timeout_ms
    }

    /// Budget left: the timeout minus the time elapsed since it was set.
    #[must_use]
    pub fn remaining_timeout_ms(&self) -> Option<u32> {
        let timeout = self.timeout_ms?;
        let Some(set_at) = self.timeout_set_at else {
            return Some(timeout);
        };
        let elapsed = u32::try_from(set_at.elapsed().as_millis()).unwrap_or(u32::MAX);
        Some(timeout.saturating_sub(elapsed))
    }

    #[must_use]
    pub fn uses_full_link_timeout(&self) -> bool {
        self.uses_full_link_timeout
    }

    #[must_use]
    pub fn ignores_proxy_timeout(&self) -> bool {
        self.ignores_proxy_timeout
    }

    pub fn set_ignore_proxy_timeout(&mut self, ignore: bool) {
        self.ignores_proxy_timeout = ignore;
    }

    /// Combines the remaining budget with the proxy's timeout, stores the
    /// result as the new timeout and returns it.
    pub fn apply_proxy_timeout(&mut self, proxy_timeout_ms: Option<u32>) -> u32 {
        let effective = compose_timeout(
            self.remaining_timeout_ms(),
            proxy_timeout_ms,
            self.ignores_proxy_timeout,
        );
        self.set_timeout(effective);
        effective
    }

    /// The error kind reported when this context's budget expires.
    #[must_use]
    pub fn timeout_kind(&self) -> ErrorKind {
        if self.uses_full_link_timeout {
            ErrorKind::FullLinkTimeout
        } else {
            ErrorKind::Timeout
        }
    }

    /// A timeout status of the right kind for this context.
    #[must_use]
    pub fn timeout_status(&self, message: impl Into<String>) -> Status {
        Status::from_kind(self.timeout_kind(), message)
    }

    // -- encoding -----------------------------------------------------------

    /// Fills encode and data types left unset from the request payload.
    /// Response types default to the request's.
    pub fn apply_payload_defaults(&mut self, payload: &Payload) {
        let data_type = *self
            .req_encode_data_type
            .get_or_insert_with(|| payload.data_type());
        let encode_type = *self
            .req_encode_type
            .get_or_insert_with(|| data_type.default_encode_type());
        self.rsp_encode_data_type.get_or_insert(data_type);
        self.rsp_encode_type.get_or_insert(encode_type);
    }

    #[must_use]
    pub fn req_encode_type(&self) -> EncodeType {
        self.req_encode_type.unwrap_or_default()
    }

    pub fn set_req_encode_type(&mut self, encode_type: EncodeType) {
        self.req_encode_type = Some(encode_type);
    }

    /// Whether the caller (or an earlier stage) chose the request encoding.
    #[must_use]
    pub fn has_req_encode_type(&self) -> bool {
        self.req_encode_type.is_some()
    }

    #[must_use]
    pub fn req_encode_data_type(&self) -> DataType {
        self.req_encode_data_type.unwrap_or_default()
    }

    pub fn set_req_encode_data_type(&mut self, data_type: DataType) {
        self.req_encode_data_type = Some(data_type);
    }

    #[must_use]
    pub fn rsp_encode_type(&self) -> EncodeType {
        self.rsp_encode_type.unwrap_or_else(|| self.req_encode_type())
    }

    pub fn set_rsp_encode_type(&mut self, encode_type: EncodeType) {
        self.rsp_encode_type = Some(encode_type);
    }

    #[must_use]
    pub fn rsp_encode_data_type(&self) -> DataType {
        self.rsp_encode_data_type
            .unwrap_or_else(|| self.req_encode_data_type())
    }

    pub fn set_rsp_encode_data_type(&mut self, data_type: DataType) {
        self.rsp_encode_data_type = Some(data_type);
    }

    /// `(type, level)` for the request direction.
    #[must_use]
    pub fn req_compress(&self) -> (u8, u8) {
        (self.req_compress_type, self.req_compress_level)
    }

    pub fn set_req_compress(&mut self, compress_type: u8, level: u8) {
        self.req_compress_type = compress_type;
        self.req_compress_level = level;
    }

    /// `(type, level)` for the response direction.
    #[must_use]
    pub fn rsp_compress(&self) -> (u8, u8) {
        (self.rsp_compress_type, self.rsp_compress_level)
    }

    pub fn set_rsp_compress(&mut self, compress_type: u8, level: u8) {
        self.rsp_compress_type = compress_type;
        self.rsp_compress_level = level;
    }

    #[must_use]
    pub fn is_transparent(&self) -> bool {
        self.transparent
    }

    /// Transparent forwarding: payload bytes bypass (de)serialization.
    pub fn set_transparent(&mut self, transparent: bool) {
        self.transparent = transparent;
    }

    #[must_use]
    pub fn req_trans_info(&self) -> &BTreeMap<String, String> {
        &self.req_trans_info
    }

    pub fn add_req_trans_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.req_trans_info.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn rsp_trans_info(&self) -> &BTreeMap<String, String> {
        &self.rsp_trans_info
    }

    pub fn set_rsp_trans_info(&mut self, info: BTreeMap<String, String>) {
        self.rsp_trans_info = info;
    }

    // -- status -------------------------------------------------------------

    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Last writer wins.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    // -- destination --------------------------------------------------------

    #[must_use]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Pins the destination; the selector is then skipped.
    pub fn set_addr(&mut self, ip: impl Into<String>, port: u16) {
        self.set_explicit_endpoint(Endpoint::new(ip, port));
    }

    /// Pins the destination; the selector is then skipped.
    pub fn set_explicit_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = Some(endpoint);
        self.explicit_endpoint = true;
    }

    /// Records the endpoint chosen by a selector or the backup race.
    pub fn set_selected_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = Some(endpoint);
    }

    #[must_use]
    pub fn has_explicit_endpoint(&self) -> bool {
        self.explicit_endpoint
    }

    #[must_use]
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = Some(stream_id);
    }

    // -- backup request -----------------------------------------------------

    /// Arms backup mode with the given delay. Must precede
    /// [`RequestContext::set_backup_request_addrs`].
    pub fn set_backup_request_delay(&mut self, delay_ms: u32) {
        self.backup_request = Some(BackupRequest::new(delay_ms));
    }

    /// Sets the two destinations of the race. The primary also becomes the
    /// pinned endpoint, so no selector lookup happens.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::BackupDelayNotSet` if the delay was not set first.
    pub fn set_backup_request_addrs(
        &mut self,
        primary: Endpoint,
        backup: Endpoint,
    ) -> Result<(), ContextError> {
        let Some(state) = self.backup_request.as_mut() else {
            return Err(ContextError::BackupDelayNotSet);
        };
        state.set_addrs(primary.clone(), backup);
        self.set_explicit_endpoint(primary);
        Ok(())
    }

    #[must_use]
    pub fn backup_request(&self) -> Option<&BackupRequest> {
        self.backup_request.as_ref()
    }

    pub fn backup_request_mut(&mut self) -> Option<&mut BackupRequest> {
        self.backup_request.as_mut()
    }

    /// Drops backup mode; the call proceeds as an ordinary unary call.
    pub fn disarm_backup_request(&mut self) {
        self.backup_request = None;
    }

    // -- filter bookkeeping -------------------------------------------------

    /// Exec index slot for the pair `point` belongs to.
    #[must_use]
    pub fn filter_exec_index(&self, point: FilterPoint) -> i8 {
        self.filter_exec_index[point.pair_index()]
    }

    pub fn set_filter_exec_index(&mut self, point: FilterPoint, index: i8) {
        self.filter_exec_index[point.pair_index()] = index;
    }

    /// Restores the slot for `point`'s pair to the "everyone ran" default.
    pub fn reset_filter_exec_index(&mut self, point: FilterPoint) {
        self.filter_exec_index[point.pair_index()] = -1;
    }

    /// Stores state a filter's pre-hook hands to its post-hook.
    pub fn set_filter_data<T: Any + Send>(&mut self, filter: &str, value: T) {
        self.filter_data.insert(filter.to_string(), Box::new(value));
    }

    #[must_use]
    pub fn filter_data<T: Any + Send>(&self, filter: &str) -> Option<&T> {
        self.filter_data.get(filter)?.downcast_ref::<T>()
    }

    pub fn filter_data_mut<T: Any + Send>(&mut self, filter: &str) -> Option<&mut T> {
        self.filter_data.get_mut(filter)?.downcast_mut::<T>()
    }

    /// Removes and returns a filter's data if it has type `T`.
    pub fn take_filter_data<T: Any + Send>(&mut self, filter: &str) -> Option<T> {
        let boxed = self.filter_data.remove(filter)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.filter_data.insert(filter.to_string(), other);
                None
            }
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("call_type", &self.call_type)
            .field("state", &self.state)
            .field("timeout_ms", &self.timeout_ms)
            .field("full_link", &self.uses_full_link_timeout)
            .field("status", &self.status)
            .field("endpoint", &self.endpoint)
            .field("backup_request", &self.backup_request)
            .field("filter_exec_index", &self.filter_exec_index)
            .field("filter_data_keys", &self.filter_data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
