//! Shared fixtures for unit tests: an instrumented filter, a scripted
//! transport and a codec that always fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tailrpc_core::{
    Codec, CodecError, EncodeType, Endpoint, FilterPoint, FrameReader, FrameWriter, Payload,
    RequestContext, RequestEnvelope, ResponseEnvelope, StreamOptions, StreamPair, Transport,
    TransportError, TransportMessage,
};
use tokio::sync::mpsc;

use crate::codec::{serialize, MsgPackCodec};
use crate::filter::{Filter, FilterStatus, SharedFilter};

// ---------------------------------------------------------------------------
// CallLog / RecordingFilter
// ---------------------------------------------------------------------------

/// Ordered record of filter hook invocations, shared between filters.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
    post_codes: Arc<Mutex<Vec<i32>>>,
}

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Framework codes observed by post hooks, in invocation order.
    pub fn post_codes(&self) -> Vec<i32> {
        self.post_codes.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.post_codes.lock().clear();
    }
}

/// Filter that logs `{name}.pre` / `{name}.post` and optionally rejects on
/// pre points.
#[derive(Debug)]
pub struct RecordingFilter {
    name: String,
    points: Vec<FilterPoint>,
    log: CallLog,
    reject: bool,
    fail_init: bool,
}

impl RecordingFilter {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self::with_points(
            name,
            log,
            vec![FilterPoint::ClientPreRpcInvoke, FilterPoint::ClientPostRpcInvoke],
        )
    }

    pub fn with_points(name: &str, log: CallLog, points: Vec<FilterPoint>) -> Self {
        Self {
            name: name.to_string(),
            points,
            log,
            reject: false,
            fail_init: false,
        }
    }

    #[must_use]
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn shared(name: &str, log: CallLog) -> SharedFilter {
        Arc::new(Self::new(name, log))
    }

    pub fn shared_rejecting(name: &str, log: CallLog, reject: bool) -> SharedFilter {
        let filter = Self::new(name, log);
        if reject {
            Arc::new(filter.rejecting())
        } else {
            Arc::new(filter)
        }
    }
}

impl Filter for RecordingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn points(&self) -> Vec<FilterPoint> {
        self.points.clone()
    }

    fn init(&self) -> anyhow::Result<()> {
        self.log.push(format!("{}.init", self.name));
        if self.fail_init {
            anyhow::bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    fn invoke(&self, point: FilterPoint, ctx: &mut RequestContext) -> FilterStatus {
        if point.is_pre() {
            self.log.push(format!("{}.pre", self.name));
            if self.reject {
                return FilterStatus::Reject;
            }
        } else {
            self.log.push(format!("{}.post", self.name));
            self.log.post_codes.lock().push(ctx.status().framework_code());
        }
        FilterStatus::Continue
    }

    fn destroy(&self) {
        self.log.push(format!("{}.destroy", self.name));
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// What a scripted endpoint answers.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Reply with the request body, encoded as a successful response.
    Echo,
    /// Reply with these wire bytes.
    Reply(Bytes),
    Fail(TransportError),
}

/// Per-endpoint behaviour of [`MockTransport`].
#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    pub outcome: Outcome,
}

impl Script {
    pub fn echo(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            outcome: Outcome::Echo,
        }
    }

    pub fn reply(delay_ms: u64, wire: Bytes) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            outcome: Outcome::Reply(wire),
        }
    }

    pub fn fail(delay_ms: u64, err: TransportError) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            outcome: Outcome::Fail(err),
        }
    }
}

/// Decrements the in-progress counter however the send ends.
struct InProgress(Arc<AtomicUsize>);

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport whose endpoints answer from scripts. Unscripted endpoints echo
/// immediately.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, Script>>,
    targets: Mutex<Vec<String>>,
    stream_options: Mutex<Vec<StreamOptions>>,
    send_recv_calls: AtomicUsize,
    send_only_calls: AtomicUsize,
    completed: AtomicUsize,
    in_progress: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, endpoint: &str, script: Script) {
        self.scripts.lock().insert(endpoint.to_string(), script);
    }

    pub fn send_recv_calls(&self) -> usize {
        self.send_recv_calls.load(Ordering::SeqCst)
    }

    pub fn send_only_calls(&self) -> usize {
        self.send_only_calls.load(Ordering::SeqCst)
    }

    /// Sends that ran to the end of their script.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Sends currently sleeping in their script.
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Endpoint addresses in send order.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }

    pub fn stream_options(&self) -> Vec<StreamOptions> {
        self.stream_options.lock().clone()
    }

    fn script_for(&self, endpoint: &Endpoint) -> Script {
        self.scripts
            .lock()
            .get(&endpoint.address())
            .cloned()
            .unwrap_or_else(|| Script::echo(0))
    }

    fn echo(payload: &[u8]) -> Result<Bytes, TransportError> {
        let request = MsgPackCodec::decode_request(payload)
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = ResponseEnvelope {
            request_id: request.request_id,
            encode_type: request.encode_type,
            trans_info: request.trans_info,
            body: request.body,
            ..ResponseEnvelope::default()
        };
        MsgPackCodec::encode_response(&response).map_err(|e| TransportError::Network(e.to_string()))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send_recv(&self, msg: TransportMessage) -> Result<Bytes, TransportError> {
        self.send_recv_calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(msg.endpoint.address());
        let script = self.script_for(&msg.endpoint);

        self.in_progress.fetch_add(1, Ordering::SeqCst);
        let _in_progress = InProgress(Arc::clone(&self.in_progress));
        tokio::time::sleep(script.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);

        match script.outcome {
            Outcome::Echo => Self::echo(&msg.payload),
            Outcome::Reply(wire) => Ok(wire),
            Outcome::Fail(err) => Err(err),
        }
    }

    async fn send_only(&self, msg: TransportMessage) -> Result<(), TransportError> {
        self.send_only_calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(msg.endpoint.address());
        match self.script_for(&msg.endpoint).outcome {
            Outcome::Fail(err) => Err(err),
            Outcome::Echo | Outcome::Reply(_) => Ok(()),
        }
    }

    async fn create_stream(
        &self,
        endpoint: &Endpoint,
        options: StreamOptions,
    ) -> Result<StreamPair, TransportError> {
        if let Outcome::Fail(err) = self.script_for(endpoint).outcome {
            return Err(err);
        }
        self.stream_options.lock().push(options);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(StreamPair {
            writer: Box::new(LoopbackWriter { tx: Some(tx) }),
            reader: Box::new(LoopbackReader { rx }),
        })
    }
}

/// Writes frames straight into the paired reader.
struct LoopbackWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl FrameWriter for LoopbackWriter {
    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::Network("stream closed".into()))?;
        tx.send(frame)
            .map_err(|_| TransportError::Network("peer gone".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct LoopbackReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameReader for LoopbackReader {
    async fn read(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Wire bytes of a successful response carrying `payload`.
pub fn encoded_reply(request_id: u32, payload: &Payload, encode_type: EncodeType) -> Bytes {
    let response = ResponseEnvelope {
        request_id,
        encode_type,
        body: serialize(payload, encode_type).unwrap(),
        ..ResponseEnvelope::default()
    };
    MsgPackCodec::encode_response(&response).unwrap()
}

/// Wire bytes of a response reporting server-side failure codes.
pub fn encoded_error(ret: i32, func_ret: i32, message: &str) -> Bytes {
    let response = ResponseEnvelope {
        ret,
        func_ret,
        error_msg: message.to_string(),
        ..ResponseEnvelope::default()
    };
    MsgPackCodec::encode_response(&response).unwrap()
}

// ---------------------------------------------------------------------------
// FailingCodec
// ---------------------------------------------------------------------------

/// Codec that cannot frame or parse anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingCodec;

impl Codec for FailingCodec {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn encode_request(
        &self,
        _ctx: &RequestContext,
        _request: &RequestEnvelope,
    ) -> Result<Bytes, CodecError> {
        Err(CodecError::Encode("failing codec".into()))
    }

    fn decode_response(
        &self,
        _ctx: &RequestContext,
        _wire: Bytes,
    ) -> Result<ResponseEnvelope, CodecError> {
        Err(CodecError::Decode("failing codec".into()))
    }
}
