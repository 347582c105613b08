//! Streaming calls.
//!
//! Opening a stream runs the invoke-level filter pair around the open
//! handshake only. Frames then flow through the transport's stream halves,
//! wrapped in typed handles that (de)serialize payloads with the negotiated
//! encode type.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use tailrpc_core::{
    CallType, DataType, EncodeType, ErrorKind, FilterPoint, FrameReader, FrameWriter, Payload,
    RequestContext, Status, StreamOptions, StreamPair, DEFAULT_TIMEOUT_MS,
};
use tracing::Instrument;

use super::{refuse, ServiceProxy};
use crate::codec::serialization::effective_encode_type;
use crate::codec::{deserialize, serialize};
use crate::filter::FilterStatus;
use crate::runtime::lifecycle::InFlightGuard;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Sending half of a streaming call.
pub struct StreamWriter {
    inner: Box<dyn FrameWriter>,
    encode_type: EncodeType,
    timeout_kind: ErrorKind,
    _guard: Arc<InFlightGuard>,
}

impl StreamWriter {
    /// Serializes `payload` and writes it as one frame.
    ///
    /// # Errors
    ///
    /// Returns `EncodeError` if the payload cannot be serialized, or the
    /// transport's failure mapped to a status.
    pub async fn send(&mut self, payload: &Payload) -> Result<(), Status> {
        let encode_type = effective_encode_type(self.encode_type, payload);
        let frame = serialize(payload, encode_type)
            .map_err(|e| Status::from_kind(ErrorKind::EncodeError, e.to_string()))?;
        self.inner
            .write(frame)
            .await
            .map_err(|e| e.into_status_with(self.timeout_kind))
    }

    /// Half-closes the stream; the peer sees end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns the transport's failure mapped to a status.
    pub async fn finish(mut self) -> Result<(), Status> {
        self.inner
            .close()
            .await
            .map_err(|e| e.into_status_with(self.timeout_kind))
    }

    #[must_use]
    pub fn encode_type(&self) -> EncodeType {
        self.encode_type
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("encode_type", &self.encode_type)
            .finish_non_exhaustive()
    }
}

/// Receiving half of a streaming call.
pub struct StreamReader {
    inner: Box<dyn FrameReader>,
    encode_type: EncodeType,
    data_type: DataType,
    timeout_kind: ErrorKind,
    _guard: Arc<InFlightGuard>,
}

impl StreamReader {
    /// Reads and deserializes the next frame; `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Result<Payload, Status>> {
        let frame = match self.inner.read().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e.into_status_with(self.timeout_kind))),
        };
        Some(self.decode(frame))
    }

    fn decode(&self, frame: Bytes) -> Result<Payload, Status> {
        let encode_type = match (self.encode_type, self.data_type) {
            (EncodeType::Noop, data_type) => data_type.default_encode_type(),
            (encode_type, _) => encode_type,
        };
        deserialize(frame, encode_type, self.data_type)
            .map_err(|e| Status::from_kind(ErrorKind::DecodeError, e.to_string()))
    }

    /// Adapts the reader into a `Stream` of payloads.
    pub fn into_stream(self) -> impl Stream<Item = Result<Payload, Status>> + Send {
        stream::unfold(self, |mut reader| async move {
            let item = reader.recv().await?;
            Some((item, reader))
        })
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("encode_type", &self.encode_type)
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Opening
// ---------------------------------------------------------------------------

impl ServiceProxy {
    /// Opens a client-streaming call: many requests, one response.
    ///
    /// # Errors
    ///
    /// Returns the status of the first failing open stage.
    pub async fn client_streaming(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<(StreamWriter, StreamReader), Status> {
        self.open_stream(ctx, CallType::ClientStreaming, None).await
    }

    /// Opens a server-streaming call: sends `request`, then half-closes.
    ///
    /// # Errors
    ///
    /// Returns the status of the first failing open stage, or of sending
    /// the request frame.
    pub async fn server_streaming(
        &self,
        ctx: &mut RequestContext,
        request: &Payload,
    ) -> Result<StreamReader, Status> {
        let (mut writer, reader) = self
            .open_stream(ctx, CallType::ServerStreaming, Some(request))
            .await?;
        writer.send(request).await?;
        writer.finish().await?;
        Ok(reader)
    }

    /// Opens a bidirectional streaming call.
    ///
    /// # Errors
    ///
    /// Returns the status of the first failing open stage.
    pub async fn bidi_streaming(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<(StreamWriter, StreamReader), Status> {
        self.open_stream(ctx, CallType::BidiStreaming, None).await
    }

    async fn open_stream(
        &self,
        ctx: &mut RequestContext,
        call_type: CallType,
        first: Option<&Payload>,
    ) -> Result<(StreamWriter, StreamReader), Status> {
        let Some(guard) = self.lifecycle.try_enter() else {
            return Err(refuse(ctx));
        };
        ctx.set_call_type(call_type);
        let span = self.call_span(ctx);
        async {
            self.stats.record_call();
            if let Err(status) = self.fill_client_context(ctx, first) {
                return self.finish(ctx, Err(status));
            }

            let verdict = self.filters.run(FilterPoint::ClientPreRpcInvoke, ctx);
            let result = if verdict == FilterStatus::Reject {
                Err(self.rejected(ctx, FilterPoint::ClientPreRpcInvoke))
            } else {
                self.open_stages(ctx).await
            };

            if let Err(status) = &result {
                ctx.set_status(status.clone());
            }
            self.filters.run(FilterPoint::ClientPostRpcInvoke, ctx);
            let pair = self.finish(ctx, result)?;
            Ok(self.wrap(ctx, pair, guard))
        }
        .instrument(span)
        .await
    }

    async fn open_stages(&self, ctx: &mut RequestContext) -> Result<StreamPair, Status> {
        self.route(ctx).await?;
        let endpoint = ctx
            .endpoint()
            .cloned()
            .ok_or_else(|| Status::from_kind(ErrorKind::RouterError, "no endpoint selected"))?;

        let stream_id = match ctx.stream_id() {
            Some(id) => id,
            None => {
                let id = ctx.request_id().unwrap_or_default();
                ctx.set_stream_id(id);
                id
            }
        };
        let init_frame = self
            .codec
            .encode_request(ctx, &self.build_envelope(ctx, Bytes::new()))?;
        let budget = ctx.remaining_timeout_ms().unwrap_or(DEFAULT_TIMEOUT_MS);
        let options = StreamOptions {
            call_type: ctx.call_type(),
            stream_id,
            timeout: Duration::from_millis(u64::from(budget)),
            init_frame,
            metadata: ctx.req_trans_info().clone(),
        };

        tracing::debug!(endpoint = %endpoint, stream_id, "opening stream");
        ctx.mark_sent();
        let pair = self
            .transport
            .create_stream(&endpoint, options)
            .await
            .map_err(|e| e.into_status(ctx));
        ctx.mark_received();
        pair
    }

    fn wrap(
        &self,
        ctx: &RequestContext,
        pair: StreamPair,
        guard: InFlightGuard,
    ) -> (StreamWriter, StreamReader) {
        let guard = Arc::new(guard);
        let timeout_kind = ctx.timeout_kind();
        let writer = StreamWriter {
            inner: pair.writer,
            encode_type: ctx.req_encode_type(),
            timeout_kind,
            _guard: Arc::clone(&guard),
        };
        let reader = StreamReader {
            inner: pair.reader,
            encode_type: ctx.rsp_encode_type(),
            data_type: ctx.rsp_encode_data_type(),
            timeout_kind,
            _guard: guard,
        };
        (writer, reader)
    }
}
