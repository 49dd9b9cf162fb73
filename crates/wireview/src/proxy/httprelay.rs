//! The bidirectional HTTP/1.1 relay pump shared by the cleartext and MITM
//! paths. Bytes are forwarded verbatim in both directions; parsing rides
//! on copies in `RelayState` purely to cut capture records at message
//! boundaries. The byte pipe never stalls on the capture side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{ActivityTracker, ProxyError, Timeouts, deadline_guard};
use crate::capture::{
	BODY_PREVIEW_LIMIT, CaptureStore, CapturedFlow, CapturedRequest, CapturedResponse, FlowKind,
};
use crate::http::state::RelayState;
use crate::http::{self, ParsedResponse};
use crate::tls::session::{READ_CHUNK, TlsSession};
use crate::transport::TcpFlow;

/// One side a pump reads from. An empty chunk is EOF.
#[async_trait::async_trait]
pub trait ByteSource: Send {
	async fn read_chunk(&mut self) -> Result<Bytes, ProxyError>;
}

/// One side a pump writes to.
#[async_trait::async_trait]
pub trait ByteSink: Send {
	async fn write_chunk(&mut self, data: Bytes) -> Result<(), ProxyError>;
	/// Half-close after the final write. Best effort.
	async fn shutdown(&mut self);
}

pub struct FlowSource(pub Arc<dyn TcpFlow>);

#[async_trait::async_trait]
impl ByteSource for FlowSource {
	async fn read_chunk(&mut self) -> Result<Bytes, ProxyError> {
		Ok(self.0.read().await?)
	}
}

pub struct FlowSink(pub Arc<dyn TcpFlow>);

#[async_trait::async_trait]
impl ByteSink for FlowSink {
	async fn write_chunk(&mut self, data: Bytes) -> Result<(), ProxyError> {
		Ok(self.0.write(data).await?)
	}

	async fn shutdown(&mut self) {
		self.0.close_write();
	}
}

pub struct IoSource<R>(pub R);

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for IoSource<R> {
	async fn read_chunk(&mut self) -> Result<Bytes, ProxyError> {
		let mut buf = BytesMut::with_capacity(READ_CHUNK);
		self.0.read_buf(&mut buf).await?;
		Ok(buf.freeze())
	}
}

pub struct IoSink<W>(pub W);

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for IoSink<W> {
	async fn write_chunk(&mut self, data: Bytes) -> Result<(), ProxyError> {
		Ok(self.0.write_all(&data).await?)
	}

	async fn shutdown(&mut self) {
		let _ = self.0.shutdown().await;
	}
}

pub struct SessionSource(pub TlsSession);

#[async_trait::async_trait]
impl ByteSource for SessionSource {
	async fn read_chunk(&mut self) -> Result<Bytes, ProxyError> {
		Ok(self.0.read(READ_CHUNK).await?)
	}
}

pub struct SessionSink(pub TlsSession);

#[async_trait::async_trait]
impl ByteSink for SessionSink {
	async fn write_chunk(&mut self, data: Bytes) -> Result<(), ProxyError> {
		Ok(self.0.write(&data).await?)
	}

	async fn shutdown(&mut self) {
		self.0.close();
	}
}

/// Shared context for one relayed connection.
pub struct HttpRelayContext {
	pub store: Arc<CaptureStore>,
	pub state: Mutex<RelayState>,
	pub kind: FlowKind,
	pub scheme: &'static str,
	pub host: String,
	pub port: u16,
	pub process: String,
	/// Origin → client.
	pub bytes_in: AtomicU64,
	/// Client → origin.
	pub bytes_out: AtomicU64,
	close_after_write: AtomicBool,
	/// Set once the connection stops being HTTP (a 101 upgrade). From then
	/// on both pumps forward without parsing.
	opaque: AtomicBool,
	failure: Mutex<Option<String>>,
}

impl HttpRelayContext {
	pub fn new(
		store: Arc<CaptureStore>,
		kind: FlowKind,
		host: &str,
		port: u16,
		process: &str,
	) -> Self {
		let scheme = match kind {
			FlowKind::Https => "https",
			_ => "http",
		};
		Self {
			store,
			state: Mutex::new(RelayState::new(Uuid::new_v4())),
			kind,
			scheme,
			host: host.to_string(),
			port,
			process: process.to_string(),
			bytes_in: AtomicU64::new(0),
			bytes_out: AtomicU64::new(0),
			close_after_write: AtomicBool::new(false),
			opaque: AtomicBool::new(false),
			failure: Mutex::new(None),
		}
	}

	pub fn root_id(&self) -> Uuid {
		self.state.lock().root_id()
	}

	fn fail(&self, reason: impl Into<String>) {
		let mut failure = self.failure.lock();
		if failure.is_none() {
			*failure = Some(reason.into());
		}
	}

	/// Final record mutation for the connection.
	pub fn finish(&self) {
		self.store.complete_flow(
			self.root_id(),
			self.bytes_in.load(Ordering::Relaxed),
			self.bytes_out.load(Ordering::Relaxed),
			self.failure.lock().take(),
		);
	}

	fn url_for(&self, target: &str) -> String {
		if target.starts_with("http://") || target.starts_with("https://") {
			return target.to_string();
		}
		let default_port = match self.scheme {
			"https" => 443,
			_ => 80,
		};
		if self.port == default_port {
			format!("{}://{}{}", self.scheme, self.host, target)
		} else {
			format!("{}://{}:{}{}", self.scheme, self.host, self.port, target)
		}
	}
}

/// Run both pumps plus the deadline guard; whichever finishes first tears
/// the group down. Returns once the connection is fully drained or dead.
/// Callers do their own transport-specific cleanup afterwards.
pub async fn run_relay(
	ctx: &HttpRelayContext,
	mut client_src: impl ByteSource,
	mut client_sink: impl ByteSink,
	mut origin_src: impl ByteSource,
	mut origin_sink: impl ByteSink,
	timeouts: &Timeouts,
) {
	let activity = ActivityTracker::new();
	tokio::select! {
		result = pump_requests(ctx, &mut client_src, &mut origin_sink, &activity) => {
			if let Err(e) = result {
				debug!(host = %ctx.host, error = %e, "request pump ended");
			}
		},
		result = pump_responses(ctx, &mut origin_src, &mut client_sink, &activity) => {
			if let Err(e) = result {
				debug!(host = %ctx.host, error = %e, "response pump ended");
			}
		},
		reason = deadline_guard(&activity, timeouts) => {
			debug!(host = %ctx.host, %reason, "relay deadline fired");
		},
	}
	ctx.finish();
}

/// Client → origin: forward verbatim, capture request heads as they
/// complete. Requests pipelined behind an in-flight exchange stay buffered
/// (but forwarded) until the response pump resets the state.
async fn pump_requests(
	ctx: &HttpRelayContext,
	client: &mut impl ByteSource,
	origin: &mut impl ByteSink,
	activity: &ActivityTracker,
) -> Result<(), ProxyError> {
	loop {
		let chunk = client.read_chunk().await?;
		if chunk.is_empty() {
			trace!("client eof");
			origin.shutdown().await;
			return Ok(());
		}
		activity.touch();
		ctx
			.bytes_out
			.fetch_add(chunk.len() as u64, Ordering::Relaxed);

		if !ctx.opaque.load(Ordering::Acquire) {
			let mut state = ctx.state.lock();
			if !state.append_request(&chunk) {
				ctx.fail("request buffer overflow");
				return Err(ProxyError::BufferOverflow);
			}
			if !state.has_request
				&& let Err(e) = capture_request(ctx, &mut state)
			{
				ctx.fail(format!("malformed request: {e}"));
				return Err(e);
			}
		}

		origin.write_chunk(chunk).await?;
	}
}

/// Try to cut a request record out of the buffered bytes. No-op until the
/// head is complete.
fn capture_request(ctx: &HttpRelayContext, state: &mut RelayState) -> Result<(), ProxyError> {
	let Some(req) = http::parse_request(&state.request_buffer)? else {
		return Ok(());
	};

	state.has_request = true;
	state.request_header_end = req.header_end;
	state.request_is_chunked = req.is_chunked;
	state.request_message_size = req.message_size();
	state.request_method = Some(req.method.clone());
	state.request_started = Some(Instant::now());

	let id = state.allocate_flow_id();
	let root = state.root_id();

	let body = &state.request_buffer[req.header_end..];
	let preview = if req.is_chunked {
		let mut decoded = http::decode_chunked(body);
		decoded.truncate(BODY_PREVIEW_LIMIT);
		Bytes::from(decoded)
	} else {
		Bytes::copy_from_slice(&body[..body.len().min(BODY_PREVIEW_LIMIT)])
	};

	let mut record = CapturedFlow::new(ctx.kind, &ctx.host, ctx.port, &ctx.process);
	record.id = id;
	if id != root {
		record.parent_flow_id = Some(root);
	}
	record.request = Some(CapturedRequest {
		method: req.method.clone(),
		url: ctx.url_for(&req.target),
		http_version: req.version.as_str().to_string(),
		headers: req.headers.to_pairs(),
		body_size: body.len() as u64,
		body_preview: preview,
	});
	ctx.store.add_flow(record);
	trace!(%id, method = %req.method, "request captured");
	Ok(())
}

/// Origin → client: forward verbatim, decide response framing, attach the
/// response to its record when the body completes, then roll the state
/// over for the next keep-alive exchange.
async fn pump_responses(
	ctx: &HttpRelayContext,
	origin: &mut impl ByteSource,
	client: &mut impl ByteSink,
	activity: &ActivityTracker,
) -> Result<(), ProxyError> {
	// Head of the in-flight response; owned by this pump only.
	let mut pending: Option<ParsedResponse> = None;

	loop {
		let chunk = match origin.read_chunk().await {
			Ok(c) => c,
			Err(e) => {
				finalize_on_eof(ctx, &mut pending);
				client.shutdown().await;
				return Err(e);
			},
		};
		if chunk.is_empty() {
			// Connection-close framing: an unframed response is complete
			// exactly when the origin hangs up (RFC 7230 §3.3.3).
			finalize_on_eof(ctx, &mut pending);
			client.shutdown().await;
			return Ok(());
		}
		activity.touch();
		ctx
			.bytes_in
			.fetch_add(chunk.len() as u64, Ordering::Relaxed);

		if !ctx.opaque.load(Ordering::Acquire) {
			let mut state = ctx.state.lock();
			if !state.append_response(&chunk) {
				ctx.fail("response buffer overflow");
				return Err(ProxyError::BufferOverflow);
			}

			// One chunk can carry the tail of the current exchange plus any
			// number of pipelined responses; drain them all.
			loop {
				if state.has_request && !state.has_response && pending.is_none() {
					let method = state.request_method.clone();
					match http::parse_response(&state.response_buffer, method.as_deref()) {
						Ok(Some(resp)) => {
							state.has_response = true;
							state.response_message_size = resp.message_size();
							if !resp.has_body {
								state.response_body_complete = true;
							}
							pending = Some(resp);
						},
						Ok(None) => break,
						Err(e) => {
							ctx.fail(format!("malformed response: {e}"));
							return Err(e.into());
						},
					}
				}

				if let Some(resp) = pending.as_ref()
					&& !state.response_body_complete
				{
					let complete = response_complete(&state.response_buffer, resp);
					state.response_body_complete = complete;
				}

				if !state.response_body_complete {
					break;
				}
				let Some(resp) = pending.take() else {
					break;
				};
				attach_response(ctx, &mut state, &resp);
				if resp.status == 101 {
					// Switching Protocols: whatever follows is not HTTP.
					// Keep relaying, stop parsing.
					debug!(host = %ctx.host, "connection upgraded, relaying opaquely");
					ctx.opaque.store(true, Ordering::Release);
					break;
				}
				if resp.should_close {
					ctx.close_after_write.store(true, Ordering::Release);
					break;
				}
				state.reset_for_next_request();
				// A fully pipelined request may already be sitting in the
				// leftover; capture it now rather than waiting for more
				// client bytes.
				if let Err(e) = capture_request(ctx, &mut state) {
					ctx.fail(format!("malformed request: {e}"));
					return Err(e);
				}
				if !state.has_request {
					break;
				}
			}
		}

		client.write_chunk(chunk).await?;
		if ctx.close_after_write.load(Ordering::Acquire) {
			client.shutdown().await;
			return Ok(());
		}
	}
}

fn response_complete(buffer: &[u8], resp: &ParsedResponse) -> bool {
	if let Some(size) = resp.message_size() {
		return buffer.len() >= size;
	}
	if resp.is_chunked {
		return http::is_chunked_body_complete(&buffer[resp.header_end.min(buffer.len())..]);
	}
	// Unframed: only connection close ends it.
	false
}

/// Attach the completed response to the in-flight record.
fn attach_response(ctx: &HttpRelayContext, state: &mut RelayState, resp: &ParsedResponse) {
	let buffer = &state.response_buffer;
	let end = resp
		.message_size()
		.map(|s| s.min(buffer.len()))
		.unwrap_or(buffer.len());
	let body = &buffer[resp.header_end.min(end)..end];

	let preview = if resp.is_chunked {
		let mut decoded = http::decode_chunked(body);
		decoded.truncate(BODY_PREVIEW_LIMIT);
		Bytes::from(decoded)
	} else {
		Bytes::copy_from_slice(&body[..body.len().min(BODY_PREVIEW_LIMIT)])
	};

	let duration_ms = state
		.request_started
		.map(|t| t.elapsed().as_millis() as u64)
		.unwrap_or(0);

	let request_body_size = state
		.request_message_size
		.unwrap_or(state.request_buffer.len())
		.saturating_sub(state.request_header_end) as u64;

	let captured = CapturedResponse {
		status: resp.status,
		reason: resp.reason.clone(),
		http_version: resp.version.as_str().to_string(),
		headers: resp.headers.to_pairs(),
		body_size: body.len() as u64,
		body_preview: preview,
		duration_ms,
	};
	ctx
		.store
		.update_flow(state.current_flow_id, captured, Some(request_body_size));
	state.response_body_complete = true;
	trace!(id = %state.current_flow_id, status = resp.status, "response captured");
}

/// EOF arrived from the origin. If an unframed response was in flight, the
/// close is its terminator; capture it with the bytes received so far.
fn finalize_on_eof(ctx: &HttpRelayContext, pending: &mut Option<ParsedResponse>) {
	let mut state = ctx.state.lock();
	if let Some(resp) = pending.take() {
		if state.has_request && !state.response_body_complete && !resp.has_framing() {
			attach_response(ctx, &mut state, &resp);
		}
	} else if state.has_request && !state.has_response {
		warn!(host = %ctx.host, "origin closed before response head");
	}
}

#[cfg(test)]
#[path = "httprelay_tests.rs"]
mod tests;
