//! Per-connection framing and capture bookkeeping shared by the two relay
//! pumps. One instance per connection, guarded by the relay's mutex; no
//! suspension point ever holds it.

use bytes::{Buf, BytesMut};
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::MAX_BUFFER_SIZE;

#[derive(Debug)]
pub struct RelayState {
	/// Raw bytes of the in-flight request, from its first header byte.
	pub request_buffer: BytesMut,
	/// Raw bytes of the in-flight response.
	pub response_buffer: BytesMut,
	/// Request headers parsed and a capture record emitted.
	pub has_request: bool,
	/// Response headers parsed.
	pub has_response: bool,
	/// Full size of the request message once its framing is known;
	/// `reset_for_next_request` keeps everything strictly beyond it.
	pub request_message_size: Option<usize>,
	pub response_message_size: Option<usize>,
	/// Sticky: the response body is known to be finished (size reached or
	/// terminal chunk observed).
	pub response_body_complete: bool,
	pub request_header_end: usize,
	pub request_is_chunked: bool,
	/// Method of the in-flight request, for the response no-body rules.
	pub request_method: Option<String>,
	/// Zero for the first request on the connection; incremented by each
	/// reset. Keeps record IDs distinct across keep-alive messages.
	pub request_count: u64,
	/// Record the in-flight response will be attached to.
	pub current_flow_id: Uuid,
	/// When the in-flight request was captured, for response duration.
	pub request_started: Option<Instant>,
	root_id: Uuid,
}

impl RelayState {
	pub fn new(root_id: Uuid) -> Self {
		Self {
			request_buffer: BytesMut::new(),
			response_buffer: BytesMut::new(),
			has_request: false,
			has_response: false,
			request_message_size: None,
			response_message_size: None,
			response_body_complete: false,
			request_header_end: 0,
			request_is_chunked: false,
			request_method: None,
			request_count: 0,
			current_flow_id: root_id,
			request_started: None,
			root_id,
		}
	}

	/// The record ID for the request being parsed right now: the
	/// connection's root record first, a fresh ID for every keep-alive
	/// request after it.
	pub fn allocate_flow_id(&mut self) -> Uuid {
		let id = if self.request_count == 0 {
			self.root_id
		} else {
			Uuid::new_v4()
		};
		self.current_flow_id = id;
		id
	}

	pub fn root_id(&self) -> Uuid {
		self.root_id
	}

	/// Append to the request buffer. Appends that would cross the cap are
	/// dropped whole; the caller decides whether that ends the relay.
	#[must_use]
	pub fn append_request(&mut self, data: &[u8]) -> bool {
		append_capped(&mut self.request_buffer, data)
	}

	#[must_use]
	pub fn append_response(&mut self, data: &[u8]) -> bool {
		append_capped(&mut self.response_buffer, data)
	}

	/// Roll the connection over to its next keep-alive message. Bytes
	/// strictly beyond each message size are pipelined data for the next
	/// exchange and stay in the buffers; everything at or before is gone.
	pub fn reset_for_next_request(&mut self) {
		consume_message(&mut self.request_buffer, self.request_message_size);
		consume_message(&mut self.response_buffer, self.response_message_size);

		self.has_request = false;
		self.has_response = false;
		self.request_message_size = None;
		self.response_message_size = None;
		self.response_body_complete = false;
		self.request_header_end = 0;
		self.request_is_chunked = false;
		self.request_method = None;
		self.request_started = None;
		self.request_count += 1;
	}
}

fn append_capped(buf: &mut BytesMut, data: &[u8]) -> bool {
	if buf.len() + data.len() > MAX_BUFFER_SIZE {
		return false;
	}
	buf.extend_from_slice(data);
	true
}

fn consume_message(buf: &mut BytesMut, message_size: Option<usize>) {
	match message_size {
		Some(size) if size < buf.len() => buf.advance(size),
		_ => buf.clear(),
	}
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
