use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use super::*;
use crate::capture::CaptureStore;
use crate::transport::memory::{MemoryTcpFlow, tcp_pair};

struct Harness {
	store: Arc<CaptureStore>,
	ctx: Arc<HttpRelayContext>,
	/// Test side of the client connection.
	client: Arc<MemoryTcpFlow>,
	/// Test side of the origin connection.
	origin: Arc<MemoryTcpFlow>,
	relay: JoinHandle<()>,
}

fn harness() -> Harness {
	harness_with_kind(FlowKind::Http, "example.com", 80)
}

fn harness_with_kind(kind: FlowKind, host: &str, port: u16) -> Harness {
	let store = Arc::new(CaptureStore::new());
	let ctx = Arc::new(HttpRelayContext::new(store.clone(), kind, host, port, "curl"));
	let (client_flow, client) = tcp_pair();
	let (origin_flow, origin) = tcp_pair();

	let relay_ctx = ctx.clone();
	let timeouts = crate::proxy::Timeouts::default();
	let relay = tokio::spawn(async move {
		run_relay(
			&relay_ctx,
			FlowSource(client_flow.clone()),
			FlowSink(client_flow),
			FlowSource(origin_flow.clone()),
			FlowSink(origin_flow),
			&timeouts,
		)
		.await;
	});

	Harness {
		store,
		ctx,
		client,
		origin,
		relay,
	}
}

async fn send(flow: &Arc<MemoryTcpFlow>, bytes: &[u8]) {
	flow.write(Bytes::copy_from_slice(bytes)).await.unwrap();
}

async fn recv_exactly(flow: &Arc<MemoryTcpFlow>, expected: &[u8]) {
	let mut got = Vec::new();
	while got.len() < expected.len() {
		let chunk = tokio::time::timeout(Duration::from_secs(5), flow.read())
			.await
			.expect("timed out waiting for relay bytes")
			.unwrap();
		assert!(!chunk.is_empty(), "eof before expected bytes");
		got.extend_from_slice(&chunk);
	}
	assert_eq!(got, expected);
}

const GET_ROOT: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
const OK_HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

#[tokio::test]
async fn get_with_content_length_is_captured() {
	let h = harness();

	send(&h.client, GET_ROOT).await;
	recv_exactly(&h.origin, GET_ROOT).await;

	// Record exists as soon as the request head lands.
	let root = h.ctx.root_id();
	let flow = h.store.flow(root).unwrap();
	let request = flow.request.as_ref().unwrap();
	assert_eq!(request.method, "GET");
	assert_eq!(request.url, "http://example.com/");
	assert_eq!(request.http_version, "HTTP/1.1");
	assert!(flow.response.is_none());

	send(&h.origin, OK_HELLO).await;
	recv_exactly(&h.client, OK_HELLO).await;

	let flow = h.store.flow(root).unwrap();
	let response = flow.response.as_ref().unwrap();
	assert_eq!(response.status, 200);
	assert_eq!(response.reason, "OK");
	assert_eq!(response.body_preview, Bytes::from_static(b"hello"));
	assert_eq!(response.body_size, 5);

	h.relay.abort();
}

#[tokio::test]
async fn keep_alive_pair_gets_two_records() {
	let h = harness();
	let root = h.ctx.root_id();

	send(&h.client, GET_ROOT).await;
	recv_exactly(&h.origin, GET_ROOT).await;
	send(&h.origin, OK_HELLO).await;
	recv_exactly(&h.client, OK_HELLO).await;

	let second = b"GET /two HTTP/1.1\r\nHost: example.com\r\n\r\n";
	send(&h.client, second).await;
	recv_exactly(&h.origin, second).await;
	send(&h.origin, OK_HELLO).await;
	recv_exactly(&h.client, OK_HELLO).await;

	// Two records with distinct IDs; the follow-up points at the root.
	let (_, flows) = h.store.get_flows_since(0);
	assert_eq!(flows.len(), 2);
	let second_rec = flows.iter().find(|f| f.id != root).unwrap();
	assert_eq!(second_rec.parent_flow_id, Some(root));
	assert_eq!(second_rec.request.as_ref().unwrap().url, "http://example.com/two");
	assert!(second_rec.response.is_some());
	assert_eq!(h.ctx.state.lock().request_count, 2);

	h.relay.abort();
}

#[tokio::test]
async fn pipelined_request_is_captured_after_response() {
	let h = harness();
	let root = h.ctx.root_id();

	// Both requests in one chunk. Bytes must flow to the origin at once;
	// the second record waits for the first response.
	let pipelined = [
		GET_ROOT,
		b"GET /second HTTP/1.1\r\nHost: example.com\r\n\r\n".as_slice(),
	]
	.concat();
	send(&h.client, &pipelined).await;
	recv_exactly(&h.origin, &pipelined).await;

	let (_, flows) = h.store.get_flows_since(0);
	assert_eq!(flows.len(), 1, "second request captured lazily");

	send(&h.origin, OK_HELLO).await;
	recv_exactly(&h.client, OK_HELLO).await;

	// First response attached; the pipelined request surfaced from the
	// leftover without any further client bytes.
	let (_, flows) = h.store.get_flows_since(0);
	assert_eq!(flows.len(), 2);
	let second = flows.iter().find(|f| f.id != root).unwrap();
	assert_eq!(second.request.as_ref().unwrap().url, "http://example.com/second");
	assert!(second.response.is_none());

	h.relay.abort();
}

#[tokio::test]
async fn both_pipelined_responses_in_one_chunk() {
	let h = harness();

	let pipelined = [GET_ROOT, b"GET /second HTTP/1.1\r\nHost: example.com\r\n\r\n".as_slice()].concat();
	send(&h.client, &pipelined).await;
	recv_exactly(&h.origin, &pipelined).await;

	// Origin answers both in a single segment.
	let responses = [OK_HELLO, b"HTTP/1.1 204 No Content\r\n\r\n".as_slice()].concat();
	send(&h.origin, &responses).await;
	recv_exactly(&h.client, &responses).await;

	let (_, flows) = h.store.get_flows_since(0);
	assert_eq!(flows.len(), 2);
	assert!(flows.iter().all(|f| f.response.is_some()));
	let no_content = flows
		.iter()
		.find(|f| f.response.as_ref().unwrap().status == 204)
		.unwrap();
	assert_eq!(no_content.response.as_ref().unwrap().body_size, 0);

	h.relay.abort();
}

#[tokio::test]
async fn chunked_response_completes_on_terminal_chunk() {
	let h = harness();
	let root = h.ctx.root_id();

	send(&h.client, GET_ROOT).await;
	recv_exactly(&h.origin, GET_ROOT).await;

	send(&h.origin, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").await;
	recv_exactly(&h.client, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").await;
	send(&h.origin, b"5\r\nhello\r\n").await;
	recv_exactly(&h.client, b"5\r\nhello\r\n").await;

	// Not complete yet.
	assert!(h.store.flow(root).unwrap().response.is_none());

	send(&h.origin, b"0\r\n\r\n").await;
	recv_exactly(&h.client, b"0\r\n\r\n").await;

	let flow = h.store.flow(root).unwrap();
	let response = flow.response.as_ref().unwrap();
	assert_eq!(response.status, 200);
	assert!(response.body_preview.starts_with(b"hello"));

	h.relay.abort();
}

#[tokio::test]
async fn unframed_response_completes_on_close() {
	let h = harness();
	let root = h.ctx.root_id();

	send(&h.client, b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").await;
	recv_exactly(&h.origin, b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").await;

	send(&h.origin, b"HTTP/1.0 200 OK\r\n\r\nold-sch").await;
	recv_exactly(&h.client, b"HTTP/1.0 200 OK\r\n\r\nold-sch").await;
	send(&h.origin, b"ool body").await;
	recv_exactly(&h.client, b"ool body").await;

	// No framing: still in flight.
	assert!(h.store.flow(root).unwrap().response.is_none());

	// FIN terminates the message.
	h.origin.close_write();
	tokio::time::timeout(Duration::from_secs(5), h.relay)
		.await
		.unwrap()
		.unwrap();

	let flow = h.store.flow(root).unwrap();
	let response = flow.response.as_ref().unwrap();
	assert_eq!(response.status, 200);
	assert_eq!(response.body_preview, Bytes::from_static(b"old-school body"));
	assert!(flow.end_ts.is_some());
}

#[tokio::test]
async fn head_response_completes_at_header_end() {
	let h = harness();
	let root = h.ctx.root_id();

	send(&h.client, b"HEAD / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
	recv_exactly(&h.origin, b"HEAD / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;

	// Content-Length describes the body a GET would have had; none
	// follows a HEAD.
	send(&h.origin, b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n").await;
	recv_exactly(&h.client, b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n").await;

	let flow = h.store.flow(root).unwrap();
	let response = flow.response.as_ref().unwrap();
	assert_eq!(response.status, 200);
	assert_eq!(response.body_size, 0);

	h.relay.abort();
}

#[tokio::test]
async fn connection_close_response_shuts_the_client_side() {
	let h = harness();

	send(&h.client, GET_ROOT).await;
	recv_exactly(&h.origin, GET_ROOT).await;

	let closing = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
	send(&h.origin, closing).await;
	recv_exactly(&h.client, closing).await;

	// The relay half-closes towards the client after the final write.
	let eof = tokio::time::timeout(Duration::from_secs(5), h.client.read())
		.await
		.unwrap()
		.unwrap();
	assert!(eof.is_empty());

	tokio::time::timeout(Duration::from_secs(5), h.relay)
		.await
		.unwrap()
		.unwrap();
}

#[tokio::test]
async fn oversized_append_fails_the_relay() {
	let h = harness();
	let root = h.ctx.root_id();

	// One chunk past the reassembly cap: dropped, relay shuts down with a
	// framing error on the record.
	let oversized = vec![b'x'; crate::transport::MAX_BUFFER_SIZE + 1];
	send(&h.client, &oversized).await;

	tokio::time::timeout(Duration::from_secs(5), h.relay)
		.await
		.unwrap()
		.unwrap();
	let flow = h.store.flow(root);
	// No request head ever parsed, so no record was added; the completion
	// is a no-op. The relay just dies cleanly.
	assert!(flow.is_none());
}

#[tokio::test]
async fn upgraded_connection_relays_opaquely() {
	let h = harness();
	let root = h.ctx.root_id();

	let upgrade = b"GET /socket HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
	send(&h.client, upgrade).await;
	recv_exactly(&h.origin, upgrade).await;

	let switch = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
	send(&h.origin, switch).await;
	recv_exactly(&h.client, switch).await;

	let flow = h.store.flow(root).unwrap();
	assert_eq!(flow.response.as_ref().unwrap().status, 101);

	// Frames after the upgrade are not HTTP and must pass untouched in
	// both directions without killing the relay.
	let frame = [0x82u8, 0x03, 0xde, 0xad, 0x01];
	send(&h.client, &frame).await;
	recv_exactly(&h.origin, &frame).await;
	send(&h.origin, &frame).await;
	recv_exactly(&h.client, &frame).await;

	// Still exactly one record, no error.
	let (_, flows) = h.store.get_flows_since(0);
	assert_eq!(flows.len(), 1);

	h.relay.abort();
}

#[tokio::test]
async fn https_context_builds_https_urls() {
	let h = harness_with_kind(FlowKind::Https, "example.com", 443);

	send(&h.client, GET_ROOT).await;
	recv_exactly(&h.origin, GET_ROOT).await;

	let flow = h.store.flow(h.ctx.root_id()).unwrap();
	assert_eq!(
		flow.request.as_ref().unwrap().url,
		"https://example.com/"
	);
	assert_eq!(flow.kind, FlowKind::Https);

	h.relay.abort();
}
