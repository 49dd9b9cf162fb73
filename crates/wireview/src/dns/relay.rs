//! Port-53 handling: datagram relaying with inline DoH diversion, and the
//! TCP variant with its 2-byte length framing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::doh::DnsTransport;
use super::{AnswerInfo, QueryInfo, parse_answer, parse_query, synthesize_servfail};
use crate::capture::{CaptureStore, CapturedFlow, DnsQueryRecord, FlowKind};
use crate::proxy::{ActivityTracker, Timeouts, deadline_guard};
use crate::transport::{Datagram, HostPort, TcpFlow, UdpFlow};

/// Reassembly cap for the TCP DNS stream; an overrun resets the buffer.
const TCP_DNS_BUFFER_CAP: usize = 128 * 1024;

const UDP_RECV_SIZE: usize = 64 * 1024;

/// Datagram relay for a claimed UDP flow. Non-DNS datagrams are forwarded
/// through a per-destination socket pool with return pumps writing answers
/// back tagged with their originating endpoint; destination port 53 is
/// short-circuited through DoH and answered on the same flow.
pub async fn run_udp_relay(
	flow: Arc<dyn UdpFlow>,
	dns: Arc<dyn DnsTransport>,
	store: Arc<CaptureStore>,
	process: &str,
	timeouts: &Timeouts,
) {
	let bytes_in = Arc::new(AtomicU64::new(0));
	let bytes_out = Arc::new(AtomicU64::new(0));
	let activity = Arc::new(ActivityTracker::new());
	let mut pool: HashMap<HostPort, Arc<UdpSocket>> = HashMap::new();
	let mut pumps: Vec<JoinHandle<()>> = Vec::new();
	// The record is created on the first datagram, with its destination.
	let mut record_id = None;

	let main = async {
		loop {
			let datagrams = match flow.read_datagrams().await {
				Ok(d) if !d.is_empty() => d,
				_ => return,
			};
			for datagram in datagrams {
				activity.touch();
				bytes_out.fetch_add(datagram.payload.len() as u64, Ordering::Relaxed);
				if record_id.is_none() {
					let record = CapturedFlow::new(
						FlowKind::Udp,
						&datagram.endpoint.host,
						datagram.endpoint.port,
						process,
					);
					record_id = Some(store.add_flow(record));
				}

				if datagram.endpoint.port == 53 {
					answer_dns_datagram(&flow, &dns, &store, &bytes_in, process, datagram).await;
					continue;
				}

				let socket = match upstream_socket(
					&mut pool,
					&mut pumps,
					&datagram.endpoint,
					&flow,
					&bytes_in,
					&activity,
				)
				.await
				{
					Some(socket) => socket,
					None => continue,
				};
				if let Err(e) = socket.send(&datagram.payload).await {
					debug!(endpoint = %datagram.endpoint, error = %e, "udp forward failed");
				}
			}
		}
	};

	tokio::select! {
		_ = main => {},
		reason = deadline_guard(&activity, timeouts) => {
			debug!(%reason, "udp relay deadline fired");
		},
	}

	for pump in pumps {
		pump.abort();
	}
	if let Some(id) = record_id {
		store.complete_flow(
			id,
			bytes_in.load(Ordering::Relaxed),
			bytes_out.load(Ordering::Relaxed),
			None,
		);
	}
	flow.close();
}

/// Find or create the pooled socket for `endpoint`, spawning its return
/// pump on creation.
async fn upstream_socket(
	pool: &mut HashMap<HostPort, Arc<UdpSocket>>,
	pumps: &mut Vec<JoinHandle<()>>,
	endpoint: &HostPort,
	flow: &Arc<dyn UdpFlow>,
	bytes_in: &Arc<AtomicU64>,
	activity: &Arc<ActivityTracker>,
) -> Option<Arc<UdpSocket>> {
	if let Some(socket) = pool.get(endpoint) {
		return Some(socket.clone());
	}
	let addr = match tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
		.await
		.ok()
		.and_then(|mut addrs| addrs.next())
	{
		Some(addr) => addr,
		None => {
			debug!(%endpoint, "udp destination did not resolve");
			return None;
		},
	};
	let socket = match UdpSocket::bind("0.0.0.0:0").await {
		Ok(socket) => Arc::new(socket),
		Err(e) => {
			debug!(%endpoint, error = %e, "udp socket bind failed");
			return None;
		},
	};
	if let Err(e) = socket.connect(addr).await {
		debug!(%endpoint, error = %e, "udp connect failed");
		return None;
	}

	pumps.push(tokio::spawn(return_pump(
		socket.clone(),
		endpoint.clone(),
		flow.clone(),
		bytes_in.clone(),
		activity.clone(),
	)));
	pool.insert(endpoint.clone(), socket.clone());
	Some(socket)
}

/// Writes every datagram a pooled socket receives back to the client
/// flow, tagged with the endpoint it came from.
async fn return_pump(
	socket: Arc<UdpSocket>,
	endpoint: HostPort,
	flow: Arc<dyn UdpFlow>,
	bytes_in: Arc<AtomicU64>,
	activity: Arc<ActivityTracker>,
) {
	let mut buf = vec![0u8; UDP_RECV_SIZE];
	loop {
		let n = match socket.recv(&mut buf).await {
			Ok(n) => n,
			Err(_) => return,
		};
		activity.touch();
		bytes_in.fetch_add(n as u64, Ordering::Relaxed);
		let datagram = Datagram {
			payload: Bytes::copy_from_slice(&buf[..n]),
			endpoint: endpoint.clone(),
		};
		if flow.write_datagrams(vec![datagram]).await.is_err() {
			return;
		}
	}
}

/// One inline DoH exchange for a port-53 datagram. A DNS record is always
/// emitted, success or not.
async fn answer_dns_datagram(
	flow: &Arc<dyn UdpFlow>,
	dns: &Arc<dyn DnsTransport>,
	store: &Arc<CaptureStore>,
	bytes_in: &Arc<AtomicU64>,
	process: &str,
	datagram: Datagram,
) {
	let started = Instant::now();
	let query = parse_query(&datagram.payload);

	let (payload, answer, encrypted) = match dns.doh_query(datagram.payload.clone()).await {
		Ok(answer) => {
			let info = parse_answer(&answer.message);
			(answer.message, info, answer.encrypted)
		},
		Err(e) => {
			warn!(error = %e, "doh failed, synthesizing servfail");
			let fail = Bytes::from(synthesize_servfail(&datagram.payload));
			let info = AnswerInfo {
				rcode: "SERVFAIL".to_string(),
				..Default::default()
			};
			(fail, Some(info), false)
		},
	};

	bytes_in.fetch_add(payload.len() as u64, Ordering::Relaxed);
	let reply = Datagram {
		payload,
		endpoint: datagram.endpoint,
	};
	if let Err(e) = flow.write_datagrams(vec![reply]).await {
		debug!(error = %e, "dns reply write failed");
	}

	emit_dns_record(
		store,
		process,
		query,
		answer,
		started.elapsed().as_millis() as u64,
		encrypted,
	);
}

fn emit_dns_record(
	store: &CaptureStore,
	process: &str,
	query: Option<QueryInfo>,
	answer: Option<AnswerInfo>,
	latency_ms: u64,
	encrypted: bool,
) {
	let query = query.unwrap_or_else(|| QueryInfo {
		id: 0,
		domain: String::new(),
		query_type: "UNKNOWN".to_string(),
	});
	let answer = answer.unwrap_or_default();
	store.record_dns_query(DnsQueryRecord {
		domain: query.domain,
		query_type: query.query_type,
		process_name: process.to_string(),
		rcode: answer.rcode,
		answers: answer.answers,
		ttl: answer.ttl,
		latency_ms,
		is_encrypted: encrypted,
		sequence_number: 0,
	});
}

/// Length-prefixed DNS over a TCP flow: each 2-byte big-endian framed
/// message runs through DoH and the answer goes back with the same
/// framing.
pub async fn run_tcp_dns(
	flow: Arc<dyn TcpFlow>,
	dns: Arc<dyn DnsTransport>,
	store: Arc<CaptureStore>,
	remote: &HostPort,
	process: &str,
	timeouts: &Timeouts,
) {
	let record = CapturedFlow::new(FlowKind::Dns, &remote.host, remote.port, process);
	let id = store.add_flow(record);
	let bytes_in = AtomicU64::new(0);
	let bytes_out = AtomicU64::new(0);
	let activity = ActivityTracker::new();

	let main = async {
		let mut buf = BytesMut::new();
		loop {
			let chunk = match flow.read().await {
				Ok(c) if !c.is_empty() => c,
				_ => return,
			};
			activity.touch();
			bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
			if buf.len() + chunk.len() > TCP_DNS_BUFFER_CAP {
				warn!("tcp dns buffer overrun, resetting");
				buf.clear();
				continue;
			}
			buf.extend_from_slice(&chunk);

			while buf.len() >= 2 {
				let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
				if buf.len() < 2 + length {
					break;
				}
				buf.advance(2);
				let message = buf.split_to(length).freeze();

				let started = Instant::now();
				let query = parse_query(&message);
				let (payload, answer, encrypted) = match dns.doh_query(message.clone()).await {
					Ok(answer) => {
						let info = parse_answer(&answer.message);
						(answer.message, info, answer.encrypted)
					},
					Err(e) => {
						warn!(error = %e, "doh failed on tcp dns, synthesizing servfail");
						let fail = Bytes::from(synthesize_servfail(&message));
						let info = AnswerInfo {
							rcode: "SERVFAIL".to_string(),
							..Default::default()
						};
						(fail, Some(info), false)
					},
				};

				let mut framed = BytesMut::with_capacity(2 + payload.len());
				framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
				framed.extend_from_slice(&payload);
				bytes_in.fetch_add(framed.len() as u64, Ordering::Relaxed);
				if flow.write(framed.freeze()).await.is_err() {
					return;
				}

				emit_dns_record(
					&store,
					process,
					query,
					answer,
					started.elapsed().as_millis() as u64,
					encrypted,
				);
			}
		}
	};

	tokio::select! {
		_ = main => {},
		reason = deadline_guard(&activity, timeouts) => {
			debug!(%reason, "tcp dns deadline fired");
		},
	}

	store.complete_flow(
		id,
		bytes_in.load(Ordering::Relaxed),
		bytes_out.load(Ordering::Relaxed),
		None,
	);
	flow.close_read();
	flow.close_write();
}
